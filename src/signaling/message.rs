//! Signaling wire format
//!
//! Every frame is a JSON object with a `type` discriminator. Inbound frames
//! are decoded once into [`ClientMessage`]; the original object is kept so
//! offer/answer/candidate payloads can be relayed untouched apart from the
//! injected counterpart id.

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Summary of one live broadcast as seen by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastSummary {
    pub broadcaster_id: String,
    pub broadcaster_name: String,
    pub start_time: DateTime<Utc>,
    pub viewer_count: u32,
    pub is_live: bool,
}

/// Client-to-relay message
///
/// Fields not listed here (`data`, `sdp`, ...) are ignored by the decoder
/// but preserved in [`Inbound`] for relaying.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartBroadcast,
    StopBroadcast,
    Offer {
        #[serde(default, deserialize_with = "lenient_id")]
        viewer_id: Option<String>,
    },
    Answer {
        #[serde(default, deserialize_with = "lenient_id")]
        broadcaster_id: Option<String>,
    },
    Candidate {
        #[serde(default, deserialize_with = "lenient_id")]
        viewer_id: Option<String>,
        #[serde(default, deserialize_with = "lenient_id")]
        broadcaster_id: Option<String>,
    },
    /// Echoed back by some broadcaster clients; carries no action
    OfferRequest,
    RequestStream {
        #[serde(default, deserialize_with = "lenient_id")]
        broadcaster_id: Option<String>,
    },
    ViewerJoin {
        #[serde(default, deserialize_with = "lenient_id")]
        broadcaster_id: Option<String>,
    },
    ViewerLeave {
        #[serde(default, deserialize_with = "lenient_id")]
        broadcaster_id: Option<String>,
    },
    GetBroadcastList,
    Ping,
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Wire name of the message type, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartBroadcast => "start_broadcast",
            Self::StopBroadcast => "stop_broadcast",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::OfferRequest => "offer_request",
            Self::RequestStream { .. } => "request_stream",
            Self::ViewerJoin { .. } => "viewer_join",
            Self::ViewerLeave { .. } => "viewer_leave",
            Self::GetBroadcastList => "get_broadcast_list",
            Self::Ping => "ping",
            Self::Unknown => "unknown",
        }
    }

    /// Messages that never mutate relay state
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Self::GetBroadcastList | Self::Ping | Self::OfferRequest | Self::Unknown
        )
    }
}

/// Ids may arrive as strings or numbers; numbers are normalised to their
/// decimal form and empty strings count as absent.
fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => {
            let id = if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                format!("{:.0}", n.as_f64().unwrap_or_default())
            };
            Ok(Some(id))
        }
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(de::Error::custom(format!("invalid id: {}", other))),
    }
}

/// A decoded inbound frame together with its original JSON body
#[derive(Debug, Clone)]
pub struct Inbound {
    pub message: ClientMessage,
    body: Value,
}

impl Inbound {
    /// Decode a text frame. Fails on invalid JSON, on non-object payloads and
    /// on a missing `type`; an unrecognised `type` decodes to
    /// [`ClientMessage::Unknown`].
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let body: Value = serde_json::from_str(text)?;
        if !body.is_object() {
            return Err(de::Error::custom("signaling frame must be a JSON object"));
        }
        let message = ClientMessage::deserialize(&body)?;
        Ok(Self { message, body })
    }

    /// The `type` string exactly as received
    pub fn raw_type(&self) -> &str {
        self.body.get("type").and_then(Value::as_str).unwrap_or_default()
    }

    /// Re-encode the original body with `key` set to `id`
    pub fn relay_with(mut self, key: &str, id: &str) -> String {
        if let Value::Object(map) = &mut self.body {
            map.insert(key.to_string(), Value::String(id.to_string()));
        }
        self.body.to_string()
    }
}

/// Relay-to-client message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Error {
        data: String,
    },
    Warning {
        data: String,
    },
    BroadcastStarted {
        broadcast: BroadcastSummary,
    },
    BroadcastEnded {
        broadcaster_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        broadcast: Option<BroadcastSummary>,
    },
    BroadcastList {
        broadcasts: Vec<BroadcastSummary>,
    },
    ViewerJoined {
        viewer_id: String,
        viewer_name: String,
        count: u32,
    },
    ViewerLeft {
        viewer_id: String,
        viewer_name: String,
        count: u32,
    },
    ViewerCountUpdate {
        #[serde(skip_serializing_if = "Option::is_none")]
        broadcaster_id: Option<String>,
        count: u32,
    },
    JoinConfirmed {
        broadcaster_id: String,
        broadcast: BroadcastSummary,
    },
    LeaveConfirmed {
        #[serde(skip_serializing_if = "Option::is_none")]
        broadcaster_id: Option<String>,
    },
    OfferRequest {
        viewer_id: String,
        viewer_name: String,
    },
    Pong {
        timestamp: String,
    },
}

impl ServerMessage {
    pub fn error(data: impl Into<String>) -> Self {
        Self::Error { data: data.into() }
    }

    pub fn warning(data: impl Into<String>) -> Self {
        Self::Warning { data: data.into() }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Wire name of the message type, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Error { .. } => "error",
            Self::Warning { .. } => "warning",
            Self::BroadcastStarted { .. } => "broadcast_started",
            Self::BroadcastEnded { .. } => "broadcast_ended",
            Self::BroadcastList { .. } => "broadcast_list",
            Self::ViewerJoined { .. } => "viewer_joined",
            Self::ViewerLeft { .. } => "viewer_left",
            Self::ViewerCountUpdate { .. } => "viewer_count_update",
            Self::JoinConfirmed { .. } => "join_confirmed",
            Self::LeaveConfirmed { .. } => "leave_confirmed",
            Self::OfferRequest { .. } => "offer_request",
            Self::Pong { .. } => "pong",
        }
    }
}
