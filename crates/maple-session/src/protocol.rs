//! Signaling wire protocol.
//!
//! Every message is a JSON object whose `msg` field names its kind. The client
//! receives `offer` and `candidate` and sends `answer` and `candidate`.

use maple_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::IceCandidate;

/// Outbound signaling message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum SignalingMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
}

impl SignalingMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Inbound signaling message, decoded once at the channel boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Offer(String),
    Candidate(IceCandidate),
    /// Any other `msg` value, or none at all. Carries the tag for logging.
    Unknown(Option<String>),
}

#[derive(Deserialize)]
struct OfferBody {
    sdp: String,
}

#[derive(Deserialize)]
struct CandidateBody {
    candidate: IceCandidate,
}

/// Decode one inbound text frame.
///
/// Unknown tags are not errors. Malformed JSON, or a known tag with missing
/// fields, is.
pub fn decode_inbound(text: &str) -> Result<Inbound> {
    let value: Value = serde_json::from_str(text)?;
    let tag = value.get("msg").and_then(Value::as_str).map(str::to_owned);

    match tag.as_deref() {
        Some("offer") => {
            let body: OfferBody = serde_json::from_value(value)
                .map_err(|e| Error::protocol(format!("offer: {e}")))?;
            Ok(Inbound::Offer(body.sdp))
        }
        Some("candidate") => {
            let body: CandidateBody = serde_json::from_value(value)
                .map_err(|e| Error::protocol(format!("candidate: {e}")))?;
            Ok(Inbound::Candidate(body.candidate))
        }
        _ => Ok(Inbound::Unknown(tag)),
    }
}
