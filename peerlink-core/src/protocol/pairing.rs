//! Pairing channel messages.
//!
//! ```text
//! Offering ──{"type":"hello","roomId"?,"signalingKey"?,...}──► Accepting
//! Offering ◄─{"type":"credential","roomId","signalingKey",...}─ Accepting
//! ```

use serde::{Deserialize, Serialize};

use crate::error::PeerError;

/// Sub-channel the pairing exchange runs on.
pub const SECRET_CHANNEL: &str = "secret";

/// Pairing protocol version carried in `hello`.
pub const PAIRING_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PairingMessage {
    Hello {
        /// Room the offering side wants to publish in, if isolated.
        #[serde(rename = "roomId", default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        #[serde(rename = "signalingKey", default, skip_serializing_if = "Option::is_none")]
        signaling_key: Option<String>,
        #[serde(rename = "userAgent")]
        user_agent: String,
        version: u32,
    },
    Credential {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "signalingKey")]
        signaling_key: String,
        token: String,
        #[serde(rename = "userAgent")]
        user_agent: String,
    },
}

impl PairingMessage {
    pub fn to_json(&self) -> Result<String, PeerError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, PeerError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn hello_omits_absent_suggestions() {
        let hello = PairingMessage::Hello {
            room_id: None,
            signaling_key: None,
            user_agent: "peerlink/test".into(),
            version: PAIRING_VERSION,
        };
        let v = serde_json::to_value(&hello).unwrap();
        assert_eq!(v, json!({"type": "hello", "userAgent": "peerlink/test", "version": 1}));
    }

    #[test]
    fn credential_round_trips() {
        let raw = r#"{"type":"credential","roomId":"room:abc","signalingKey":"k","token":"t","userAgent":"ua"}"#;
        let msg = PairingMessage::from_json(raw).unwrap();
        assert!(matches!(msg, PairingMessage::Credential { ref room_id, .. } if room_id == "room:abc"));
    }
}
