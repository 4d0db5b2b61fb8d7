//! Protocol messages.
//!
//! The handshake response and the frame envelopes exchanged once the
//! connection is live. Payloads are opaque JSON text; applications decode
//! them however they like.

use serde::{Deserialize, Serialize};

/// Handshake response returned by the server during negotiation.
///
/// `protocol_version` is kept as raw text so that a missing or malformed
/// version can be reported as a protocol mismatch instead of a decode error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationResponse {
    #[serde(default)]
    pub protocol_version: Option<String>,
    pub connection_id: String,
    pub connection_token: String,
    /// Seconds the server keeps connection state after the client drops.
    pub disconnect_timeout: f64,
    /// Seconds within which the server promises some liveness signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_timeout: Option<f64>,
}

/// Frames sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Handshake (first frame of a fresh connection).
    Negotiate(NegotiationResponse),
    /// Application payload.
    Data {
        #[serde(rename = "messageId")]
        message_id: Option<String>,
        payload: String,
    },
    /// Liveness signal, carries no payload.
    KeepAlive,
    /// Group membership changed.
    Groups {
        #[serde(rename = "groupsToken")]
        groups_token: String,
    },
}

/// Frames sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Application payload.
    Send { payload: String },
    /// The client is going away; the server may discard connection state.
    Abort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_response_from_json() {
        let json = r#"{
            "protocolVersion": "1.2",
            "connectionId": "c-1",
            "connectionToken": "tok",
            "disconnectTimeout": 30,
            "keepAliveTimeout": 10
        }"#;
        let resp: NegotiationResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.protocol_version.as_deref(), Some("1.2"));
        assert_eq!(resp.connection_id, "c-1");
        assert_eq!(resp.disconnect_timeout, 30.0);
        assert_eq!(resp.keep_alive_timeout, Some(10.0));
    }

    #[test]
    fn negotiation_response_optional_fields() {
        let json = r#"{"connectionId":"c","connectionToken":"t","disconnectTimeout":5.5}"#;
        let resp: NegotiationResponse = serde_json::from_str(json).unwrap();
        assert!(resp.protocol_version.is_none());
        assert!(resp.keep_alive_timeout.is_none());
    }

    #[test]
    fn server_frame_tags() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"data","messageId":"7","payload":"hi"}"#).unwrap();
        assert_eq!(
            frame,
            ServerFrame::Data {
                message_id: Some("7".into()),
                payload: "hi".into()
            }
        );

        let frame: ServerFrame = serde_json::from_str(r#"{"type":"keep_alive"}"#).unwrap();
        assert_eq!(frame, ServerFrame::KeepAlive);
    }

    #[test]
    fn client_frame_json() {
        let json = serde_json::to_string(&ClientFrame::Abort).unwrap();
        assert_eq!(json, r#"{"type":"abort"}"#);
    }
}
