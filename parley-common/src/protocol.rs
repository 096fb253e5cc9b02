//! Signaling protocol between the client and the media server
//!
//! All messages are sent as newline-delimited JSON. Requests and responses are
//! correlated by the envelope id; events are unsolicited and carry no id.
//!
//! Negotiation blobs (capabilities, DTLS and RTP parameters) are opaque to the
//! client pipeline. They are produced and consumed by the media engine and the
//! server, and only carried here.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Negotiation Blobs
// =============================================================================

/// Codec/RTP capability set advertised by the server or the client engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(pub serde_json::Value);

/// DTLS parameters produced by a transport when it first connects
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DtlsParameters(pub serde_json::Value);

/// RTP parameters of a producer or consumer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub serde_json::Value);

// =============================================================================
// Shared Types
// =============================================================================

/// Direction of a media transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Outbound transport carrying the local producer
    Send,
    /// Inbound transport carrying consumers of remote producers
    Recv,
}

impl std::fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportDirection::Send => write!(f, "send"),
            TransportDirection::Recv => write!(f, "recv"),
        }
    }
}

/// Media kind of a producer or consumer (only audio is supported)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Audio,
}

/// A producer already present in the room when a transport is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistingProducer {
    pub producer_id: String,
    pub peer_user_id: String,
}

/// Server reply to `CreateTransport`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    /// Server-side transport id
    pub id: String,
    /// Router capabilities the client engine must load before consuming
    pub server_capabilities: Capabilities,
    /// Producers already live in the room
    #[serde(default)]
    pub existing_producers: Vec<ExistingProducer>,
    /// ICE/DTLS parameters handed to the client engine unchanged
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Server reply to `CreateConsumer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: String,
    #[serde(default)]
    pub kind: MediaKind,
    pub producer_id: String,
    #[serde(default)]
    pub rtp_parameters: RtpParameters,
    pub peer_user_id: String,
}

// =============================================================================
// Messages
// =============================================================================

/// Client request messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum SignalingRequest {
    /// Create a send or receive transport for a channel
    CreateTransport {
        direction: TransportDirection,
        channel_id: String,
    },
    /// Complete the DTLS handshake of a transport
    ConnectTransport {
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },
    /// Register the local producer on a send transport
    CreateProducer {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        channel_id: String,
    },
    /// Subscribe to a remote producer on a receive transport
    CreateConsumer {
        transport_id: String,
        producer_id: String,
        client_capabilities: Capabilities,
        channel_id: String,
    },
}

impl SignalingRequest {
    /// Short name of the request, for logging
    pub fn name(&self) -> &'static str {
        match self {
            SignalingRequest::CreateTransport { .. } => "CreateTransport",
            SignalingRequest::ConnectTransport { .. } => "ConnectTransport",
            SignalingRequest::CreateProducer { .. } => "CreateProducer",
            SignalingRequest::CreateConsumer { .. } => "CreateConsumer",
        }
    }
}

/// Server response messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum SignalingResponse {
    TransportCreated { transport: TransportInfo },
    TransportConnected,
    ProducerCreated { id: String },
    ConsumerCreated { consumer: ConsumerInfo },
    /// The request was rejected
    Error { message: String },
}

/// Unsolicited server events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum SignalingEvent {
    /// The local user joined a voice channel; transports should be set up
    SessionJoined { channel_id: String },
    /// The local user left voice; everything should be torn down
    SessionLeft,
    /// A peer started producing in the current channel
    NewProducer {
        peer_user_id: String,
        producer_id: String,
        channel_id: String,
    },
    /// A peer's producer went away
    ProducerClosed {
        peer_user_id: String,
        producer_id: String,
    },
}

/// One line on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Request { id: Uuid, body: SignalingRequest },
    Response { id: Uuid, body: SignalingResponse },
    Event { body: SignalingEvent },
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_transport_wire_format() {
        let request = SignalingRequest::CreateTransport {
            direction: TransportDirection::Recv,
            channel_id: "lobby".to_string(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"type": "CreateTransport", "direction": "recv", "channelId": "lobby"})
        );
    }

    #[test]
    fn test_transport_info_defaults() {
        let info: TransportInfo =
            serde_json::from_value(json!({"id": "t1", "serverCapabilities": {"codecs": []}}))
                .unwrap();
        assert_eq!(info.id, "t1");
        assert!(info.existing_producers.is_empty());
        assert_eq!(info.server_capabilities.0, json!({"codecs": []}));
    }

    #[test]
    fn test_event_parsing() {
        let event: SignalingEvent = serde_json::from_value(json!({
            "type": "NewProducer",
            "peerUserId": "alice",
            "producerId": "p1",
            "channelId": "lobby"
        }))
        .unwrap();
        assert_eq!(
            event,
            SignalingEvent::NewProducer {
                peer_user_id: "alice".to_string(),
                producer_id: "p1".to_string(),
                channel_id: "lobby".to_string(),
            }
        );
    }

    #[test]
    fn test_envelope_tagging() {
        let envelope = Envelope::Event {
            body: SignalingEvent::SessionLeft,
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value, json!({"kind": "event", "body": {"type": "SessionLeft"}}));
    }

    #[test]
    fn test_request_names() {
        let request = SignalingRequest::ConnectTransport {
            transport_id: "t1".to_string(),
            dtls_parameters: DtlsParameters::default(),
        };
        assert_eq!(request.name(), "ConnectTransport");
    }
}
