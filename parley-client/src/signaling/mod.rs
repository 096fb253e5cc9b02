//! Signaling with the media server
//!
//! [`Signaling`] is the request/response seam the session manager talks
//! through; [`client::SignalingClient`] implements it over a framed stream.

pub mod client;

use async_trait::async_trait;

use parley_common::protocol::{
    Capabilities, ConsumerInfo, DtlsParameters, MediaKind, RtpParameters, SignalingRequest,
    SignalingResponse, TransportDirection, TransportInfo,
};

use crate::error::{PipelineError, PipelineResult};

pub use client::SignalingClient;

/// Turn a response of the wrong kind into an error
fn unexpected(response: SignalingResponse) -> PipelineError {
    match response {
        SignalingResponse::Error { message } => PipelineError::Signaling(message),
        other => PipelineError::Signaling(format!("Unexpected response: {:?}", other)),
    }
}

/// Request/response channel to the media server
///
/// Implementors provide [`Signaling::request`]; the typed helpers unwrap
/// the expected response and turn `Error` replies into
/// [`PipelineError::Signaling`].
#[async_trait]
pub trait Signaling: Send + Sync {
    async fn request(&self, request: SignalingRequest) -> PipelineResult<SignalingResponse>;

    async fn create_transport(
        &self,
        direction: TransportDirection,
        channel_id: &str,
    ) -> PipelineResult<TransportInfo> {
        let request = SignalingRequest::CreateTransport {
            direction,
            channel_id: channel_id.to_string(),
        };
        match self.request(request).await? {
            SignalingResponse::TransportCreated { transport } => Ok(transport),
            other => Err(unexpected(other)),
        }
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> PipelineResult<()> {
        let request = SignalingRequest::ConnectTransport {
            transport_id: transport_id.to_string(),
            dtls_parameters,
        };
        match self.request(request).await? {
            SignalingResponse::TransportConnected => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn create_producer(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        channel_id: &str,
    ) -> PipelineResult<String> {
        let request = SignalingRequest::CreateProducer {
            transport_id: transport_id.to_string(),
            kind,
            rtp_parameters,
            channel_id: channel_id.to_string(),
        };
        match self.request(request).await? {
            SignalingResponse::ProducerCreated { id } => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    async fn create_consumer(
        &self,
        transport_id: &str,
        producer_id: &str,
        client_capabilities: Capabilities,
        channel_id: &str,
    ) -> PipelineResult<ConsumerInfo> {
        let request = SignalingRequest::CreateConsumer {
            transport_id: transport_id.to_string(),
            producer_id: producer_id.to_string(),
            client_capabilities,
            channel_id: channel_id.to_string(),
        };
        match self.request(request).await? {
            SignalingResponse::ConsumerCreated { consumer } => Ok(consumer),
            other => Err(unexpected(other)),
        }
    }
}
