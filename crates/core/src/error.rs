//! Error taxonomy for session setup and steady-state operation.
//!
//! Setup errors ([`BrokerError`], [`MediaCaptureError`], [`NegotiationError`])
//! abort a `start()` attempt. [`ProtocolParseError`] and [`ToolDispatchError`]
//! are recoverable and only ever logged.

use thiserror::Error;

/// Credential acquisition from the session broker failed.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("session broker request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("session broker returned status {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("session broker payload is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("session broker payload has no credential")]
    MissingCredential,
    #[error("session broker payload has no negotiation URL")]
    MissingNegotiationUrl,
}

/// Local audio could not be captured (no device, permission denied, ...).
#[derive(Debug, Error)]
pub enum MediaCaptureError {
    #[error("no audio input device is available")]
    NoInputDevice,
    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),
    #[error("audio device error: {0}")]
    Device(String),
}

/// The offer/answer exchange failed or the transport was rejected.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("peer connection error: {0}")]
    Peer(String),
    #[error("negotiation endpoint rejected the offer with status {status}: {body}")]
    TransportRejected { status: u16, body: String },
    #[error("negotiation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid answer: {0}")]
    InvalidAnswer(String),
    #[error("no open connection to negotiate")]
    NotOpen,
}

/// An inbound control channel message could not be understood.
#[derive(Debug, Error)]
pub enum ProtocolParseError {
    #[error("message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has no string `type` field")]
    MissingType,
    #[error("malformed `{kind}` event: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A tool invocation could not be served as requested.
#[derive(Debug, Error)]
pub enum ToolDispatchError {
    #[error("no tool named `{0}` is registered")]
    UnknownTool(String),
    #[error("arguments for `{name}` are not valid JSON: {source}")]
    MalformedArguments {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Writing to the control channel failed inside the transport backend.
#[derive(Debug, Error)]
#[error("control channel send failed: {0}")]
pub struct ControlChannelError(pub String);

/// Why a `start()` attempt did not reach `Connected`.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Media(#[from] MediaCaptureError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("stop requested during startup")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let upstream = BrokerError::Upstream {
            status: 401,
            body: "{\"error\":\"bad key\"}".to_string(),
        };
        assert_eq!(
            upstream.to_string(),
            "session broker returned status 401: {\"error\":\"bad key\"}"
        );

        let rejected = NegotiationError::TransportRejected {
            status: 400,
            body: "bad sdp".to_string(),
        };
        assert_eq!(
            rejected.to_string(),
            "negotiation endpoint rejected the offer with status 400: bad sdp"
        );

        let unknown = ToolDispatchError::UnknownTool("unregistered_tool".to_string());
        assert_eq!(
            unknown.to_string(),
            "no tool named `unregistered_tool` is registered"
        );
    }

    #[test]
    fn test_start_error_is_transparent() {
        let err: StartError = MediaCaptureError::NoInputDevice.into();
        assert_eq!(err.to_string(), "no audio input device is available");
        assert!(matches!(err, StartError::Media(_)));
    }
}
