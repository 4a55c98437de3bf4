//! Session Broker Client
//!
//! The broker is the backend endpoint that holds the long-lived API secret and
//! mints short-lived credentials for one realtime session. The core only ever
//! sees the result: a bearer token and the URL the offer must be posted to.

use crate::error::BrokerError;
use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;
use tracing::{debug, instrument};

/// Short-lived credential for a single connection attempt.
///
/// The token is kept behind [`SecretString`] so it is redacted from `Debug`
/// output and never ends up in logs.
#[derive(Debug)]
pub struct SessionCredential {
    pub token: SecretString,
    pub negotiation_url: String,
}

impl SessionCredential {
    pub fn new(token: impl Into<String>, negotiation_url: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            negotiation_url: negotiation_url.into(),
        }
    }
}

/// Defines the contract for obtaining a session credential.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionBroker: Send + Sync {
    /// Requests a fresh credential. Called at most once per `start()` attempt.
    async fn acquire_session(&self) -> Result<SessionCredential, BrokerError>;
}

/// A [`SessionBroker`] that fetches credentials from an HTTP endpoint with `GET`.
pub struct HttpSessionBroker {
    client: reqwest::Client,
    endpoint: String,
    default_negotiation_url: Option<String>,
    default_model: Option<String>,
}

impl HttpSessionBroker {
    /// Creates a broker client.
    ///
    /// # Arguments
    ///
    /// * `client` - Shared HTTP client.
    /// * `endpoint` - URL of the broker endpoint, e.g. `http://localhost:3000/api/realtime-token`.
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            default_negotiation_url: None,
            default_model: None,
        }
    }

    /// Base URL used when the broker payload does not name a negotiation URL.
    /// A `model` field in the payload is appended as `?model=<model>`.
    pub fn with_default_negotiation_url(mut self, url: impl Into<String>) -> Self {
        self.default_negotiation_url = Some(url.into());
        self
    }

    /// Model used in the derived negotiation URL when the payload names none.
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }
}

#[async_trait]
impl SessionBroker for HttpSessionBroker {
    #[instrument(name = "acquire_session", skip(self), fields(endpoint = %self.endpoint))]
    async fn acquire_session(&self) -> Result<SessionCredential, BrokerError> {
        let response = self.client.get(&self.endpoint).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(BrokerError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let credential = parse_credential(
            &body,
            self.default_negotiation_url.as_deref(),
            self.default_model.as_deref(),
        )?;
        debug!(negotiation_url = %credential.negotiation_url, "Session credential acquired.");
        Ok(credential)
    }
}

#[derive(Deserialize)]
struct BrokerPayload {
    token: Option<String>,
    client_secret: Option<ClientSecret>,
    #[serde(alias = "negotiationUrl", alias = "ws_url")]
    negotiation_url: Option<String>,
    model: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ClientSecret {
    Plain(String),
    Wrapped { value: String },
}

/// Extracts a credential from a successful broker response body.
fn parse_credential(
    body: &str,
    default_negotiation_url: Option<&str>,
    default_model: Option<&str>,
) -> Result<SessionCredential, BrokerError> {
    let payload: BrokerPayload = serde_json::from_str(body)?;

    let token = payload
        .token
        .or(payload.client_secret.map(|secret| match secret {
            ClientSecret::Plain(value) | ClientSecret::Wrapped { value } => value,
        }))
        .filter(|token| !token.is_empty())
        .ok_or(BrokerError::MissingCredential)?;

    let negotiation_url = match (payload.negotiation_url, default_negotiation_url) {
        (Some(url), _) if !url.is_empty() => url,
        (_, Some(base)) => match payload.model.as_deref().or(default_model) {
            Some(model) => format!("{}?model={}", base, model),
            None => base.to_string(),
        },
        _ => return Err(BrokerError::MissingNegotiationUrl),
    };

    Ok(SessionCredential::new(token, negotiation_url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_parse_flat_payload() {
        let body = r#"{"token":"ek_123","negotiation_url":"https://rtc.example/v1"}"#;
        let credential = parse_credential(body, None, None).unwrap();
        assert_eq!(credential.token.expose_secret(), "ek_123");
        assert_eq!(credential.negotiation_url, "https://rtc.example/v1");
    }

    #[test]
    fn test_parse_aliases() {
        let body = r#"{"token":"ek_1","ws_url":"https://rtc.example/ws"}"#;
        let credential = parse_credential(body, None, None).unwrap();
        assert_eq!(credential.negotiation_url, "https://rtc.example/ws");

        let body = r#"{"token":"ek_2","negotiationUrl":"https://rtc.example/camel"}"#;
        let credential = parse_credential(body, None, None).unwrap();
        assert_eq!(credential.negotiation_url, "https://rtc.example/camel");
    }

    #[test]
    fn test_parse_realtime_session_payload() {
        // Shape of a realtime session object relayed verbatim by the broker.
        let body = r#"{
            "id": "sess_001",
            "model": "gpt-4o-mini-realtime-preview-2024-12-17",
            "voice": "alloy",
            "client_secret": {"value": "ek_abc", "expires_at": 1234567890}
        }"#;
        let credential =
            parse_credential(body, Some("https://api.openai.com/v1/realtime"), None).unwrap();
        assert_eq!(credential.token.expose_secret(), "ek_abc");
        assert_eq!(
            credential.negotiation_url,
            "https://api.openai.com/v1/realtime?model=gpt-4o-mini-realtime-preview-2024-12-17"
        );
    }

    #[test]
    fn test_parse_plain_client_secret_without_model() {
        let body = r#"{"client_secret":"ek_plain"}"#;
        let credential = parse_credential(body, Some("https://rtc.example/base"), None).unwrap();
        assert_eq!(credential.token.expose_secret(), "ek_plain");
        assert_eq!(credential.negotiation_url, "https://rtc.example/base");
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        let err = parse_credential(r#"{"negotiation_url":"https://x"}"#, None, None).unwrap_err();
        assert!(matches!(err, BrokerError::MissingCredential));

        let err = parse_credential(r#"{"token":""}"#, None, None).unwrap_err();
        assert!(matches!(err, BrokerError::MissingCredential));

        let err = parse_credential(r#"{"token":"ek"}"#, None, None).unwrap_err();
        assert!(matches!(err, BrokerError::MissingNegotiationUrl));

        let err = parse_credential("<html>", None, None).unwrap_err();
        assert!(matches!(err, BrokerError::Malformed(_)));
    }

    #[test]
    fn test_default_model_fills_in_for_payload() {
        let base = Some("https://rtc.example/v1/realtime");

        let credential = parse_credential(r#"{"token":"ek"}"#, base, Some("m-default")).unwrap();
        assert_eq!(credential.negotiation_url, "https://rtc.example/v1/realtime?model=m-default");

        // The payload's own model wins.
        let credential =
            parse_credential(r#"{"token":"ek","model":"m-live"}"#, base, Some("m-default")).unwrap();
        assert_eq!(credential.negotiation_url, "https://rtc.example/v1/realtime?model=m-live");
    }

    #[tokio::test]
    async fn test_http_broker_success_and_upstream_error() {
        let (url, request) = crate::test_support::serve_once(
            "200 OK",
            r#"{"client_secret":{"value":"ek_live"},"model":"m-live"}"#,
        )
        .await;
        let broker = HttpSessionBroker::new(crate::test_support::client(), url)
            .with_default_negotiation_url("https://rtc.example/v1/realtime");
        let credential = broker.acquire_session().await.unwrap();
        assert_eq!(credential.token.expose_secret(), "ek_live");
        assert_eq!(credential.negotiation_url, "https://rtc.example/v1/realtime?model=m-live");
        assert!(request.await.unwrap().starts_with("GET /session"));

        let (url, _request) =
            crate::test_support::serve_once("500 Internal Server Error", "upstream down").await;
        let err = HttpSessionBroker::new(crate::test_support::client(), url)
            .acquire_session()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Upstream { status: 500, ref body } if body == "upstream down"
        ));
    }

    #[test]
    fn test_credential_debug_redacts_token() {
        let credential = SessionCredential::new("ek_secret", "https://rtc.example");
        let rendered = format!("{:?}", credential);
        assert!(!rendered.contains("ek_secret"));
        assert!(rendered.contains("https://rtc.example"));
    }
}
