//! Capability negotiation.
//!
//! Before the WebSocket is opened the client issues one plain `GET` against
//! the server's base URL and reads the limits it must honor.

use crate::error::ClientError;
use std::time::Duration;
use tracing::debug;
use url::Url;
use wsmux_protocol::Capabilities;

/// Fetches capabilities from a server.
#[derive(Debug, Clone)]
pub struct Negotiator {
    http: reqwest::Client,
    base_url: Url,
}

impl Negotiator {
    pub fn new(base_url: Url, timeout: Duration, user_agent: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| ClientError::Negotiation(e.to_string()))?;

        Ok(Self { http, base_url })
    }

    /// Issues the negotiation request and validates the result.
    pub async fn negotiate(&self) -> Result<Capabilities, ClientError> {
        let url = http_url(&self.base_url)?;
        debug!(url = %url, "negotiating capabilities");

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ClientError::Negotiation(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Negotiation(format!(
                "server answered {}",
                status
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::Negotiation(e.to_string()))?;

        let caps = parse_capabilities(&body)?;
        debug!(
            max_packet_size = caps.max_packet_size,
            max_body_size = caps.max_body_size,
            request_timeout = caps.request_timeout_secs,
            "negotiated capabilities"
        );
        Ok(caps)
    }
}

/// Parses and validates a capabilities document.
pub fn parse_capabilities(body: &[u8]) -> Result<Capabilities, ClientError> {
    let caps: Capabilities = serde_json::from_slice(body)
        .map_err(|e| ClientError::Negotiation(format!("invalid capabilities: {}", e)))?;
    caps.validate()
        .map_err(|e| ClientError::Negotiation(e.to_string()))?;
    Ok(caps)
}

/// Maps the base URL onto the WebSocket scheme.
pub fn websocket_url(base: &Url) -> Result<Url, ClientError> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ClientError::InvalidUrl(format!(
                "unsupported scheme {:?} in {}",
                other, base
            )))
        }
    };
    swap_scheme(base, scheme)
}

/// Maps the base URL onto the HTTP scheme used for negotiation.
pub fn http_url(base: &Url) -> Result<Url, ClientError> {
    let scheme = match base.scheme() {
        "http" | "ws" => "http",
        "https" | "wss" => "https",
        other => {
            return Err(ClientError::InvalidUrl(format!(
                "unsupported scheme {:?} in {}",
                other, base
            )))
        }
    };
    swap_scheme(base, scheme)
}

// `Url::set_scheme` refuses to move between special and non-special schemes
// in some cases, so rebuild from the serialized form instead.
fn swap_scheme(base: &Url, scheme: &str) -> Result<Url, ClientError> {
    if base.scheme() == scheme {
        return Ok(base.clone());
    }
    let rest = &base.as_str()[base.scheme().len()..];
    Url::parse(&format!("{}{}", scheme, rest)).map_err(|e| ClientError::InvalidUrl(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPS: &str = r#"{
        "versions": [1],
        "requestTimeout": 30,
        "maxBodySize": 1048576,
        "maxInMessageSize": 65536,
        "maxPacketSize": 1024,
        "project": {"name": "relay", "version": "0.1.0"}
    }"#;

    #[test]
    fn test_parse_capabilities() {
        let caps = parse_capabilities(CAPS.as_bytes()).unwrap();
        assert_eq!(caps.max_packet_size, 1024);
        assert_eq!(caps.request_timeout(), Duration::from_secs(30));
        assert!(caps.maintainer.is_none());
    }

    #[test]
    fn test_parse_rejects_tiny_packet() {
        let body = CAPS.replace("\"maxPacketSize\": 1024", "\"maxPacketSize\": 18");
        assert!(matches!(
            parse_capabilities(body.as_bytes()),
            Err(ClientError::Negotiation(_))
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_version() {
        let body = CAPS.replace("\"versions\": [1]", "\"versions\": [7]");
        assert!(matches!(
            parse_capabilities(body.as_bytes()),
            Err(ClientError::Negotiation(_))
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_capabilities(b"<html>"),
            Err(ClientError::Negotiation(_))
        ));
        assert!(matches!(
            parse_capabilities(br#"{"versions": [1]}"#),
            Err(ClientError::Negotiation(_))
        ));
    }

    #[test]
    fn test_websocket_url_mapping() {
        let url = Url::parse("http://relay.local:8080/bare/").unwrap();
        assert_eq!(
            websocket_url(&url).unwrap().as_str(),
            "ws://relay.local:8080/bare/"
        );

        let url = Url::parse("https://relay.example.com/").unwrap();
        assert_eq!(
            websocket_url(&url).unwrap().as_str(),
            "wss://relay.example.com/"
        );

        let url = Url::parse("wss://relay.example.com/x").unwrap();
        assert_eq!(websocket_url(&url).unwrap(), url);

        let url = Url::parse("ftp://relay.example.com/").unwrap();
        assert!(matches!(
            websocket_url(&url),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_http_url_mapping() {
        let url = Url::parse("wss://relay.example.com/mux?x=1").unwrap();
        assert_eq!(
            http_url(&url).unwrap().as_str(),
            "https://relay.example.com/mux?x=1"
        );
    }
}
