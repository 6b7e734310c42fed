//! High-level client API.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::http::{FetchRequest, HttpResponse};
use crate::multiplexer::{ConnectionEvent, Multiplexer};
use crate::transport::Connector;
use crate::tunnel::Tunnel;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use wsmux_protocol::{Capabilities, HeaderMap};

/// High-level client for a wsmux server.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Client {
    mux: Arc<Multiplexer>,
}

impl Client {
    /// Creates a client for the configured server. The connection is opened
    /// by the first operation.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Ok(Self {
            mux: Arc::new(Multiplexer::new(config)?),
        })
    }

    /// Creates a client that connects through a custom connector.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            mux: Arc::new(Multiplexer::with_connector(config, connector)),
        }
    }

    /// Returns the underlying multiplexer.
    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    pub async fn capabilities(&self) -> Result<Capabilities, ClientError> {
        self.mux.capabilities().await
    }

    pub async fn fetch(&self, request: FetchRequest) -> Result<HttpResponse, ClientError> {
        self.mux.fetch(request).await
    }

    pub async fn get(&self, url: impl Into<String>) -> Result<HttpResponse, ClientError> {
        self.fetch(FetchRequest::get(url)).await
    }

    pub async fn post(
        &self,
        url: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Result<HttpResponse, ClientError> {
        self.fetch(FetchRequest::post(url, body)).await
    }

    /// GETs `url` and parses a successful response as JSON.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: impl Into<String>,
    ) -> Result<T, ClientError> {
        let response = self.get(url).await?;
        success(&response)?;
        response.json()
    }

    /// POSTs `body` as JSON and parses a successful response as JSON.
    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: impl Into<String>,
        body: &B,
    ) -> Result<T, ClientError> {
        let request = FetchRequest::new("POST", url)
            .with_header("accept", "application/json")
            .with_json(body)?;
        let response = self.fetch(request).await?;
        success(&response)?;
        response.json()
    }

    /// Opens a tunnel to a remote WebSocket endpoint.
    pub async fn connect(
        &self,
        url: &str,
        protocols: Vec<String>,
    ) -> Result<Tunnel, ClientError> {
        self.mux.connect(url, protocols, HeaderMap::new()).await
    }

    /// Opens a tunnel, sending extra headers with the upgrade request.
    pub async fn connect_with_headers(
        &self,
        url: &str,
        protocols: Vec<String>,
        headers: HeaderMap,
    ) -> Result<Tunnel, ClientError> {
        self.mux.connect(url, protocols, headers).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.mux.subscribe_events()
    }

    pub fn is_connected(&self) -> bool {
        self.mux.is_connected()
    }

    pub async fn close(&self) -> Result<(), ClientError> {
        self.mux.close().await
    }
}

fn success(response: &HttpResponse) -> Result<(), ClientError> {
    if response.is_success() {
        Ok(())
    } else {
        Err(ClientError::HttpStatus {
            status: response.status,
            status_text: response.status_text.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{capabilities, MockConnector};
    use serde_json::json;
    use wsmux_protocol::ResponseFrame;

    fn client() -> (Client, crate::testing::Peer) {
        let (connector, peer) = MockConnector::new(capabilities(256));
        let client = Client::with_connector(
            ClientConfig::new("http://relay.test/"),
            Arc::new(connector),
        );
        (client, peer)
    }

    #[test]
    fn test_new_rejects_bad_config() {
        assert!(matches!(
            Client::new(ClientConfig::new("gopher://relay.test/")),
            Err(ClientError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_post_json() {
        let (client, mut peer) = client();

        let server = tokio::spawn(async move {
            let (request, body) = peer.read_request().await;
            assert_eq!(request.headers["content-type"], "application/json");
            let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(value["name"], "widget");

            let reply = serde_json::to_vec(&json!({"id": 7, "name": "widget"})).unwrap();
            peer.respond(
                ResponseFrame::new(request.id, request.url, 201)
                    .with_header("content-type", "application/json"),
                Bytes::from(reply),
            )
            .await;
        });

        let created: serde_json::Value = client
            .post_json("https://api.example.com/items", &json!({"name": "widget"}))
            .await
            .unwrap();
        assert_eq!(created["id"], 7);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_get_json_error_status() {
        let (client, mut peer) = client();

        let server = tokio::spawn(async move {
            let (request, _) = peer.read_request().await;
            peer.respond(
                ResponseFrame::new(request.id, request.url, 404).with_status_text("Not Found"),
                Bytes::from_static(b"{}"),
            )
            .await;
        });

        let result: Result<serde_json::Value, _> =
            client.get_json("https://api.example.com/missing").await;
        assert!(matches!(
            result,
            Err(ClientError::HttpStatus { status: 404, .. })
        ));
        server.await.unwrap();
    }
}
