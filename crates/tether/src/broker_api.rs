//! Broker HTTP surface
//!
//! Peer listing, lobby chat and whitelist registration are plain JSON POSTs
//! against the broker base URL. Failures are reported, never retried.

use crate::error::{TetherError, TetherResult};
use crate::transport::BrokerAddress;
use crate::whitelist::Whitelist;
use async_trait::async_trait;
use serde::Serialize;

/// Request/response collaborator for the broker's HTTP endpoints
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// `POST /peers`: identifiers of peers currently visible to us
    async fn active_peers(&self, address: &BrokerAddress, self_id: &str) -> TetherResult<Vec<String>>;

    /// `POST /lobby`: publish a chat message, returning the broker's acknowledgment
    async fn post_lobby(
        &self,
        address: &BrokerAddress,
        self_id: &str,
        message: &str,
    ) -> TetherResult<serde_json::Value>;

    /// `POST /whitelist`: tell the broker who may see and reach us
    async fn register_whitelist(
        &self,
        address: &BrokerAddress,
        self_id: &str,
        whitelist: &Whitelist,
    ) -> TetherResult<()>;
}

#[derive(Serialize)]
struct PeersRequest<'a> {
    id: &'a str,
}

#[derive(Serialize)]
struct LobbyRequest<'a> {
    id: &'a str,
    message: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WhitelistRequest<'a> {
    id: &'a str,
    peer_whitelist: &'a Whitelist,
}

/// [`BrokerApi`] over HTTP(S)
#[derive(Debug, Clone, Default)]
pub struct HttpBrokerApi {
    client: reqwest::Client,
}

impl HttpBrokerApi {
    /// Create a client with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured reqwest client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn post<B: Serialize + Sync>(
        &self,
        address: &BrokerAddress,
        endpoint: &'static str,
        body: &B,
    ) -> TetherResult<reqwest::Response> {
        let url = address.endpoint(endpoint);
        let request_failed = |e: reqwest::Error| TetherError::BrokerRequest {
            endpoint,
            reason: e.to_string(),
        };

        // `.json()` also sets `Content-Type: application/json`
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(request_failed)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TetherError::BrokerRequest {
                endpoint,
                reason: format!("broker responded with {status}"),
            });
        }

        tracing::debug!(url = %url, status = %status, "Broker request completed");
        Ok(response)
    }
}

#[async_trait]
impl BrokerApi for HttpBrokerApi {
    async fn active_peers(&self, address: &BrokerAddress, self_id: &str) -> TetherResult<Vec<String>> {
        let response = self
            .post(address, "/peers", &PeersRequest { id: self_id })
            .await?;
        response
            .json()
            .await
            .map_err(|e| TetherError::BrokerRequest {
                endpoint: "/peers",
                reason: format!("invalid peer list: {e}"),
            })
    }

    async fn post_lobby(
        &self,
        address: &BrokerAddress,
        self_id: &str,
        message: &str,
    ) -> TetherResult<serde_json::Value> {
        let response = self
            .post(address, "/lobby", &LobbyRequest { id: self_id, message })
            .await?;
        response
            .json()
            .await
            .map_err(|e| TetherError::BrokerRequest {
                endpoint: "/lobby",
                reason: format!("invalid acknowledgment: {e}"),
            })
    }

    async fn register_whitelist(
        &self,
        address: &BrokerAddress,
        self_id: &str,
        whitelist: &Whitelist,
    ) -> TetherResult<()> {
        self.post(
            address,
            "/whitelist",
            &WhitelistRequest {
                id: self_id,
                peer_whitelist: whitelist,
            },
        )
        .await?;
        Ok(())
    }
}
