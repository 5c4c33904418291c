//! Short-lived TURN credentials

use crate::peer::IceServer;
use crate::{Error, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Response body of the credentials endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TurnCredentialsResponse {
    #[serde(default)]
    ice_servers: Vec<IceServer>,
}

/// Client for the TURN credentials endpoint
#[derive(Debug, Clone)]
pub struct TurnCredentialsClient {
    http: reqwest::Client,
    url: String,
}

impl TurnCredentialsClient {
    /// Client for `url` with a request timeout
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::HttpError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    /// Fetch ICE servers, authenticating with the session bearer token
    pub async fn fetch(&self, token: &str) -> Result<Vec<IceServer>> {
        let response = self
            .http
            .get(&self.url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::HttpError(format!("TURN credential request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| Error::HttpError(format!("TURN credential endpoint: {}", e)))?;

        let body: TurnCredentialsResponse = response
            .json()
            .await
            .map_err(|e| Error::HttpError(format!("Invalid TURN credential response: {}", e)))?;

        debug!("TURN endpoint returned {} ICE servers", body.ice_servers.len());
        Ok(body.ice_servers)
    }
}

/// Static servers plus whatever the endpoint returns
///
/// Any failure is logged and the static list is returned unchanged.
pub async fn augment_ice_servers(
    mut servers: Vec<IceServer>,
    client: Option<&TurnCredentialsClient>,
    token: &str,
) -> Vec<IceServer> {
    let Some(client) = client else {
        return servers;
    };

    match client.fetch(token).await {
        Ok(fetched) => {
            let added = fetched.len();
            for server in fetched {
                if !servers.contains(&server) {
                    servers.push(server);
                }
            }
            info!("Added {} ICE servers from TURN endpoint", added);
        }
        Err(e) => {
            warn!("TURN credentials unavailable, continuing without relay: {}", e);
        }
    }

    servers
}
