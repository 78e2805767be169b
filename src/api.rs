/*!
 # Heartbeat transport

 HTTP implementations of the collaborators the heartbeat scheduler
 consumes: an authenticated client for the liveness service and a
 reachability probe used before each report.
*/

use std::time::Duration;

use chrono::{DateTime, Local};
use serde_json::json;
use tracing::debug;

use crate::heartbeat::{Connectivity, HeartbeatClient};
use crate::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the liveness service. `connect` performs an
/// authenticated round trip so that a bad token or unreachable service
/// surfaces before any report is attempted.
pub struct ApiClient {
    url: String,
    token: String,
    session: Option<reqwest::Client>,
}

impl ApiClient {
    pub fn new(url: String, token: String) -> Self {
        Self {
            url,
            token,
            session: None,
        }
    }
}

impl HeartbeatClient for ApiClient {
    async fn connect(&mut self) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let resp = client
            .get(format!("{}/api/v1/devices/me", self.url))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Api(format!(
                "authentication failed: {}",
                resp.status()
            )));
        }
        self.session = Some(client);
        Ok(())
    }

    async fn send_heartbeat(&self, valid_until: DateTime<Local>) -> Result<()> {
        let Some(client) = &self.session else {
            return Err(Error::Api("no session established".into()));
        };
        let resp = client
            .post(format!("{}/api/v1/heartbeat", self.url))
            .bearer_auth(&self.token)
            .json(&json!({ "nextHeartbeat": valid_until.to_rfc3339() }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Api(format!("heartbeat rejected: {}", resp.status())));
        }
        Ok(())
    }
}

/// Reachability probe against the API host. `start` and `stop` are
/// lifecycle no-ops here; a modem-backed connection requester can slot
/// in behind the same trait.
pub struct HttpProbe {
    url: String,
}

impl HttpProbe {
    pub fn new(url: String) -> Self {
        Self { url }
    }
}

impl Connectivity for HttpProbe {
    fn start(&mut self) {}

    async fn wait_until_up(
        &mut self,
        timeout: Duration,
        retry_interval: Duration,
        max_retries: u32,
    ) -> Result<()> {
        for attempt in 1..=max_retries {
            let client = reqwest::Client::builder().timeout(timeout).build()?;
            match client.head(&self.url).send().await {
                // Any HTTP response at all proves the network is up.
                Ok(_) => return Ok(()),
                Err(err) => {
                    debug!("connectivity probe failed (attempt {attempt}/{max_retries}): {err}")
                }
            }
            if attempt < max_retries {
                tokio::time::sleep(retry_interval).await;
            }
        }
        Err(Error::NoConnectivity)
    }

    fn stop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_without_session_is_refused() {
        let client = ApiClient::new("http://localhost:1".into(), "token".into());
        let err = client.send_heartbeat(Local::now()).await.unwrap_err();
        assert!(matches!(err, Error::Api(_)));
    }
}
