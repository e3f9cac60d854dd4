// [[AVIARY]]/apps/control-plane/src/controller.rs
// Purpose: HTTP client for the in-container runtime controller.
// Architecture: Infrastructure Adapter Layer
// Dependencies: reqwest, async-trait

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{CharacterPayload, CharacterStatus};

/// Controller calls are short: a runtime that cannot answer within this
/// window counts as a failed probe.
const CONTROLLER_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ControllerError {
    /// Nothing answered at the reverse proxy (`/ping`).
    #[error("runtime unreachable at {url}: {cause}")]
    Unreachable { url: String, cause: String },

    /// The proxy answers but the controller behind it does not.
    #[error("controller down at {url}: {cause}")]
    ControllerDown { url: String, cause: String },

    /// A character is running, but not the one we expected.
    #[error("runtime at {url} is running a different character ({found})")]
    CharacterMismatch { url: String, found: String },

    /// The controller answered with something outside its contract.
    #[error("unexpected controller response from {url}: {cause}")]
    Protocol { url: String, cause: String },
}

/// The exact surface the control plane consumes from each runtime's
/// controller. Any deviation in the controller is an integration break.
#[async_trait]
pub trait ControllerApi: Send + Sync {
    /// Reverse-proxy reachability.
    async fn ping(&self, base_url: &str) -> Result<(), ControllerError>;

    /// In-container controller reachability.
    async fn controller_ping(&self, base_url: &str) -> Result<(), ControllerError>;

    async fn character_status(&self, base_url: &str)
        -> Result<CharacterStatus, ControllerError>;

    /// Queues a character start; returns without waiting for readiness.
    async fn start_character(
        &self,
        base_url: &str,
        payload: &CharacterPayload,
    ) -> Result<(), ControllerError>;

    /// Idempotent; succeeds even when nothing is running.
    async fn stop_character(&self, base_url: &str) -> Result<(), ControllerError>;

    /// Current character plus redacted envs.
    async fn read_character(&self, base_url: &str) -> Result<CharacterPayload, ControllerError>;
}

pub struct HttpController {
    http: reqwest::Client,
}

impl HttpController {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONTROLLER_TIMEOUT)
            .timeout(CONTROLLER_TIMEOUT)
            .build()
            .expect("Failed to build controller HTTP client");
        HttpController { http }
    }
}

impl Default for HttpController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControllerApi for HttpController {
    async fn ping(&self, base_url: &str) -> Result<(), ControllerError> {
        let resp = self
            .http
            .get(format!("{base_url}/ping"))
            .send()
            .await
            .map_err(|e| ControllerError::Unreachable {
                url: base_url.to_string(),
                cause: e.to_string(),
            })?;
        resp.error_for_status()
            .map_err(|e| ControllerError::Unreachable {
                url: base_url.to_string(),
                cause: e.to_string(),
            })?;
        Ok(())
    }

    async fn controller_ping(&self, base_url: &str) -> Result<(), ControllerError> {
        let resp = self
            .http
            .get(format!("{base_url}/controller/ping"))
            .send()
            .await
            .map_err(|e| ControllerError::ControllerDown {
                url: base_url.to_string(),
                cause: e.to_string(),
            })?;
        resp.error_for_status()
            .map_err(|e| ControllerError::ControllerDown {
                url: base_url.to_string(),
                cause: e.to_string(),
            })?;
        Ok(())
    }

    async fn character_status(
        &self,
        base_url: &str,
    ) -> Result<CharacterStatus, ControllerError> {
        let resp = self
            .http
            .get(format!("{base_url}/controller/character/status"))
            .send()
            .await
            .map_err(|e| ControllerError::ControllerDown {
                url: base_url.to_string(),
                cause: e.to_string(),
            })?
            .error_for_status()
            .map_err(|e| ControllerError::ControllerDown {
                url: base_url.to_string(),
                cause: e.to_string(),
            })?;
        resp.json::<CharacterStatus>()
            .await
            .map_err(|e| ControllerError::Protocol {
                url: base_url.to_string(),
                cause: e.to_string(),
            })
    }

    async fn start_character(
        &self,
        base_url: &str,
        payload: &CharacterPayload,
    ) -> Result<(), ControllerError> {
        self.http
            .post(format!("{base_url}/controller/character/start"))
            .json(payload)
            .send()
            .await
            .map_err(|e| ControllerError::ControllerDown {
                url: base_url.to_string(),
                cause: e.to_string(),
            })?
            .error_for_status()
            .map_err(|e| ControllerError::ControllerDown {
                url: base_url.to_string(),
                cause: e.to_string(),
            })?;
        Ok(())
    }

    async fn stop_character(&self, base_url: &str) -> Result<(), ControllerError> {
        self.http
            .post(format!("{base_url}/controller/character/stop"))
            .send()
            .await
            .map_err(|e| ControllerError::ControllerDown {
                url: base_url.to_string(),
                cause: e.to_string(),
            })?
            .error_for_status()
            .map_err(|e| ControllerError::ControllerDown {
                url: base_url.to_string(),
                cause: e.to_string(),
            })?;
        Ok(())
    }

    async fn read_character(
        &self,
        base_url: &str,
    ) -> Result<CharacterPayload, ControllerError> {
        let resp = self
            .http
            .get(format!("{base_url}/controller/character/read"))
            .send()
            .await
            .map_err(|e| ControllerError::ControllerDown {
                url: base_url.to_string(),
                cause: e.to_string(),
            })?
            .error_for_status()
            .map_err(|e| ControllerError::ControllerDown {
                url: base_url.to_string(),
                cause: e.to_string(),
            })?;
        resp.json::<CharacterPayload>()
            .await
            .map_err(|e| ControllerError::Protocol {
                url: base_url.to_string(),
                cause: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn speaks_the_controller_contract() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/controller/ping"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/controller/character/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "running": true,
                "agent_id": "char-7",
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/controller/character/stop"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/controller/character/read"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "character_json": {"name": "wren"},
                "envs": "MODEL_KEY=****",
            })))
            .mount(&server)
            .await;

        let client = HttpController::new();
        let base = server.uri();

        client.ping(&base).await.unwrap();
        client.controller_ping(&base).await.unwrap();
        let status = client.character_status(&base).await.unwrap();
        assert!(status.running);
        assert_eq!(status.agent_id.as_deref(), Some("char-7"));
        client.stop_character(&base).await.unwrap();
        let character = client.read_character(&base).await.unwrap();
        assert_eq!(character.envs, "MODEL_KEY=****");
    }

    #[tokio::test]
    async fn start_posts_the_character_payload() {
        let server = MockServer::start().await;
        let payload = CharacterPayload {
            character_json: serde_json::json!({"name": "wren"}),
            envs: "MODEL_KEY=redacted".into(),
        };
        let expected = serde_json::to_string(&payload).unwrap();
        Mock::given(method("POST"))
            .and(path("/controller/character/start"))
            .and(body_json_string(expected))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpController::new();
        client.start_character(&server.uri(), &payload).await.unwrap();
    }

    #[tokio::test]
    async fn failure_kinds_distinguish_proxy_from_controller() {
        // Nothing listening at all: the proxy itself is unreachable.
        let client = HttpController::new();
        let err = client.ping("http://127.0.0.1:9").await.unwrap_err();
        assert!(matches!(err, ControllerError::Unreachable { .. }));

        // Proxy answers, controller does not.
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/controller/ping"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        client.ping(&server.uri()).await.unwrap();
        let err = client.controller_ping(&server.uri()).await.unwrap_err();
        assert!(matches!(err, ControllerError::ControllerDown { .. }));
    }
}
