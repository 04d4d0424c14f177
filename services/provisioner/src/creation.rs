//! Creation service boundary.
//!
//! The engine hands a resolved [`ProvisionedSpec`] to the panel and only
//! cares whether it was accepted. Install and boot continue out of band.

use std::time::Duration;

use async_trait::async_trait;
use berth_id::InstanceId;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error};

use crate::model::ProvisionedSpec;

#[derive(Debug, Error)]
pub enum CreationError {
    #[error("creation service rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("creation service did not answer within {secs}s")]
    Timeout { secs: u64 },

    #[error("creation service unreachable: {0}")]
    Transport(String),

    #[error("invalid creation service response: {0}")]
    InvalidResponse(String),
}

/// Accepted server as reported by the creation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceHandle {
    pub instance_id: InstanceId,
}

#[async_trait]
pub trait CreationService: Send + Sync {
    async fn create(&self, spec: &ProvisionedSpec) -> Result<InstanceHandle, CreationError>;
}

/// Response body of `POST /servers`.
#[derive(Debug, Deserialize)]
struct CreateServerResponse {
    #[serde(alias = "id")]
    instance_id: String,
}

/// Creation service reached over HTTP.
pub struct HttpCreationService {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpCreationService {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, CreationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CreationError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl CreationService for HttpCreationService {
    async fn create(&self, spec: &ProvisionedSpec) -> Result<InstanceHandle, CreationError> {
        let url = format!("{}/servers", self.base_url);
        debug!(url = %url, name = %spec.name, node_id = %spec.node_id, "Submitting server");

        let mut request = self.client.post(&url).json(spec);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CreationError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Creation service rejected server");
            return Err(CreationError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body: CreateServerResponse = response
            .json()
            .await
            .map_err(|e| CreationError::InvalidResponse(e.to_string()))?;
        let instance_id = body
            .instance_id
            .parse()
            .map_err(|e: berth_id::IdError| CreationError::InvalidResponse(e.to_string()))?;

        Ok(InstanceHandle { instance_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_id::{AllocationId, EggId, NodeId, UserId};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::model::{FeatureLimits, ResourceLimits};

    fn spec() -> ProvisionedSpec {
        let now = Utc::now();
        ProvisionedSpec {
            name: "lobby".to_string(),
            owner_id: UserId::new(),
            egg_id: EggId::new(),
            node_id: NodeId::new(),
            allocation_id: AllocationId::new(),
            limits: ResourceLimits {
                cpu: 100,
                memory: 1024,
                disk: 5120,
                swap: 0,
                io: 500,
                oom_disabled: true,
            },
            feature_limits: FeatureLimits {
                databases: 0,
                allocations: 1,
                backups: 0,
            },
            image: "ghcr.io/pterodactyl/yolks:java_17".to_string(),
            startup: "java -jar server.jar".to_string(),
            environment: BTreeMap::new(),
            skip_scripts: false,
            activated_on: now,
            expires_at: now,
            plan: BTreeMap::new(),
        }
    }

    fn service(server: &MockServer) -> HttpCreationService {
        HttpCreationService::new(
            server.uri(),
            Some("secret".to_string()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_accepted_server_returns_instance() {
        let server = MockServer::start().await;
        let instance = InstanceId::new();
        Mock::given(method("POST"))
            .and(path("/servers"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(serde_json::json!({ "id": instance })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let handle = service(&server).create(&spec()).await.unwrap();
        assert_eq!(handle.instance_id, instance);
    }

    #[tokio::test]
    async fn test_rejection_carries_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/servers"))
            .respond_with(ResponseTemplate::new(422).set_body_string("node out of memory"))
            .mount(&server)
            .await;

        let err = service(&server).create(&spec()).await.unwrap_err();
        match err {
            CreationError::Rejected { status, body } => {
                assert_eq!(status, 422);
                assert_eq!(body, "node out of memory");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_instance_id_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/servers"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "instance_id": "srv-42" })),
            )
            .mount(&server)
            .await;

        let err = service(&server).create(&spec()).await.unwrap_err();
        assert!(matches!(err, CreationError::InvalidResponse(_)));
    }
}
