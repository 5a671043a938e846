//! Remote sandbox provider over HTTP.
//!
//! Wire contract:
//! - `POST   {base}/environments`            body: [`EnvironmentSpec`] → [`Environment`]
//! - `POST   {base}/environments/{id}/exec`  body: `{command, timeoutMs}` → `{output, exitCode}`
//! - `DELETE {base}/environments/{id}`
//!
//! `404`/`410` from exec means the environment is gone; `408`/`504` means the
//! provider gave up on the command (the body may carry partial output).

use std::time::Duration;

use async_trait::async_trait;
use dojo_core::environment::{Environment, EnvironmentSpec, EnvironmentStatus};
use dojo_core::ids::EnvironmentId;
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::SandboxError;
use crate::traits::{CommandOutput, Provisioner};

/// Extra time allowed on top of a command timeout for the HTTP round trip.
const EXEC_GRACE: Duration = Duration::from_secs(5);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecRequest<'a> {
    command: &'a str,
    timeout_ms: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartialOutput {
    #[serde(default)]
    output: Option<String>,
}

/// HTTP client for a remote sandbox provider.
pub struct HttpProvisioner {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    request_timeout: Duration,
}

impl HttpProvisioner {
    /// Create a client for the provider at `base_url`.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_token: None,
            request_timeout,
        }
    }

    /// Send `Authorization: Bearer <token>` with every request.
    #[must_use]
    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

async fn error_body(resp: reqwest::Response) -> String {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    fn name(&self) -> &str {
        "http"
    }

    async fn provision(&self, spec: &EnvironmentSpec) -> Result<Environment, SandboxError> {
        let req = self
            .client
            .post(self.url("/environments"))
            .timeout(self.request_timeout)
            .json(spec);
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| SandboxError::Provision {
                message: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(SandboxError::Provision {
                message: error_body(resp).await,
            });
        }

        let env: Environment = resp.json().await.map_err(|e| SandboxError::Provision {
            message: format!("invalid provider response: {e}"),
        })?;
        if env.status == EnvironmentStatus::Error {
            return Err(SandboxError::Provision {
                message: format!("environment {} reported error status", env.id),
            });
        }
        debug!(environment_id = %env.id, "environment provisioned");
        Ok(env)
    }

    async fn run_command(
        &self,
        environment: &EnvironmentId,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, SandboxError> {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let req = self
            .client
            .post(self.url(&format!("/environments/{environment}/exec")))
            .timeout(timeout + EXEC_GRACE)
            .json(&ExecRequest {
                command,
                timeout_ms,
            });

        let resp = match self.authorize(req).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                return Err(SandboxError::Timeout {
                    timeout_ms,
                    partial_output: None,
                });
            }
            Err(e) => {
                return Err(SandboxError::Execution {
                    message: e.to_string(),
                });
            }
        };

        match resp.status() {
            s if s.is_success() => resp.json().await.map_err(|e| SandboxError::Execution {
                message: format!("invalid provider response: {e}"),
            }),
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(SandboxError::EnvironmentLost {
                environment_id: environment.clone(),
                message: error_body(resp).await,
            }),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                let partial = resp
                    .json::<PartialOutput>()
                    .await
                    .ok()
                    .and_then(|p| p.output);
                Err(SandboxError::Timeout {
                    timeout_ms,
                    partial_output: partial,
                })
            }
            _ => Err(SandboxError::Execution {
                message: error_body(resp).await,
            }),
        }
    }

    async fn teardown(&self, environment: &EnvironmentId) -> Result<(), SandboxError> {
        let req = self
            .client
            .delete(self.url(&format!("/environments/{environment}")))
            .timeout(self.request_timeout);
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| SandboxError::Teardown {
                environment_id: environment.clone(),
                message: e.to_string(),
            })?;

        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            debug!(environment_id = %environment, "environment torn down");
            return Ok(());
        }
        let message = error_body(resp).await;
        warn!(environment_id = %environment, %message, "teardown rejected by provider");
        Err(SandboxError::Teardown {
            environment_id: environment.clone(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpProvisioner {
        HttpProvisioner::new(format!("{}/", server.uri()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn provision_parses_environment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/environments"))
            .and(body_partial_json(json!({"image": "ubuntu"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "env-1",
                "status": "ready",
                "endpoints": {"api": "http://10.0.0.2:8080"},
                "resources": {"cpu": "1", "memory": "1Gi"}
            })))
            .mount(&server)
            .await;

        let spec = EnvironmentSpec {
            image: Some("ubuntu".into()),
            ..EnvironmentSpec::default()
        };
        let env = client(&server).provision(&spec).await.unwrap();
        assert_eq!(env.id.as_str(), "env-1");
        assert_eq!(env.status, EnvironmentStatus::Ready);
        assert_eq!(env.endpoints["api"], "http://10.0.0.2:8080");
    }

    #[tokio::test]
    async fn provision_failure_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/environments"))
            .respond_with(ResponseTemplate::new(503).set_body_string("no capacity"))
            .mount(&server)
            .await;

        let err = client(&server)
            .provision(&EnvironmentSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Provision { .. }));
        assert!(err.to_string().contains("no capacity"));
    }

    #[tokio::test]
    async fn provision_rejects_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/environments"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "e", "status": "error"})),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .provision(&EnvironmentSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Provision { .. }));
    }

    #[tokio::test]
    async fn run_command_success_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/environments/env-1/exec"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({"command": "ls", "timeoutMs": 2000})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"output": "a\nb\n", "exitCode": 0})),
            )
            .mount(&server)
            .await;

        let out = client(&server)
            .with_api_token("secret")
            .run_command(&EnvironmentId::from("env-1"), "ls", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(out, CommandOutput::new("a\nb\n", 0));
    }

    #[tokio::test]
    async fn run_command_gone_is_environment_lost() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/environments/env-1/exec"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let err = client(&server)
            .run_command(&EnvironmentId::from("env-1"), "ls", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_unrecoverable());
    }

    #[tokio::test]
    async fn run_command_provider_timeout_keeps_partial_output() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/environments/env-1/exec"))
            .respond_with(ResponseTemplate::new(504).set_body_json(json!({"output": "half"})))
            .mount(&server)
            .await;

        let err = client(&server)
            .run_command(&EnvironmentId::from("env-1"), "sleep 99", Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            SandboxError::Timeout {
                timeout_ms,
                partial_output,
            } => {
                assert_eq!(timeout_ms, 1000);
                assert_eq!(partial_output.as_deref(), Some("half"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_command_server_error_is_execution_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/environments/env-1/exec"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = client(&server)
            .run_command(&EnvironmentId::from("env-1"), "ls", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Execution { .. }));
    }

    #[tokio::test]
    async fn teardown_tolerates_missing_environment() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/environments/env-1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(
            client(&server)
                .teardown(&EnvironmentId::from("env-1"))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn teardown_failure_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/environments/env-1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client(&server)
            .teardown(&EnvironmentId::from("env-1"))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "teardown");
    }
}
