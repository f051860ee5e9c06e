//! Client contract for the remote sandbox control plane.
//!
//! The remote backend only needs four operations: create and delete a
//! container, write a file into it, and open a long-lived command session.
//! [`HttpControlPlane`] speaks a small JSON API over a pooled blocking HTTP
//! client; tests substitute an in-memory implementation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::blocking::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

/// Output of one command run inside a remote session.
///
/// `exit_code` is `None` when the backend could not report one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutput {
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub timed_out: bool,
}

/// A persistent command session inside one container.
pub trait RemoteSession {
    /// Run a shell command line, bounded by `timeout_secs`.
    fn run(&mut self, command: &str, timeout_secs: u64) -> Result<SessionOutput>;
    /// Close the session. Called once, from sandbox teardown.
    fn close(&mut self) -> Result<()>;
}

/// Container lifecycle operations.
pub trait ControlPlane {
    /// Provision a container from `image`, returning its id.
    fn create_container(&self, image: &str) -> Result<String>;
    fn delete_container(&self, container_id: &str) -> Result<()>;
    fn open_session(&self, container_id: &str) -> Result<Box<dyn RemoteSession>>;
    /// Write `content` to absolute `path` inside the container.
    fn write_file(&self, container_id: &str, path: &Path, content: &[u8]) -> Result<()>;
}

/// Connection settings for [`HttpControlPlane`].
#[derive(Debug, Clone)]
pub struct HttpControlPlaneConfig {
    pub base_url: String,
    pub token: Option<String>,
    /// Ceiling for plain API calls. Command calls add their own timeout on top.
    pub request_timeout: Duration,
}

/// JSON-over-HTTP control plane client.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: Arc<Client>,
    config: HttpControlPlaneConfig,
}

#[derive(Debug, Serialize)]
struct CreateContainerRequest<'a> {
    image: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateContainerResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct OpenSessionResponse {
    session_id: String,
}

#[derive(Debug, Serialize)]
struct ExecCommandRequest<'a> {
    command: &'a str,
    timeout_secs: u64,
}

/// File contents travel base64-encoded so any bytes survive the JSON body.
#[derive(Debug, Serialize)]
struct WriteFileRequest<'a> {
    path: &'a str,
    encoding: &'static str,
    content: String,
}

impl<'a> WriteFileRequest<'a> {
    fn new(path: &'a str, content: &[u8]) -> Self {
        Self {
            path,
            encoding: "base64",
            content: STANDARD.encode(content),
        }
    }
}

impl HttpControlPlane {
    pub fn connect(config: HttpControlPlaneConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(4)
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .context("build control plane HTTP client")?;
        info!(base_url = %config.base_url, "created control plane client");
        Ok(Self {
            client: Arc::new(client),
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

fn send(req: RequestBuilder, what: &str) -> Result<reqwest::blocking::Response> {
    let resp = req.send().with_context(|| format!("{what}: request failed"))?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().unwrap_or_default();
        return Err(anyhow!("{what}: HTTP {status}: {}", body.trim()));
    }
    Ok(resp)
}

impl ControlPlane for HttpControlPlane {
    #[instrument(skip_all, fields(image))]
    fn create_container(&self, image: &str) -> Result<String> {
        let req = self
            .client
            .post(self.url("/v1/containers"))
            .timeout(self.config.request_timeout)
            .json(&CreateContainerRequest { image });
        let resp: CreateContainerResponse = send(self.authorize(req), "create container")?
            .json()
            .context("decode create container response")?;
        debug!(container_id = %resp.id, "container created");
        Ok(resp.id)
    }

    #[instrument(skip_all, fields(container_id))]
    fn delete_container(&self, container_id: &str) -> Result<()> {
        let req = self
            .client
            .delete(self.url(&format!("/v1/containers/{container_id}")))
            .timeout(self.config.request_timeout);
        send(self.authorize(req), "delete container")?;
        Ok(())
    }

    fn open_session(&self, container_id: &str) -> Result<Box<dyn RemoteSession>> {
        let req = self
            .client
            .post(self.url(&format!("/v1/containers/{container_id}/sessions")))
            .timeout(self.config.request_timeout);
        let resp: OpenSessionResponse = send(self.authorize(req), "open session")?
            .json()
            .context("decode open session response")?;
        debug!(session_id = %resp.session_id, "session opened");
        Ok(Box::new(HttpSession {
            plane: self.clone(),
            container_id: container_id.to_string(),
            session_id: resp.session_id,
        }))
    }

    fn write_file(&self, container_id: &str, path: &Path, content: &[u8]) -> Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("non UTF-8 path {}", path.display()))?;
        let req = self
            .client
            .put(self.url(&format!("/v1/containers/{container_id}/files")))
            .timeout(self.config.request_timeout)
            .json(&WriteFileRequest::new(path_str, content));
        send(self.authorize(req), "write file")?;
        Ok(())
    }
}

/// One server-side session; the HTTP connection itself is pooled by the client.
struct HttpSession {
    plane: HttpControlPlane,
    container_id: String,
    session_id: String,
}

impl RemoteSession for HttpSession {
    fn run(&mut self, command: &str, timeout_secs: u64) -> Result<SessionOutput> {
        let url = self.plane.url(&format!(
            "/v1/containers/{}/sessions/{}/exec",
            self.container_id, self.session_id
        ));
        let req = self
            .plane
            .client
            .post(url)
            .timeout(self.plane.config.request_timeout + Duration::from_secs(timeout_secs))
            .json(&ExecCommandRequest {
                command,
                timeout_secs,
            });
        send(self.plane.authorize(req), "session exec")?
            .json()
            .context("decode session exec response")
    }

    fn close(&mut self) -> Result<()> {
        let url = self.plane.url(&format!(
            "/v1/containers/{}/sessions/{}",
            self.container_id, self.session_id
        ));
        let req = self
            .plane
            .client
            .delete(url)
            .timeout(self.plane.config.request_timeout);
        send(self.plane.authorize(req), "close session")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_output_tolerates_missing_fields() {
        let out: SessionOutput = serde_json::from_str(r#"{"stdout":"hi"}"#).expect("decode");
        assert_eq!(out.exit_code, None);
        assert_eq!(out.stdout, "hi");
        assert!(!out.timed_out);
    }

    #[test]
    fn file_writes_are_base64_encoded() {
        let req = WriteFileRequest::new("/workspace/repo/blob", &[0xff, 0x00, b'a']);
        let body = serde_json::to_value(&req).expect("encode");
        assert_eq!(
            body,
            serde_json::json!({
                "path": "/workspace/repo/blob",
                "encoding": "base64",
                "content": "/wBh",
            })
        );
    }

    #[test]
    fn urls_join_without_double_slash() {
        let plane = HttpControlPlane::connect(HttpControlPlaneConfig {
            base_url: "http://sandbox.internal/".to_string(),
            token: None,
            request_timeout: Duration::from_secs(5),
        })
        .expect("client");
        assert_eq!(
            plane.url("/v1/containers"),
            "http://sandbox.internal/v1/containers"
        );
    }
}
