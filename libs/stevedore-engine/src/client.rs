//! Runtime client: the only component that talks to the engine socket.
//!
//! Control-plane requests go through bollard. The two endpoints that hijack
//! the connection (exec start and container attach) are issued as raw HTTP
//! upgrades so the caller gets the engine's framed bytes untouched and decodes
//! them with [`crate::demux`].

use crate::error::EngineError;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::CreateExecOptions;
use bollard::image::CreateImageOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::DateTime;
use futures_util::stream::StreamExt;
use hyper::body::{Body, Incoming};
use hyper::{header, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::pin::Pin;
use stevedore_common::config::{RuntimeConfig, RuntimeEndpoint};
use stevedore_common::types::{ContainerSummary, ExecSpec, ImageRef};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// Bidirectional byte stream of a hijacked connection
pub trait AttachedIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AttachedIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type AttachedStream = Box<dyn AttachedIo>;

/// What the engine reports about an existing container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    pub running: bool,
}

/// Requests the core issues against the container engine.
///
/// One request per call, no retries. Implementations must be usable from
/// many tasks at once.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    async fn ping(&self) -> Result<(), EngineError>;

    async fn inspect_container(&self, container: &str) -> Result<ContainerDetails, EngineError>;

    /// Returns the exec instance id
    async fn create_exec(&self, container: &str, spec: &ExecSpec) -> Result<String, EngineError>;

    async fn start_exec(&self, exec_id: &str) -> Result<AttachedStream, EngineError>;

    async fn inspect_exec(&self, exec_id: &str) -> Result<Option<i64>, EngineError>;

    /// `Ok(false)` when the image is not present locally
    async fn image_exists(&self, image: &ImageRef) -> Result<bool, EngineError>;

    /// Completes once the engine reports the pull finished
    async fn pull_image(&self, image: &ImageRef) -> Result<(), EngineError>;

    /// Returns the new container id
    async fn create_container(&self, name: &str, image: &ImageRef) -> Result<String, EngineError>;

    async fn attach_container(&self, container_id: &str) -> Result<AttachedStream, EngineError>;

    async fn start_container(&self, container_id: &str) -> Result<(), EngineError>;

    /// Blocks until the container stops and returns its exit code
    async fn wait_container(&self, container_id: &str) -> Result<i64, EngineError>;

    async fn remove_container(&self, container_id: &str) -> Result<(), EngineError>;

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, EngineError>;
}

/// Docker Engine API client
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
    endpoint: RuntimeEndpoint,
}

impl DockerClient {
    /// Build the client; no request is sent until the first operation
    pub fn connect(config: &RuntimeConfig) -> Result<Self, EngineError> {
        let timeout = config.request_timeout_secs;
        let docker = match &config.endpoint {
            RuntimeEndpoint::Unix(path) => connect_unix(&path.to_string_lossy(), timeout)?,
            RuntimeEndpoint::Tcp { host, port } => {
                let addr = format!("tcp://{}:{}", host, port);
                Docker::connect_with_http(&addr, timeout, API_DEFAULT_VERSION)?
            }
        };

        info!(endpoint = %config.endpoint, timeout_secs = timeout, "Container engine client ready");
        Ok(Self {
            docker,
            endpoint: config.endpoint.clone(),
        })
    }

    pub fn endpoint(&self) -> &RuntimeEndpoint {
        &self.endpoint
    }

    /// POST `path` with `Upgrade: tcp` and hand back the raw connection
    async fn hijack(
        &self,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<AttachedStream, EngineError> {
        let body = body.map(|value| value.to_string()).unwrap_or_default();

        match &self.endpoint {
            RuntimeEndpoint::Unix(path_on_disk) => {
                let stream = open_unix(path_on_disk).await?;
                upgrade(stream, "docker", path, body).await
            }
            RuntimeEndpoint::Tcp { host, port } => {
                let stream = tokio::net::TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| {
                        EngineError::Unavailable(format!("connect {}:{}: {}", host, port, e))
                    })?;
                upgrade(stream, host, path, body).await
            }
        }
    }
}

#[cfg(unix)]
fn connect_unix(path: &str, timeout: u64) -> Result<Docker, EngineError> {
    Ok(Docker::connect_with_unix(path, timeout, API_DEFAULT_VERSION)?)
}

#[cfg(not(unix))]
fn connect_unix(path: &str, _timeout: u64) -> Result<Docker, EngineError> {
    Err(EngineError::Unavailable(format!(
        "unix socket endpoints are not supported on this platform: {}",
        path
    )))
}

#[cfg(unix)]
async fn open_unix(path: &std::path::Path) -> Result<tokio::net::UnixStream, EngineError> {
    tokio::net::UnixStream::connect(path)
        .await
        .map_err(|e| EngineError::Unavailable(format!("connect {}: {}", path.display(), e)))
}

#[cfg(not(unix))]
async fn open_unix(path: &std::path::Path) -> Result<tokio::net::TcpStream, EngineError> {
    Err(EngineError::Unavailable(format!(
        "unix socket endpoints are not supported on this platform: {}",
        path.display()
    )))
}

async fn upgrade<T>(
    stream: T,
    host: &str,
    path: &str,
    body: String,
) -> Result<AttachedStream, EngineError>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| EngineError::Unavailable(format!("HTTP handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(error = %e, "Hijacked connection closed with error");
        }
    });

    let request = Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::HOST, host)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "tcp")
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .map_err(|e| EngineError::Unavailable(format!("invalid request {}: {}", path, e)))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| EngineError::Unavailable(format!("POST {} failed: {}", path, e)))?;

    let status = response.status();
    if status != StatusCode::SWITCHING_PROTOCOLS {
        let body = read_body(response.into_body()).await;
        return Err(EngineError::rejected(status.as_u16(), engine_message(&body)));
    }

    let upgraded = hyper::upgrade::on(response)
        .await
        .map_err(|e| EngineError::Unavailable(format!("connection upgrade failed: {}", e)))?;

    debug!(path = path, "Stream hijacked");
    Ok(Box::new(TokioIo::new(upgraded)))
}

/// Whatever part of an error response arrives before the connection closes
async fn read_body(mut body: Incoming) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(Ok(frame)) = std::future::poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await {
        if let Ok(data) = frame.into_data() {
            out.extend_from_slice(&data);
        }
    }
    out
}

/// The engine reports errors as `{"message": "..."}`
fn engine_message(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string())
}

fn to_summary(raw: bollard::models::ContainerSummary) -> ContainerSummary {
    ContainerSummary {
        id: raw.id.unwrap_or_default(),
        names: raw
            .names
            .unwrap_or_default()
            .into_iter()
            .map(|n| n.trim_start_matches('/').to_string())
            .collect(),
        image: raw.image.unwrap_or_default(),
        state: raw.state.unwrap_or_default(),
        status: raw.status.unwrap_or_default(),
        created: raw.created.and_then(|secs| DateTime::from_timestamp(secs, 0)),
    }
}

#[async_trait]
impl RuntimeClient for DockerClient {
    async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await.map(|_| ())?;
        Ok(())
    }

    async fn inspect_container(&self, container: &str) -> Result<ContainerDetails, EngineError> {
        let inspect = self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await?;

        Ok(ContainerDetails {
            id: inspect.id.unwrap_or_else(|| container.to_string()),
            running: inspect.state.and_then(|s| s.running).unwrap_or(false),
        })
    }

    async fn create_exec(&self, container: &str, spec: &ExecSpec) -> Result<String, EngineError> {
        let options = CreateExecOptions {
            cmd: Some(spec.command.clone()),
            attach_stdin: Some(false),
            attach_stdout: Some(spec.capture_stdout),
            attach_stderr: Some(spec.capture_stderr),
            tty: Some(false),
            ..Default::default()
        };

        let exec = self.docker.create_exec(container, options).await?;
        debug!(container = container, exec_id = %exec.id, "Exec instance created");
        Ok(exec.id)
    }

    async fn start_exec(&self, exec_id: &str) -> Result<AttachedStream, EngineError> {
        let path = format!("/exec/{}/start", exec_id);
        self.hijack(&path, Some(serde_json::json!({ "Detach": false, "Tty": false })))
            .await
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<Option<i64>, EngineError> {
        let inspect = self.docker.inspect_exec(exec_id).await?;
        Ok(inspect.exit_code)
    }

    async fn image_exists(&self, image: &ImageRef) -> Result<bool, EngineError> {
        match self.docker.inspect_image(&image.to_string()).await {
            Ok(_) => Ok(true),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, image: &ImageRef) -> Result<(), EngineError> {
        let options = Some(CreateImageOptions {
            from_image: image.name.clone(),
            tag: image.tag.clone(),
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress?;
            if let Some(status) = progress.status {
                debug!(image = %image, status = %status, "Pull progress");
            }
        }
        Ok(())
    }

    async fn create_container(&self, name: &str, image: &ImageRef) -> Result<String, EngineError> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let config = Config {
            image: Some(image.to_string()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let created = self.docker.create_container(Some(options), config).await?;
        for warning in &created.warnings {
            debug!(container = name, warning = %warning, "Engine warning on create");
        }
        Ok(created.id)
    }

    async fn attach_container(&self, container_id: &str) -> Result<AttachedStream, EngineError> {
        let path = format!(
            "/containers/{}/attach?stream=1&stdin=1&stdout=1&stderr=1",
            container_id
        );
        self.hijack(&path, None).await
    }

    async fn start_container(&self, container_id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64, EngineError> {
        let options = WaitContainerOptions {
            condition: "not-running".to_string(),
        };

        let mut stream = self.docker.wait_container(container_id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error; for us it is an exit code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(EngineError::Unavailable(format!(
                "wait stream for {} closed without a status",
                container_id
            ))),
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container_id, Some(options))
            .await?;
        Ok(())
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, EngineError> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers.into_iter().map(to_summary).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_message_prefers_json_message() {
        let body = br#"{"message":"Container abc is not running"}"#;
        assert_eq!(engine_message(body), "Container abc is not running");
        assert_eq!(engine_message(b"page not found\n"), "page not found");
    }

    #[test]
    fn test_summary_strips_leading_slash() {
        let raw = bollard::models::ContainerSummary {
            id: Some("f00d".to_string()),
            names: Some(vec!["/postgres-db".to_string()]),
            image: Some("postgres:16".to_string()),
            state: Some("exited".to_string()),
            status: Some("Exited (0) 3 minutes ago".to_string()),
            created: Some(1_700_000_000),
            ..Default::default()
        };

        let summary = to_summary(raw);
        assert_eq!(summary.names, vec!["postgres-db"]);
        assert_eq!(summary.state, "exited");
        assert_eq!(summary.created.map(|c| c.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn test_summary_tolerates_missing_fields() {
        let summary = to_summary(bollard::models::ContainerSummary::default());
        assert!(summary.id.is_empty());
        assert!(summary.names.is_empty());
        assert!(summary.created.is_none());
    }

    #[tokio::test]
    async fn test_missing_socket_is_unavailable() {
        let config = RuntimeConfig {
            endpoint: RuntimeEndpoint::Unix("/nonexistent/stevedore-test.sock".into()),
            ..RuntimeConfig::default()
        };
        let err = match DockerClient::connect(&config) {
            Ok(client) => client.start_exec("deadbeef").await.err().unwrap(),
            Err(e) => e,
        };
        assert!(matches!(err, EngineError::Unavailable(_)));
    }
}
