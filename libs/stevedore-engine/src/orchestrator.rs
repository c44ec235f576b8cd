//! One-shot containers: pull, create, attach, start, collect, wait, remove.

use crate::client::RuntimeClient;
use crate::demux::FrameReader;
use crate::error::{CoreError, EngineError, RunError};
use crate::exec::collect;
use std::sync::Arc;
use std::time::Instant;
use stevedore_common::config::{RuntimeConfig, DEFAULT_NAME_PREFIX};
use stevedore_common::types::{
    CapturePolicy, CleanupWarning, ExecResult, ImageRef, LifecycleState, PullPolicy,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub capture: CapturePolicy,
    pub pull: PullPolicy,
    /// Containers are named `<prefix>-<uuid>`
    pub name_prefix: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            capture: CapturePolicy::default(),
            pull: PullPolicy::default(),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
        }
    }
}

impl RunOptions {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            name_prefix: config.name_prefix.clone(),
            ..Self::default()
        }
    }
}

/// Removes the container if a run is dropped before it reached REMOVE.
/// Drop cannot await, so the removal is spawned on the current runtime.
///
/// Armed with the container name before CREATE is sent, since the engine may
/// create the container even if the response never comes back; the engine
/// removes by name or id alike. Disarmed once the explicit REMOVE has been
/// handed off, so removal is requested once per run.
struct ContainerGuard {
    client: Arc<dyn RuntimeClient>,
    container_id: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(client: Arc<dyn RuntimeClient>, container_id: String) -> Self {
        Self {
            client,
            container_id,
            armed: true,
        }
    }

    /// Point at the id the engine assigned
    fn retarget(&mut self, container_id: &str) {
        self.container_id = container_id.to_string();
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let client = self.client.clone();
        let container_id = std::mem::take(&mut self.container_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(container_id = %container_id, "Run abandoned, removing container");
                handle.spawn(async move {
                    if let Err(e) = client.remove_container(&container_id).await {
                        warn!(container_id = %container_id, error = %e, "Failed to remove abandoned container");
                    }
                });
            }
            Err(_) => {
                warn!(container_id = %container_id, "No runtime left to remove abandoned container");
            }
        }
    }
}

/// Runs images to completion in throwaway containers
#[derive(Clone)]
pub struct EphemeralRunner {
    client: Arc<dyn RuntimeClient>,
    options: RunOptions,
}

impl EphemeralRunner {
    pub fn new(client: Arc<dyn RuntimeClient>, options: RunOptions) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run `image` once and return what it printed.
    ///
    /// Every container created here is removed before this returns, whatever
    /// the outcome. A failed removal is reported as a cleanup warning on the
    /// result or the error. If the future is dropped mid-run the removal is
    /// spawned in the background.
    #[tracing::instrument(skip(self), fields(image = %image, capture = ?self.options.capture))]
    pub async fn run_once(&self, image: &ImageRef) -> Result<ExecResult, RunError> {
        let started = Instant::now();

        self.ensure_image(image)
            .await
            .map_err(RunError::before_output)?;

        let name = format!("{}-{}", self.options.name_prefix, Uuid::new_v4());
        let mut guard = ContainerGuard::new(self.client.clone(), name.clone());
        let container_id = match self.client.create_container(&name, image).await {
            Ok(id) => id,
            Err(e) => {
                // Refused outright, nothing exists to remove
                guard.disarm();
                return Err(RunError::before_output(create_error(image, e)));
            }
        };
        guard.retarget(&container_id);
        info!(container_id = %container_id, name = %name, state = %LifecycleState::Created, "Container created");

        let mut output = Vec::new();
        let outcome = self.drive(&container_id, &mut output).await;

        let cleanup_warning = self.remove(&container_id, &mut guard).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(exit_code) => {
                info!(
                    container_id = %container_id,
                    exit_code = exit_code,
                    output_bytes = output.len(),
                    elapsed_ms = elapsed_ms,
                    "Run finished"
                );
                let mut result = ExecResult::completed(output, Some(exit_code));
                result.cleanup_warning = cleanup_warning;
                Ok(result)
            }
            Err(error) => {
                warn!(
                    container_id = %container_id,
                    captured_bytes = output.len(),
                    elapsed_ms = elapsed_ms,
                    error = %error,
                    "Run failed"
                );
                let mut partial = ExecResult::partial(output);
                partial.cleanup_warning = cleanup_warning;
                Err(RunError::new(error, partial))
            }
        }
    }

    async fn ensure_image(&self, image: &ImageRef) -> Result<(), CoreError> {
        if self.options.pull == PullPolicy::IfMissing {
            match self.client.image_exists(image).await {
                Ok(true) => {
                    debug!(image = %image, "Image cache hit");
                    return Ok(());
                }
                Ok(false) => warn!(image = %image, "Image cache miss, pulling"),
                Err(e) => return Err(pull_error(image, e)),
            }
        }

        self.client
            .pull_image(image)
            .await
            .map_err(|e| pull_error(image, e))?;
        info!(image = %image, "Image pulled");
        Ok(())
    }

    /// ATTACH through WAIT_EXIT. Output is appended to `output` as it
    /// arrives so a failure can still hand it back.
    async fn drive(&self, container_id: &str, output: &mut Vec<u8>) -> Result<i64, CoreError> {
        // Attach before start so no early output is lost
        let stream = self
            .client
            .attach_container(container_id)
            .await
            .map_err(|e| attach_error(container_id, e))?;
        let (read_half, mut write_half) = tokio::io::split(stream);

        self.client.start_container(container_id).await?;
        info!(container_id = %container_id, state = %LifecycleState::Started, "Container started");

        // Nothing is ever sent on stdin; close it so processes reading it see EOF
        if let Err(e) = write_half.shutdown().await {
            debug!(container_id = %container_id, error = %e, "Closing stdin failed");
        }
        drop(write_half);

        let mut reader = FrameReader::new(read_half);
        debug!(container_id = %container_id, state = %LifecycleState::Running, "Collecting output");
        collect(&mut reader, self.options.capture, output).await?;
        drop(reader);

        let exit_code = self.client.wait_container(container_id).await?;
        info!(
            container_id = %container_id,
            exit_code = exit_code,
            state = %LifecycleState::Exited,
            "Container exited"
        );
        Ok(exit_code)
    }

    /// Forced removal, spawned so that dropping the run afterwards cannot
    /// cancel a request already handed to the runtime
    async fn remove(
        &self,
        container_id: &str,
        guard: &mut ContainerGuard,
    ) -> Option<CleanupWarning> {
        let client = self.client.clone();
        let id = container_id.to_string();
        let request = tokio::spawn(async move { client.remove_container(&id).await });
        guard.disarm();

        let removed = match request.await {
            Ok(removed) => removed,
            Err(e) => Err(EngineError::Unavailable(format!("remove task failed: {}", e))),
        };

        match removed {
            Ok(()) => {
                info!(container_id = %container_id, state = %LifecycleState::Removed, "Container removed");
                None
            }
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "Failed to remove container");
                Some(CleanupWarning {
                    container_id: container_id.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }
}

fn pull_error(image: &ImageRef, err: EngineError) -> CoreError {
    match err {
        EngineError::Unavailable(message) => CoreError::EngineUnavailable(message),
        EngineError::Rejected { message, .. } => CoreError::ImagePullFailed {
            image: image.to_string(),
            reason: message,
        },
    }
}

fn create_error(image: &ImageRef, err: EngineError) -> CoreError {
    match err {
        EngineError::Unavailable(message) => CoreError::EngineUnavailable(message),
        EngineError::Rejected { message, .. } => CoreError::ContainerCreateFailed {
            image: image.to_string(),
            reason: message,
        },
    }
}

fn attach_error(container_id: &str, err: EngineError) -> CoreError {
    match err {
        EngineError::Unavailable(message) => CoreError::EngineUnavailable(message),
        EngineError::Rejected { message, .. } => CoreError::AttachFailed {
            container: container_id.to_string(),
            reason: message,
        },
    }
}
