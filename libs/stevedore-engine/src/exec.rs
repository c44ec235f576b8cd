//! Running commands inside an existing, long-lived container

use crate::client::RuntimeClient;
use crate::demux::{FrameReader, StreamKind};
use crate::error::{CoreError, EngineError, RunError};
use std::sync::Arc;
use std::time::Instant;
use stevedore_common::types::{CapturePolicy, ContainerRef, ExecResult, ExecSpec};
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

/// Executes commands in containers it does not own. It never creates,
/// stops or removes anything.
#[derive(Clone)]
pub struct ExecSession {
    client: Arc<dyn RuntimeClient>,
}

impl ExecSession {
    pub fn new(client: Arc<dyn RuntimeClient>) -> Self {
        Self { client }
    }

    /// Run `spec` in `container` and return its combined stdout/stderr in
    /// arrival order.
    ///
    /// Dropping the returned future only stops reading; the exec keeps
    /// running in the container until it finishes on its own.
    #[tracing::instrument(skip(self, spec), fields(container = %container, program = spec.command.first().map(String::as_str).unwrap_or("")))]
    pub async fn exec_in_container(
        &self,
        container: &ContainerRef,
        spec: &ExecSpec,
    ) -> Result<ExecResult, RunError> {
        let started = Instant::now();

        let details = self
            .client
            .inspect_container(container.as_str())
            .await
            .map_err(|e| RunError::before_output(lookup_error(container, e)))?;
        if !details.running {
            debug!(container_id = %details.id, "Container is not running");
        }

        // The engine decides; the inspected state only explains a refusal
        let exec_id = self
            .client
            .create_exec(container.as_str(), spec)
            .await
            .map_err(|e| {
                RunError::before_output(exec_create_error(container, details.running, e))
            })?;

        let stream = self
            .client
            .start_exec(&exec_id)
            .await
            .map_err(RunError::before_output)?;

        let mut reader = FrameReader::new(stream);
        let mut output = Vec::new();
        if let Err(e) = collect(&mut reader, CapturePolicy::Full, &mut output).await {
            warn!(
                exec_id = %exec_id,
                captured_bytes = output.len(),
                error = %e,
                "Exec output stream failed"
            );
            return Err(RunError::new(e, ExecResult::partial(output)));
        }
        drop(reader);

        // The output is already complete; a failed lookup only loses the code
        let exit_code = match self.client.inspect_exec(&exec_id).await {
            Ok(code) => code,
            Err(e) => {
                warn!(exec_id = %exec_id, error = %e, "Could not read exec exit code");
                None
            }
        };

        info!(
            exec_id = %exec_id,
            exit_code = ?exit_code,
            output_bytes = output.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Exec finished"
        );
        Ok(ExecResult::completed(output, exit_code))
    }
}

fn lookup_error(container: &ContainerRef, err: EngineError) -> CoreError {
    if err.is_not_found() {
        CoreError::ContainerNotFound(container.to_string())
    } else {
        err.into()
    }
}

fn exec_create_error(container: &ContainerRef, running: bool, err: EngineError) -> CoreError {
    match err {
        e if e.is_not_found() => CoreError::ContainerNotFound(container.to_string()),
        EngineError::Unavailable(message) => CoreError::EngineUnavailable(message),
        EngineError::Rejected { message, .. } => CoreError::ExecCreateFailed {
            container: container.to_string(),
            reason: if running {
                message
            } else {
                format!("container is not running ({})", message)
            },
        },
    }
}

/// Append decoded payloads to `out` according to `policy`.
///
/// `Full` keeps every stdout and stderr frame until end of stream.
/// `FirstChunk` stops after the first stdout frame and treats an earlier end
/// of stream as an incomplete capture.
pub(crate) async fn collect<R>(
    reader: &mut FrameReader<R>,
    policy: CapturePolicy,
    out: &mut Vec<u8>,
) -> Result<(), CoreError>
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = reader.next_frame().await? {
        match policy {
            CapturePolicy::Full => out.extend_from_slice(&frame.payload),
            CapturePolicy::FirstChunk => {
                if frame.kind == StreamKind::Stdout {
                    out.extend_from_slice(&frame.payload);
                    return Ok(());
                }
            }
        }
    }

    match policy {
        CapturePolicy::Full => Ok(()),
        CapturePolicy::FirstChunk => Err(CoreError::IncompleteCapture(
            "stream ended before any stdout".to_string(),
        )),
    }
}
