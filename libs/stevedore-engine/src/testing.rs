//! In-memory engine double that records every request.

use crate::client::{AttachedStream, ContainerDetails, RuntimeClient};
use crate::error::EngineError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use stevedore_common::types::{ContainerSummary, ExecSpec, ImageRef};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Ping,
    InspectContainer,
    CreateExec,
    StartExec,
    InspectExec,
    ImageExists,
    PullImage,
    CreateContainer,
    AttachContainer,
    StartContainer,
    WaitContainer,
    RemoveContainer,
    ListContainers,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, bool>,
    images: HashSet<String>,
    exec_output: Vec<u8>,
    attach_output: Vec<u8>,
    keep_streams_open: bool,
    attach_reads_stdin: bool,
    exit_code: i64,
    exec_specs: Vec<ExecSpec>,
    listing: Vec<ContainerSummary>,
    failures: HashMap<Op, EngineError>,
    hangs: HashSet<Op>,
    stalls: HashSet<Op>,
    calls: Vec<(Op, String)>,
    open_peers: Vec<DuplexStream>,
}

#[derive(Default)]
pub struct RecordingClient {
    state: Mutex<State>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_container(self, name: &str, running: bool) -> Self {
        self.state
            .lock()
            .unwrap()
            .containers
            .insert(name.to_string(), running);
        self
    }

    pub fn with_image(self, image: &str) -> Self {
        self.state.lock().unwrap().images.insert(image.to_string());
        self
    }

    pub fn exec_output(self, bytes: Vec<u8>) -> Self {
        self.state.lock().unwrap().exec_output = bytes;
        self
    }

    pub fn attach_output(self, bytes: Vec<u8>) -> Self {
        self.state.lock().unwrap().attach_output = bytes;
        self
    }

    pub fn exit_code(self, code: i64) -> Self {
        self.state.lock().unwrap().exit_code = code;
        self
    }

    pub fn with_listing(self, listing: Vec<ContainerSummary>) -> Self {
        self.state.lock().unwrap().listing = listing;
        self
    }

    /// Hijacked streams deliver their bytes but never reach end of stream
    pub fn keep_streams_open(self) -> Self {
        self.state.lock().unwrap().keep_streams_open = true;
        self
    }

    /// The attached container prints its output only after stdin hits EOF
    pub fn attach_reads_stdin(self) -> Self {
        self.state.lock().unwrap().attach_reads_stdin = true;
        self
    }

    pub fn fail(self, op: Op, err: EngineError) -> Self {
        self.state.lock().unwrap().failures.insert(op, err);
        self
    }

    /// The request never completes
    pub fn hang(self, op: Op) -> Self {
        self.state.lock().unwrap().hangs.insert(op);
        self
    }

    /// The request takes effect on the engine but its response never arrives
    pub fn stall(self, op: Op) -> Self {
        self.state.lock().unwrap().stalls.insert(op);
        self
    }

    pub fn calls(&self) -> Vec<Op> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(op, _)| *op)
            .collect()
    }

    pub fn count(&self, op: Op) -> usize {
        self.calls().into_iter().filter(|c| *c == op).count()
    }

    pub fn args(&self, op: Op) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(o, _)| *o == op)
            .map(|(_, arg)| arg.clone())
            .collect()
    }

    pub fn exec_specs(&self) -> Vec<ExecSpec> {
        self.state.lock().unwrap().exec_specs.clone()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .containers
            .keys()
            .cloned()
            .collect()
    }

    async fn enter(&self, op: Op, arg: &str) -> Result<(), EngineError> {
        let (hang, failure) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push((op, arg.to_string()));
            (state.hangs.contains(&op), state.failures.get(&op).cloned())
        };
        if hang {
            std::future::pending::<()>().await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn settle(&self, op: Op) {
        let stalled = self.state.lock().unwrap().stalls.contains(&op);
        if stalled {
            std::future::pending::<()>().await;
        }
    }

    /// Container side of an attach that waits for stdin to close first
    fn serve_after_stdin(&self, bytes: Vec<u8>) -> AttachedStream {
        let (ours, mut theirs) = tokio::io::duplex(bytes.len() + 1024);
        tokio::spawn(async move {
            let mut stdin = Vec::new();
            if theirs.read_to_end(&mut stdin).await.is_ok() {
                let _ = theirs.write_all(&bytes).await;
            }
        });
        Box::new(ours)
    }

    async fn serve(&self, bytes: Vec<u8>) -> AttachedStream {
        let (ours, mut theirs) = tokio::io::duplex(bytes.len() + 1024);
        theirs.write_all(&bytes).await.unwrap();

        let mut state = self.state.lock().unwrap();
        if state.keep_streams_open {
            state.open_peers.push(theirs);
        }
        Box::new(ours)
    }

    fn no_such_container(name: &str) -> EngineError {
        EngineError::rejected(404, format!("No such container: {}", name))
    }
}

#[async_trait]
impl RuntimeClient for RecordingClient {
    async fn ping(&self) -> Result<(), EngineError> {
        self.enter(Op::Ping, "").await
    }

    async fn inspect_container(&self, container: &str) -> Result<ContainerDetails, EngineError> {
        self.enter(Op::InspectContainer, container).await?;
        let running = self.state.lock().unwrap().containers.get(container).copied();
        match running {
            Some(running) => Ok(ContainerDetails {
                id: container.to_string(),
                running,
            }),
            None => Err(Self::no_such_container(container)),
        }
    }

    async fn create_exec(&self, container: &str, spec: &ExecSpec) -> Result<String, EngineError> {
        self.enter(Op::CreateExec, container).await?;
        let mut state = self.state.lock().unwrap();
        match state.containers.get(container).copied() {
            None => Err(Self::no_such_container(container)),
            Some(false) => Err(EngineError::rejected(
                409,
                format!("Container {} is not running", container),
            )),
            Some(true) => {
                state.exec_specs.push(spec.clone());
                Ok(format!("exec-{}", state.exec_specs.len()))
            }
        }
    }

    async fn start_exec(&self, exec_id: &str) -> Result<AttachedStream, EngineError> {
        self.enter(Op::StartExec, exec_id).await?;
        let bytes = self.state.lock().unwrap().exec_output.clone();
        Ok(self.serve(bytes).await)
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<Option<i64>, EngineError> {
        self.enter(Op::InspectExec, exec_id).await?;
        Ok(Some(self.state.lock().unwrap().exit_code))
    }

    async fn image_exists(&self, image: &ImageRef) -> Result<bool, EngineError> {
        let image = image.to_string();
        self.enter(Op::ImageExists, &image).await?;
        Ok(self.state.lock().unwrap().images.contains(&image))
    }

    async fn pull_image(&self, image: &ImageRef) -> Result<(), EngineError> {
        let image = image.to_string();
        self.enter(Op::PullImage, &image).await?;
        self.state.lock().unwrap().images.insert(image);
        Ok(())
    }

    async fn create_container(&self, name: &str, image: &ImageRef) -> Result<String, EngineError> {
        self.enter(Op::CreateContainer, &format!("{} {}", name, image))
            .await?;
        self.state
            .lock()
            .unwrap()
            .containers
            .insert(name.to_string(), false);
        self.settle(Op::CreateContainer).await;
        Ok(name.to_string())
    }

    async fn attach_container(&self, container_id: &str) -> Result<AttachedStream, EngineError> {
        self.enter(Op::AttachContainer, container_id).await?;
        let (bytes, reads_stdin) = {
            let state = self.state.lock().unwrap();
            (state.attach_output.clone(), state.attach_reads_stdin)
        };
        if reads_stdin {
            return Ok(self.serve_after_stdin(bytes));
        }
        Ok(self.serve(bytes).await)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), EngineError> {
        self.enter(Op::StartContainer, container_id).await?;
        self.state
            .lock()
            .unwrap()
            .containers
            .insert(container_id.to_string(), true);
        Ok(())
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64, EngineError> {
        self.enter(Op::WaitContainer, container_id).await?;
        let mut state = self.state.lock().unwrap();
        state.containers.insert(container_id.to_string(), false);
        Ok(state.exit_code)
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), EngineError> {
        self.enter(Op::RemoveContainer, container_id).await?;
        match self.state.lock().unwrap().containers.remove(container_id) {
            Some(_) => Ok(()),
            None => Err(Self::no_such_container(container_id)),
        }
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, EngineError> {
        self.enter(Op::ListContainers, if all { "all" } else { "running" })
            .await?;
        Ok(self.state.lock().unwrap().listing.clone())
    }
}
