pub mod client;
pub mod demux;
pub mod error;
pub mod exec;
pub mod inventory;
pub mod orchestrator;

#[cfg(test)]
mod testing;

pub use client::{DockerClient, RuntimeClient};
pub use error::{CoreError, CoreResult, EngineError, RunError};
pub use exec::ExecSession;
pub use inventory::ContainerInventory;
pub use orchestrator::{EphemeralRunner, RunOptions};
