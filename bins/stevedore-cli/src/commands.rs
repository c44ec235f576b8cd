// CLI commands, each a thin caller of the engine core
use crate::restore::{self, PgSettings};
use anyhow::{bail, Context, Result};
use std::io::Write;
use std::sync::Arc;
use stevedore_common::types::{ContainerRef, ExecResult, ExecSpec, ImageRef};
use stevedore_engine::{
    ContainerInventory, ExecSession, EphemeralRunner, RunError, RunOptions, RuntimeClient,
};
use tracing::info;

pub async fn ping(client: Arc<dyn RuntimeClient>) -> Result<()> {
    client
        .ping()
        .await
        .context("Container engine did not answer")?;
    println!("✅ Engine is reachable");
    Ok(())
}

pub async fn list(client: Arc<dyn RuntimeClient>, json: bool) -> Result<()> {
    let containers = ContainerInventory::new(client)
        .list_all()
        .await
        .context("Failed to list containers")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&containers)?);
        return Ok(());
    }

    println!("{:<14} {:<28} {:<28} {:<10} {}", "ID", "NAME", "IMAGE", "STATE", "STATUS");
    for c in &containers {
        println!(
            "{:<14} {:<28} {:<28} {:<10} {}",
            c.id.get(..12).unwrap_or(&c.id),
            c.display_name(),
            c.image,
            c.state,
            c.status
        );
    }
    Ok(())
}

pub async fn exec(
    client: Arc<dyn RuntimeClient>,
    container: &str,
    spec: ExecSpec,
) -> Result<()> {
    let container = ContainerRef::new(container);
    let outcome = ExecSession::new(client)
        .exec_in_container(&container, &spec)
        .await;
    finish(outcome).with_context(|| format!("Exec in {} failed", container))
}

pub async fn run_once(
    client: Arc<dyn RuntimeClient>,
    image: &str,
    options: RunOptions,
) -> Result<()> {
    let image: ImageRef = image.parse()?;
    let outcome = EphemeralRunner::new(client, options).run_once(&image).await;
    finish(outcome).with_context(|| format!("Run of {} failed", image))
}

pub async fn restore_dump(
    client: Arc<dyn RuntimeClient>,
    container: &str,
    dump_file: &str,
    pg: &PgSettings,
) -> Result<()> {
    info!(container = container, dump_file = dump_file, database = %pg.database, "Restoring database dump");
    eprintln!("🐘 Restoring {} into {} ({})", dump_file, pg.database, container);

    let spec = restore::restore_command(pg, dump_file);
    exec(client, container, spec).await?;

    eprintln!("✅ Restore finished");
    Ok(())
}

/// Write captured output to stdout, then turn the outcome into a process result
fn finish(outcome: Result<ExecResult, RunError>) -> Result<()> {
    match outcome {
        Ok(result) => {
            write_output(&result)?;
            match result.exit_code {
                Some(0) | None => Ok(()),
                Some(code) => bail!("command exited with code {}", code),
            }
        }
        Err(err) => {
            write_output(&err.partial)?;
            if err.is_retryable() {
                eprintln!("⚠️  The failure looks transient; retrying may succeed");
            }
            Err(err.into())
        }
    }
}

fn write_output(result: &ExecResult) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&result.combined_output)?;
    stdout.flush()?;

    if let Some(warning) = &result.cleanup_warning {
        eprintln!("⚠️  {}", warning);
    }
    Ok(())
}
