mod commands;
mod restore;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use restore::PgSettings;
use std::sync::Arc;
use stevedore_common::config::{RuntimeConfig, ENV_DOCKER_HOST, ENV_REQUEST_TIMEOUT};
use stevedore_common::types::{CapturePolicy, ExecSpec, PullPolicy};
use stevedore_engine::{DockerClient, RunOptions, RuntimeClient};
use tracing::info;

#[derive(Parser)]
#[command(name = "stevedore")]
#[command(about = "Stevedore - run commands and one-shot containers on a Docker engine", long_about = None)]
struct Cli {
    /// Engine endpoint (unix:///var/run/docker.sock, tcp://host:2375)
    #[arg(long, global = true, env = "DOCKER_HOST")]
    host: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, global = true, env = "STEVEDORE_REQUEST_TIMEOUT_SECS")]
    timeout: Option<u64>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value = "false")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the engine answers
    Ping,

    /// List all containers, stopped ones included
    Ls {
        /// Print the listing as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Run a command inside a running container
    Exec {
        /// Container name or id
        container: String,

        /// Do not capture stdout
        #[arg(long, default_value = "false")]
        no_stdout: bool,

        /// Do not capture stderr
        #[arg(long, default_value = "false")]
        no_stderr: bool,

        /// Command and arguments, after `--`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Run an image once in a throwaway container
    RunOnce {
        /// Image reference (e.g., hello-world, postgres:16)
        image: String,

        /// Keep only the first stdout chunk
        #[arg(long, default_value = "false")]
        first_chunk: bool,

        /// Pull even when the image is cached
        #[arg(long, default_value = "false")]
        always_pull: bool,
    },

    /// Restore a PostgreSQL dump inside the database container
    RestoreDump {
        /// Database container name
        #[arg(long, default_value = restore::DEFAULT_CONTAINER)]
        container: String,

        /// Dump file path inside the container
        #[arg(long, default_value = restore::DEFAULT_DUMP_FILE)]
        dump_file: String,

        #[arg(long, env = "PG_HOST")]
        pg_host: String,

        #[arg(long, env = "PG_PORT", default_value = restore::DEFAULT_PG_PORT)]
        pg_port: u16,

        #[arg(long, env = "PG_USER")]
        pg_user: String,

        #[arg(long, env = "PG_PASSWORD", hide_env_values = true)]
        pg_password: String,

        #[arg(long, env = "PG_DB")]
        pg_db: String,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // stdout carries captured container output
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Flags win over the environment; anything not given as a flag falls back
/// to the process environment and then to defaults
fn runtime_config(cli: &Cli) -> Result<RuntimeConfig> {
    RuntimeConfig::from_lookup(|key| match key {
        ENV_DOCKER_HOST => cli.host.clone(),
        ENV_REQUEST_TIMEOUT => cli.timeout.map(|t| t.to_string()),
        other => std::env::var(other).ok(),
    })
    .context("Invalid engine configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = runtime_config(&cli)?;
    let client: Arc<dyn RuntimeClient> =
        Arc::new(DockerClient::connect(&config).context("Failed to create engine client")?);
    info!(endpoint = %config.endpoint, "Stevedore starting");

    match cli.command {
        Commands::Ping => {
            commands::ping(client).await?;
        }
        Commands::Ls { json } => {
            commands::list(client, json).await?;
        }
        Commands::Exec {
            container,
            no_stdout,
            no_stderr,
            command,
        } => {
            let spec = ExecSpec::new(command).stdout(!no_stdout).stderr(!no_stderr);
            commands::exec(client, &container, spec).await?;
        }
        Commands::RunOnce {
            image,
            first_chunk,
            always_pull,
        } => {
            let options = RunOptions {
                capture: if first_chunk {
                    CapturePolicy::FirstChunk
                } else {
                    CapturePolicy::Full
                },
                pull: if always_pull {
                    PullPolicy::Always
                } else {
                    PullPolicy::IfMissing
                },
                ..RunOptions::from_config(&config)
            };
            commands::run_once(client, &image, options).await?;
        }
        Commands::RestoreDump {
            container,
            dump_file,
            pg_host,
            pg_port,
            pg_user,
            pg_password,
            pg_db,
        } => {
            let pg = PgSettings {
                host: pg_host,
                port: pg_port,
                user: pg_user,
                password: pg_password,
                database: pg_db,
            };
            commands::restore_dump(client, &container, &dump_file, &pg).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_exec_takes_command_after_separator() {
        let cli = Cli::try_parse_from([
            "stevedore",
            "exec",
            "postgres-db",
            "--no-stderr",
            "--",
            "psql",
            "-c",
            "select 1",
        ])
        .unwrap();

        match cli.command {
            Commands::Exec {
                container,
                no_stdout,
                no_stderr,
                command,
            } => {
                assert_eq!(container, "postgres-db");
                assert!(!no_stdout);
                assert!(no_stderr);
                assert_eq!(command, vec!["psql", "-c", "select 1"]);
            }
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn test_host_flag_overrides_config() {
        let cli = Cli::try_parse_from([
            "stevedore",
            "--host",
            "tcp://engine:2375",
            "--timeout",
            "15",
            "ping",
        ])
        .unwrap();

        let config = runtime_config(&cli).unwrap();
        assert_eq!(config.endpoint.to_string(), "tcp://engine:2375");
        assert_eq!(config.request_timeout_secs, 15);
    }

    #[test]
    fn test_run_once_flags() {
        let cli = Cli::try_parse_from([
            "stevedore",
            "run-once",
            "hello-world",
            "--first-chunk",
        ])
        .unwrap();

        match cli.command {
            Commands::RunOnce {
                image,
                first_chunk,
                always_pull,
            } => {
                assert_eq!(image, "hello-world");
                assert!(first_chunk);
                assert!(!always_pull);
            }
            _ => panic!("expected run-once"),
        }
    }
}
