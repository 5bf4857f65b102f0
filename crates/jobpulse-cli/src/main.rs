use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobpulse_core::logging::{self, Console, LogSettings};
use std::path::PathBuf;

mod queue;
mod watch;

const DEFAULT_HUB_URL: &str = "ws://127.0.0.1:42710/ws";
const DEFAULT_API_URL: &str = "http://127.0.0.1:8080/";

#[derive(Parser)]
#[command(name = "jobpulse")]
#[command(about = "Follow background jobs and replay queued writes", long_about = None)]
struct Cli {
    /// Directory holding the pending action log and its mirror
    #[arg(long, global = true, default_value = "")]
    data_dir: String,
    /// Also append logs to a file in this directory
    #[arg(long, global = true, default_value = "")]
    log_dir: String,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone, Debug)]
struct HubArgs {
    #[arg(long, default_value = "")]
    hub_url: String,
    #[arg(long, default_value = "")]
    token: String,
    #[arg(long, default_value = "jobpulse-cli")]
    client_id: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Print job snapshots until the job completes or fails
    WatchJob {
        job_id: String,
        #[command(flatten)]
        hub: HubArgs,
    },
    /// Print a conversation's streamed reply until it ends
    WatchStream {
        conversation_id: String,
        #[command(flatten)]
        hub: HubArgs,
    },
    /// Inspect and replay the offline write queue
    Queue {
        #[command(subcommand)]
        action: QueueCommands,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Queue a write without sending it
    Enqueue {
        #[arg(long)]
        method: String,
        #[arg(long)]
        target: String,
        /// JSON body
        #[arg(long, default_value = "null")]
        payload: String,
    },
    List,
    /// Replay every queued write against the API
    Drain {
        #[arg(long, default_value = "")]
        api_url: String,
        #[arg(long, default_value = "")]
        token: String,
    },
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&log_settings(&cli));
    let data_dir = resolve_data_dir(&cli.data_dir)?;

    match cli.command {
        Commands::WatchJob { job_id, hub } => watch::watch_job(&hub.into_settings()?, &job_id).await,
        Commands::WatchStream {
            conversation_id,
            hub,
        } => watch::watch_stream(&hub.into_settings()?, &conversation_id).await,
        Commands::Queue { action } => match action {
            QueueCommands::Enqueue {
                method,
                target,
                payload,
            } => queue::enqueue(&data_dir, &method, &target, &payload),
            QueueCommands::List => queue::list(&data_dir),
            QueueCommands::Drain { api_url, token } => {
                let api_url = resolve_api_url(&api_url)?;
                queue::drain(&data_dir, api_url, resolve_token(&token)).await
            }
            QueueCommands::Clear => queue::clear(&data_dir),
        },
    }
}

impl HubArgs {
    fn into_settings(self) -> Result<watch::HubSettings> {
        let token = resolve_token(&self.token)
            .context("a token is required: pass --token or set JOBPULSE_TOKEN")?;
        Ok(watch::HubSettings {
            hub_url: resolve_hub_url(&self.hub_url)?,
            client_id: self.client_id,
            token,
        })
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_with_env(flag: &str, key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    env_value(key)
}

fn resolve_hub_url(flag: &str) -> Result<url::Url> {
    let raw = resolve_with_env(flag, "JOBPULSE_HUB_URL").unwrap_or_else(|| DEFAULT_HUB_URL.to_string());
    url::Url::parse(&raw).with_context(|| format!("invalid hub url: {raw}"))
}

fn resolve_api_url(flag: &str) -> Result<url::Url> {
    let raw = resolve_with_env(flag, "JOBPULSE_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
    url::Url::parse(&raw).with_context(|| format!("invalid api url: {raw}"))
}

fn resolve_token(flag: &str) -> Option<String> {
    resolve_with_env(flag, "JOBPULSE_TOKEN")
}

fn resolve_log_dir(flag: &str) -> String {
    resolve_with_env(flag, "JOBPULSE_LOG_DIR").unwrap_or_default()
}

fn log_settings(cli: &Cli) -> LogSettings {
    LogSettings {
        default_level: "warn",
        debug: cli.debug,
        log_dir: resolve_log_dir(&cli.log_dir),
        ..LogSettings::new("jobpulse-cli", Console::Stderr)
    }
}

fn resolve_data_dir(flag: &str) -> Result<PathBuf> {
    if let Some(dir) = resolve_with_env(flag, "JOBPULSE_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let base = dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .context("could not determine a data directory; pass --data-dir")?;
    Ok(base.join("jobpulse"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_beats_environment() {
        assert_eq!(
            resolve_with_env("from-flag", "JOBPULSE_TEST_UNSET_KEY"),
            Some("from-flag".to_string())
        );
        assert_eq!(resolve_with_env("  ", "JOBPULSE_TEST_UNSET_KEY"), None);
    }

    #[test]
    fn explicit_hub_url_is_parsed() {
        let url = resolve_hub_url("ws://127.0.0.1:9000/ws").expect("url");
        assert_eq!(url.port(), Some(9000));
        assert!(resolve_hub_url("not a url").is_err());
    }

    #[test]
    fn cli_logs_to_stderr_so_stdout_stays_parseable() {
        let cli = Cli::try_parse_from([
            "jobpulse",
            "--debug",
            "--log-dir",
            "/tmp/jp",
            "queue",
            "list",
        ])
        .expect("parse");
        let settings = log_settings(&cli);
        assert_eq!(settings.console, Console::Stderr);
        assert_eq!(settings.level(), "debug");
        assert_eq!(
            settings.log_file(),
            Some(PathBuf::from("/tmp/jp/jobpulse-cli.log"))
        );
    }

    #[test]
    fn cli_parses_queue_enqueue() {
        let cli = Cli::try_parse_from([
            "jobpulse",
            "--data-dir",
            "/tmp/x",
            "queue",
            "enqueue",
            "--method",
            "PUT",
            "--target",
            "/save",
            "--payload",
            "{\"step\":3}",
        ])
        .expect("parse");
        assert_eq!(cli.data_dir, "/tmp/x");
        assert!(matches!(
            cli.command,
            Commands::Queue {
                action: QueueCommands::Enqueue { .. }
            }
        ));
    }
}
