use clap::Parser;
use jobpulse_core::logging::{self, Console, LogSettings};
use jobpulse_hub::{serve, HubConfig, HubState};
use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Duration};
use tracing::{error, info};

const DEFAULT_ADDR: &str = "127.0.0.1:42710";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    tokens: HashSet<String>,
    debug: bool,
    handshake_timeout: Duration,
    write_timeout: Duration,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "jobpulse-hub", about = "Development push hub for jobpulse clients")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    /// Comma separated list of accepted tokens; empty accepts any token.
    #[arg(long, default_value = "")]
    tokens: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 10)]
    handshake_timeout: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    logging::init(&log_settings(&config));
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %config.addr, reason = "loopback_only");
        return;
    }

    let hub = Arc::new(HubState::new(HubConfig {
        tokens: config.tokens.clone(),
        handshake_timeout: config.handshake_timeout,
        write_timeout: config.write_timeout,
        ..HubConfig::default()
    }));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        open = config.tokens.is_empty()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    if let Err(err) = serve(listener, hub, shutdown).await {
        error!(event = "hub_error", error = %err);
    }
    info!(event = "hub_stop");
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_addr(&args.addr),
        tokens: resolve_tokens(&args.tokens),
        debug: args.debug || env_true("JOBPULSE_HUB_DEBUG"),
        handshake_timeout: Duration::from_secs(args.handshake_timeout),
        write_timeout: Duration::from_secs(args.write_timeout),
        log_dir: resolve_log_dir(&args.log_dir),
    }
}

fn log_settings(config: &Config) -> LogSettings {
    LogSettings {
        debug: config.debug,
        log_dir: config.log_dir.clone(),
        ..LogSettings::new("jobpulse-hub", Console::Stdout)
    }
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Ok(value) = std::env::var("JOBPULSE_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    DEFAULT_ADDR.to_string()
}

fn resolve_tokens(tokens_flag: &str) -> HashSet<String> {
    let raw = if !tokens_flag.trim().is_empty() {
        tokens_flag.to_string()
    } else {
        std::env::var("JOBPULSE_HUB_TOKENS").unwrap_or_default()
    };
    parse_tokens(&raw)
}

fn parse_tokens(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    if let Ok(value) = std::env::var("JOBPULSE_LOG_DIR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_split_and_trimmed() {
        let tokens = parse_tokens(" alpha, beta ,,gamma");
        assert_eq!(tokens.len(), 3);
        assert!(tokens.contains("beta"));
        assert!(parse_tokens("").is_empty());
    }

    #[test]
    fn hub_logs_to_stdout_and_its_own_file() {
        let settings = log_settings(&Config {
            addr: DEFAULT_ADDR.to_string(),
            tokens: HashSet::new(),
            debug: true,
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            log_dir: "/tmp/jobpulse-logs".to_string(),
        });
        assert_eq!(settings.console, Console::Stdout);
        assert_eq!(settings.level(), "debug");
        assert_eq!(
            settings.log_file(),
            Some(std::path::PathBuf::from("/tmp/jobpulse-logs/jobpulse-hub.log"))
        );
    }

    #[test]
    fn addr_flag_wins() {
        assert_eq!(resolve_addr("127.0.0.1:9000"), "127.0.0.1:9000");
    }
}
