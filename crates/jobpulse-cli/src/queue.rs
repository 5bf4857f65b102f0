use anyhow::{Context, Result};
use jobpulse_client::{
    HttpMethod, HttpRequestChannel, NewAction, ReplayConfig, ReplayCoordinator, RequestChannel,
};
use jobpulse_storage::{ActionLog, ActionMirror, SqliteMirror};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;
use url::Url;

const MIRROR_FILE: &str = "mirror.sqlite";

fn open_mirror(data_dir: &Path) -> Option<Arc<dyn ActionMirror>> {
    match SqliteMirror::open(data_dir.join(MIRROR_FILE)) {
        Ok(mirror) => Some(Arc::new(mirror)),
        Err(err) => {
            warn!(event = "mirror_unavailable", error = %err);
            None
        }
    }
}

fn coordinator(data_dir: &Path, channel: Arc<dyn RequestChannel>) -> Result<ReplayCoordinator> {
    let log = ActionLog::open(data_dir)
        .with_context(|| format!("failed to open action log in {}", data_dir.display()))?;
    Ok(ReplayCoordinator::new(
        log,
        channel,
        open_mirror(data_dir),
        ReplayConfig::default(),
    ))
}

pub fn parse_action(method: &str, target: &str, payload: &str) -> Result<NewAction> {
    let method: HttpMethod = method.parse().map_err(anyhow::Error::msg)?;
    let payload: Value = serde_json::from_str(payload).context("payload is not valid JSON")?;
    anyhow::ensure!(!target.trim().is_empty(), "target must not be empty");
    Ok(NewAction::new(target, method, payload))
}

pub fn enqueue(data_dir: &Path, method: &str, target: &str, payload: &str) -> Result<()> {
    let action = parse_action(method, target, payload)?;
    let log = ActionLog::open(data_dir).context("failed to open action log")?;
    let queued = log.append(action).context("failed to queue action")?;
    if let Some(mirror) = open_mirror(data_dir) {
        if let Err(err) = mirror.mirror(&queued) {
            warn!(event = "mirror_write_failed", action_id = %queued.id, error = %err);
        }
    }
    println!("{}", queued.id);
    Ok(())
}

pub fn list(data_dir: &Path) -> Result<()> {
    let log = ActionLog::open(data_dir).context("failed to open action log")?;
    let actions = log.load().context("failed to read action log")?;
    if actions.is_empty() {
        println!("No queued actions");
        return Ok(());
    }
    for action in actions {
        println!(
            "{} {} {} {} {}",
            action.id,
            action.enqueued_at.to_rfc3339(),
            action.method,
            action.target,
            action.payload
        );
    }
    Ok(())
}

pub async fn drain(data_dir: &Path, api_url: Url, token: Option<String>) -> Result<()> {
    let mut channel = HttpRequestChannel::new(api_url).context("failed to build HTTP client")?;
    if let Some(token) = token {
        channel = channel.with_token(token);
    }
    let replay = coordinator(data_dir, Arc::new(channel))?;
    let report = replay.drain().await.context("replay stopped")?;
    println!(
        "Replayed {} action(s), {} still queued",
        report.replayed, report.retained
    );
    Ok(())
}

pub fn clear(data_dir: &Path) -> Result<()> {
    let log = ActionLog::open(data_dir).context("failed to open action log")?;
    let ids: Vec<String> = log
        .load()
        .context("failed to read action log")?
        .into_iter()
        .map(|action| action.id)
        .collect();
    let removed = log.remove(&ids).context("failed to clear action log")?;
    if let Some(mirror) = open_mirror(data_dir) {
        if let Err(err) = mirror.prune(&ids) {
            warn!(event = "mirror_prune_failed", error = %err);
        }
    }
    println!("Removed {removed} queued action(s)");
    Ok(())
}
