use anyhow::{Context, Result};
use jobpulse_client::{
    ClientConfig, ConnectionManager, Identity, JobSnapshot, StreamSnapshot, StreamState,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;
use url::Url;

pub struct HubSettings {
    pub hub_url: Url,
    pub client_id: String,
    pub token: String,
}

async fn connect(settings: &HubSettings) -> Result<ConnectionManager> {
    let manager = ConnectionManager::new(ClientConfig::new(settings.hub_url.clone()));
    manager
        .connect(Identity::new(
            settings.client_id.clone(),
            settings.token.clone(),
        ))
        .await
        .with_context(|| format!("failed to connect to {}", settings.hub_url))?;
    Ok(manager)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value).context("failed to encode snapshot")?);
    Ok(())
}

/// Prints every snapshot change until `done` holds or ctrl-c. Returns the
/// last snapshot seen.
async fn follow<S, F>(mut rx: watch::Receiver<S>, done: F) -> Result<S>
where
    S: Clone + Serialize,
    F: Fn(&S) -> bool,
{
    loop {
        let current = rx.borrow_and_update().clone();
        print_json(&current)?;
        if done(&current) {
            return Ok(current);
        }
        tokio::select! {
            changed = rx.changed() => {
                changed.context("tracker stopped")?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!(event = "watch_interrupted");
                return Ok(current);
            }
        }
    }
}

pub async fn watch_job(settings: &HubSettings, job_id: &str) -> Result<()> {
    let manager = connect(settings).await?;
    let tracker = manager.track_job(job_id);
    let last: JobSnapshot = follow(tracker.subscribe(), |snapshot: &JobSnapshot| {
        snapshot.status.is_terminal()
    })
    .await?;
    drop(tracker);
    manager.disconnect().await;
    if let Some(error) = last.error {
        anyhow::bail!("job {job_id} failed: {error}");
    }
    Ok(())
}

pub async fn watch_stream(settings: &HubSettings, conversation_id: &str) -> Result<()> {
    let manager = connect(settings).await?;
    let tracker = manager.track_stream(conversation_id);
    let last: StreamSnapshot = follow(tracker.subscribe(), |snapshot: &StreamSnapshot| {
        matches!(snapshot.state, StreamState::Finalized | StreamState::Error)
    })
    .await?;
    drop(tracker);
    manager.disconnect().await;
    if let Some(error) = last.error {
        anyhow::bail!("stream {conversation_id} failed: {error}");
    }
    Ok(())
}
