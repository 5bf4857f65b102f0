use crate::config::ReplayConfig;
use crate::error::ReplayError;
use async_trait::async_trait;
use chrono::Utc;
use jobpulse_core::{HttpMethod, NewAction, QueueStatus, QueuedAction};
use jobpulse_storage::{ActionLog, ActionMirror};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Sends one queued write to the backend.
#[async_trait]
pub trait RequestChannel: Send + Sync {
    async fn execute(&self, action: &QueuedAction) -> Result<(), ReplayError>;
}

/// Plain HTTP request channel. Relative targets are resolved against `base`.
#[derive(Debug, Clone)]
pub struct HttpRequestChannel {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl HttpRequestChannel {
    pub fn new(base: Url) -> Result<Self, ReplayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(client, base))
    }

    pub fn with_client(client: reqwest::Client, base: Url) -> Self {
        Self {
            client,
            base,
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn resolve(&self, target: &str) -> Result<Url, ReplayError> {
        match Url::parse(target) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                self.base
                    .join(target)
                    .map_err(|err| ReplayError::InvalidTarget {
                        target: target.to_string(),
                        reason: err.to_string(),
                    })
            }
            Err(err) => Err(ReplayError::InvalidTarget {
                target: target.to_string(),
                reason: err.to_string(),
            }),
        }
    }
}

fn http_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl RequestChannel for HttpRequestChannel {
    async fn execute(&self, action: &QueuedAction) -> Result<(), ReplayError> {
        let url = self.resolve(&action.target)?;
        let mut request = self.client.request(http_method(action.method), url);
        if action.method.has_body() && !action.payload.is_null() {
            request = request.json(&action.payload);
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReplayError::Status {
                method: action.method.as_str().to_string(),
                target: action.target.clone(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Sent,
    Queued(QueuedAction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    pub replayed: usize,
    /// Entries still in the log afterwards (appended while draining).
    pub retained: usize,
}

struct Inner {
    log: ActionLog,
    mirror: Option<Arc<dyn ActionMirror>>,
    channel: Arc<dyn RequestChannel>,
    config: ReplayConfig,
    status_tx: watch::Sender<QueueStatus>,
    status_epoch: AtomicU64,
    online: AtomicBool,
    drain_lock: AsyncMutex<()>,
}

/// Queues writes made while offline and replays them in order once the
/// client is back online.
#[derive(Clone)]
pub struct ReplayCoordinator {
    inner: Arc<Inner>,
}

impl ReplayCoordinator {
    pub fn new(
        log: ActionLog,
        channel: Arc<dyn RequestChannel>,
        mirror: Option<Arc<dyn ActionMirror>>,
        config: ReplayConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(QueueStatus::Idle);
        Self {
            inner: Arc::new(Inner {
                log,
                mirror,
                channel,
                config,
                status_tx,
                status_epoch: AtomicU64::new(0),
                online: AtomicBool::new(false),
                drain_lock: AsyncMutex::new(()),
            }),
        }
    }

    pub fn status(&self) -> QueueStatus {
        self.inner.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<QueueStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn log(&self) -> &ActionLog {
        &self.inner.log
    }

    pub fn pending(&self) -> Result<Vec<QueuedAction>, ReplayError> {
        Ok(self.inner.log.load()?)
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    /// Appends `action` to the log without touching the network.
    pub fn enqueue(&self, action: NewAction) -> Result<QueuedAction, ReplayError> {
        let queued = self.inner.log.append(action)?;
        if let Some(mirror) = &self.inner.mirror {
            if let Err(err) = mirror.mirror(&queued) {
                warn!(event = "mirror_write_failed", action_id = %queued.id, error = %err);
            }
        }
        info!(
            event = "action_queued",
            action_id = %queued.id,
            method = queued.method.as_str(),
            target = %queued.target
        );
        Ok(queued)
    }

    /// Sends `action` directly while online, the log is empty and no drain is
    /// running. Otherwise, or when the direct attempt fails, the action is
    /// queued behind the earlier writes.
    pub async fn submit(&self, action: NewAction) -> Result<SubmitOutcome, ReplayError> {
        if self.is_online() {
            if let Ok(_guard) = self.inner.drain_lock.try_lock() {
                if self.inner.log.is_empty()? {
                    let attempt = QueuedAction::from_new(action.clone(), Utc::now());
                    match self.inner.channel.execute(&attempt).await {
                        Ok(()) => return Ok(SubmitOutcome::Sent),
                        Err(err) => {
                            warn!(event = "submit_failed", target = %action.target, error = %err);
                        }
                    }
                } else {
                    debug!(event = "submit_deferred", reason = "backlog", target = %action.target);
                }
            } else {
                debug!(event = "submit_deferred", reason = "draining", target = %action.target);
            }
        }
        Ok(SubmitOutcome::Queued(self.enqueue(action)?))
    }

    /// Replays every queued entry in order. Stops at the first failure and
    /// leaves the log untouched; on success removes exactly the replayed
    /// entries.
    pub async fn drain(&self) -> Result<DrainReport, ReplayError> {
        let _guard = self.inner.drain_lock.lock().await;
        self.set_status(QueueStatus::Syncing);
        match self.drain_locked().await {
            Ok(report) if report.replayed == 0 => {
                self.set_status(QueueStatus::Idle);
                Ok(report)
            }
            Ok(report) => {
                self.mark_synced();
                Ok(report)
            }
            Err(err) => {
                self.set_status(QueueStatus::Error(err.to_string()));
                Err(err)
            }
        }
    }

    async fn drain_locked(&self) -> Result<DrainReport, ReplayError> {
        let pending = self.inner.log.load()?;
        if pending.is_empty() {
            debug!(event = "drain_skipped", reason = "empty");
            return Ok(DrainReport::default());
        }
        info!(event = "drain_started", pending = pending.len());

        for (position, action) in pending.iter().enumerate() {
            if let Err(err) = self.inner.channel.execute(action).await {
                warn!(
                    event = "drain_halted",
                    position,
                    action_id = %action.id,
                    error = %err
                );
                return Err(ReplayError::DrainHalted {
                    position,
                    action_id: action.id.clone(),
                    reason: err.to_string(),
                });
            }
            debug!(event = "action_replayed", position, action_id = %action.id);
        }

        let ids: Vec<String> = pending.iter().map(|action| action.id.clone()).collect();
        let replayed = self.inner.log.remove(&ids)?;
        if let Some(mirror) = &self.inner.mirror {
            if let Err(err) = mirror.prune(&ids) {
                warn!(event = "mirror_prune_failed", error = %err);
            }
        }
        let retained = self.inner.log.len()?;
        info!(event = "drain_finished", replayed, retained);
        Ok(DrainReport { replayed, retained })
    }

    /// Drains on every offline -> online transition of `online`, and once at
    /// start when already online.
    pub async fn run_connectivity_watch(&self, mut online: watch::Receiver<bool>) {
        let mut was_online = *online.borrow_and_update();
        self.set_online(was_online);
        if was_online {
            self.drain_logged().await;
        }
        while online.changed().await.is_ok() {
            let now_online = *online.borrow_and_update();
            self.set_online(now_online);
            if now_online && !was_online {
                info!(event = "connectivity_restored");
                self.drain_logged().await;
            } else if !now_online && was_online {
                info!(event = "connectivity_lost");
            }
            was_online = now_online;
        }
        debug!(event = "connectivity_watch_stopped");
    }

    pub fn spawn_connectivity_watch(&self, online: watch::Receiver<bool>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.run_connectivity_watch(online).await })
    }

    async fn drain_logged(&self) {
        if let Err(err) = self.drain().await {
            warn!(event = "drain_failed", error = %err);
        }
    }

    fn set_status(&self, status: QueueStatus) -> u64 {
        let epoch = self.inner.status_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.status_tx.send_replace(status);
        epoch
    }

    fn mark_synced(&self) {
        let epoch = self.set_status(QueueStatus::Synced);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.synced_display).await;
            if inner.status_epoch.load(Ordering::SeqCst) == epoch {
                inner.status_tx.send_replace(QueueStatus::Idle);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SYNCED_DISPLAY;
    use jobpulse_storage::SqliteMirror;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<(HttpMethod, String, serde_json::Value)>>,
        failing: Mutex<HashSet<String>>,
    }

    impl RecordingChannel {
        fn fail_target(&self, target: &str) {
            self.failing.lock().expect("failing").insert(target.to_string());
        }

        fn heal(&self) {
            self.failing.lock().expect("failing").clear();
        }

        fn targets(&self) -> Vec<String> {
            self.sent
                .lock()
                .expect("sent")
                .iter()
                .map(|(_, target, _)| target.clone())
                .collect()
        }
    }

    #[async_trait]
    impl RequestChannel for RecordingChannel {
        async fn execute(&self, action: &QueuedAction) -> Result<(), ReplayError> {
            if self.failing.lock().expect("failing").contains(&action.target) {
                return Err(ReplayError::Failed(format!("{} unavailable", action.target)));
            }
            self.sent.lock().expect("sent").push((
                action.method,
                action.target.clone(),
                action.payload.clone(),
            ));
            Ok(())
        }
    }

    fn coordinator(dir: &TempDir, channel: Arc<RecordingChannel>) -> ReplayCoordinator {
        let log = ActionLog::open(dir.path()).expect("log");
        ReplayCoordinator::new(log, channel, None, ReplayConfig::default())
    }

    #[tokio::test]
    async fn drain_replays_in_enqueue_order_and_empties_log() {
        let dir = TempDir::new().expect("tempdir");
        let channel = Arc::new(RecordingChannel::default());
        let replay = coordinator(&dir, channel.clone());
        for target in ["/x", "/y", "/z"] {
            replay
                .enqueue(NewAction::new(target, HttpMethod::Post, json!({})))
                .expect("enqueue");
        }

        let report = replay.drain().await.expect("drain");
        assert_eq!(report, DrainReport { replayed: 3, retained: 0 });
        assert_eq!(channel.targets(), vec!["/x", "/y", "/z"]);
        assert!(replay.pending().expect("pending").is_empty());
        assert_eq!(replay.status(), QueueStatus::Synced);
    }

    #[tokio::test]
    async fn failed_drain_keeps_every_entry() {
        let dir = TempDir::new().expect("tempdir");
        let channel = Arc::new(RecordingChannel::default());
        let replay = coordinator(&dir, channel.clone());
        for target in ["/x", "/y", "/z"] {
            replay
                .enqueue(NewAction::new(target, HttpMethod::Post, json!({})))
                .expect("enqueue");
        }
        channel.fail_target("/y");

        let err = replay.drain().await.expect_err("drain must fail");
        assert!(matches!(err, ReplayError::DrainHalted { position: 1, .. }));
        assert_eq!(channel.targets(), vec!["/x"]);
        assert_eq!(replay.pending().expect("pending").len(), 3);
        assert!(matches!(replay.status(), QueueStatus::Error(_)));

        // The whole batch goes again, including the entry that already landed.
        channel.heal();
        replay.drain().await.expect("second drain");
        assert_eq!(channel.targets(), vec!["/x", "/x", "/y", "/z"]);
        assert!(replay.pending().expect("pending").is_empty());
    }

    #[tokio::test]
    async fn empty_drain_goes_idle_without_requests() {
        let dir = TempDir::new().expect("tempdir");
        let channel = Arc::new(RecordingChannel::default());
        let replay = coordinator(&dir, channel.clone());

        let report = replay.drain().await.expect("drain");
        assert_eq!(report.replayed, 0);
        assert_eq!(replay.status(), QueueStatus::Idle);
        assert!(channel.targets().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn offline_save_is_replayed_when_back_online() {
        let dir = TempDir::new().expect("tempdir");
        let channel = Arc::new(RecordingChannel::default());
        let replay = coordinator(&dir, channel.clone());
        let (online_tx, online_rx) = watch::channel(false);
        let watcher = replay.spawn_connectivity_watch(online_rx);

        let outcome = replay
            .submit(NewAction::new("/save", HttpMethod::Put, json!({"step": 3})))
            .await
            .expect("submit");
        assert!(matches!(outcome, SubmitOutcome::Queued(_)));
        assert_eq!(replay.pending().expect("pending").len(), 1);
        assert!(channel.targets().is_empty());

        let mut status = replay.subscribe_status();
        online_tx.send(true).expect("online");
        status
            .wait_for(|status| *status == QueueStatus::Synced)
            .await
            .expect("synced");
        {
            let sent = channel.sent.lock().expect("sent");
            assert_eq!(
                sent.as_slice(),
                &[(HttpMethod::Put, "/save".to_string(), json!({"step": 3}))]
            );
        }
        assert!(replay.pending().expect("pending").is_empty());

        tokio::time::sleep(DEFAULT_SYNCED_DISPLAY + Duration::from_millis(10)).await;
        assert_eq!(replay.status(), QueueStatus::Idle);
        watcher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn synced_does_not_overwrite_a_newer_status() {
        let dir = TempDir::new().expect("tempdir");
        let channel = Arc::new(RecordingChannel::default());
        let replay = coordinator(&dir, channel.clone());
        replay
            .enqueue(NewAction::new("/a", HttpMethod::Post, json!({})))
            .expect("enqueue");
        replay.drain().await.expect("drain");
        assert_eq!(replay.status(), QueueStatus::Synced);

        channel.fail_target("/b");
        replay
            .enqueue(NewAction::new("/b", HttpMethod::Post, json!({})))
            .expect("enqueue");
        replay.drain().await.expect_err("drain fails");

        tokio::time::sleep(DEFAULT_SYNCED_DISPLAY * 2).await;
        assert!(matches!(replay.status(), QueueStatus::Error(_)));
    }

    #[tokio::test]
    async fn online_submit_goes_direct_and_falls_back_on_failure() {
        let dir = TempDir::new().expect("tempdir");
        let channel = Arc::new(RecordingChannel::default());
        let replay = coordinator(&dir, channel.clone());
        replay.set_online(true);

        let outcome = replay
            .submit(NewAction::new("/ok", HttpMethod::Post, json!({})))
            .await
            .expect("submit");
        assert_eq!(outcome, SubmitOutcome::Sent);
        assert!(replay.pending().expect("pending").is_empty());

        channel.fail_target("/down");
        let outcome = replay
            .submit(NewAction::new("/down", HttpMethod::Post, json!({})))
            .await
            .expect("submit");
        assert!(matches!(outcome, SubmitOutcome::Queued(_)));
        assert_eq!(replay.pending().expect("pending").len(), 1);
    }

    #[tokio::test]
    async fn online_submit_waits_behind_an_existing_backlog() {
        let dir = TempDir::new().expect("tempdir");
        let channel = Arc::new(RecordingChannel::default());
        let replay = coordinator(&dir, channel.clone());
        replay
            .enqueue(NewAction::new("/x", HttpMethod::Post, json!({})))
            .expect("enqueue");
        replay.set_online(true);

        let outcome = replay
            .submit(NewAction::new("/y", HttpMethod::Post, json!({})))
            .await
            .expect("submit");
        assert!(matches!(outcome, SubmitOutcome::Queued(_)));
        assert!(channel.targets().is_empty());

        replay.drain().await.expect("drain");
        assert_eq!(channel.targets(), vec!["/x", "/y"]);
    }

    #[tokio::test]
    async fn online_submit_is_queued_while_a_drain_holds_the_lock() {
        let dir = TempDir::new().expect("tempdir");
        let channel = Arc::new(RecordingChannel::default());
        let replay = coordinator(&dir, channel.clone());
        replay.set_online(true);

        let guard = replay.inner.drain_lock.lock().await;
        let outcome = replay
            .submit(NewAction::new("/later", HttpMethod::Post, json!({})))
            .await
            .expect("submit");
        drop(guard);
        assert!(matches!(outcome, SubmitOutcome::Queued(_)));
        assert!(channel.targets().is_empty());
        assert_eq!(replay.pending().expect("pending").len(), 1);
    }

    /// Appends one more entry to the log during its first request.
    struct AppendingChannel {
        log: ActionLog,
        extra: Mutex<Option<NewAction>>,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RequestChannel for AppendingChannel {
        async fn execute(&self, action: &QueuedAction) -> Result<(), ReplayError> {
            let extra = self.extra.lock().expect("extra").take();
            if let Some(extra) = extra {
                self.log.append(extra).expect("append mid-drain");
            }
            self.sent.lock().expect("sent").push(action.target.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn entry_enqueued_during_a_drain_survives_it() {
        let dir = TempDir::new().expect("tempdir");
        let log = ActionLog::open(dir.path()).expect("log");
        let channel = Arc::new(AppendingChannel {
            log: log.clone(),
            extra: Mutex::new(Some(NewAction::new("/late", HttpMethod::Post, json!({})))),
            sent: Mutex::new(Vec::new()),
        });
        let replay = ReplayCoordinator::new(log, channel.clone(), None, ReplayConfig::default());
        for target in ["/a", "/b"] {
            replay
                .enqueue(NewAction::new(target, HttpMethod::Post, json!({})))
                .expect("enqueue");
        }

        let report = replay.drain().await.expect("drain");
        assert_eq!(report, DrainReport { replayed: 2, retained: 1 });
        assert_eq!(*channel.sent.lock().expect("sent"), vec!["/a", "/b"]);
        let pending = replay.pending().expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target, "/late");

        replay.drain().await.expect("second drain");
        assert_eq!(*channel.sent.lock().expect("sent"), vec!["/a", "/b", "/late"]);
        assert!(replay.pending().expect("pending").is_empty());
    }

    #[tokio::test]
    async fn mirror_follows_enqueue_and_drain() {
        let dir = TempDir::new().expect("tempdir");
        let channel = Arc::new(RecordingChannel::default());
        let mirror = Arc::new(SqliteMirror::open_in_memory().expect("mirror"));
        let replay = ReplayCoordinator::new(
            ActionLog::open(dir.path()).expect("log"),
            channel,
            Some(mirror.clone() as Arc<dyn ActionMirror>),
            ReplayConfig::default(),
        );
        replay
            .enqueue(NewAction::new("/x", HttpMethod::Patch, json!({"n": 1})))
            .expect("enqueue");
        assert_eq!(mirror.count().expect("count"), 1);

        replay.drain().await.expect("drain");
        assert_eq!(mirror.count().expect("count"), 0);
    }

    #[test]
    fn relative_targets_resolve_against_base() {
        let base = Url::parse("http://127.0.0.1:8080/api/").expect("base");
        let channel = HttpRequestChannel::with_client(reqwest::Client::new(), base);
        assert_eq!(
            channel.resolve("save").expect("relative").as_str(),
            "http://127.0.0.1:8080/api/save"
        );
        assert_eq!(
            channel.resolve("/save").expect("rooted").as_str(),
            "http://127.0.0.1:8080/save"
        );
        assert_eq!(
            channel
                .resolve("https://example.com/x")
                .expect("absolute")
                .as_str(),
            "https://example.com/x"
        );
    }
}
