use crate::bus::{InboundEvent, Subscription};
use crate::connection::{ConnectionManager, TopicGuard};
use crate::error::ClientError;
use jobpulse_core::normalize::{normalize, CanonicalEvent};
use jobpulse_core::progress::ProgressAggregator;
use jobpulse_core::stream::StreamAggregator;
use jobpulse_core::{conversation_topic, job_topic, JobSnapshot, StreamSnapshot};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

trait Aggregate: Send + 'static {
    type Snapshot: Clone + Send + Sync + 'static;

    fn current(&self) -> Self::Snapshot;
    fn apply_canonical(&mut self, event: &CanonicalEvent) -> bool;
    fn clear(&mut self);
}

impl Aggregate for ProgressAggregator {
    type Snapshot = JobSnapshot;

    fn current(&self) -> JobSnapshot {
        self.snapshot().clone()
    }

    fn apply_canonical(&mut self, event: &CanonicalEvent) -> bool {
        match event {
            CanonicalEvent::Job(event) => self.apply(event),
            CanonicalEvent::Stream(_) => false,
        }
    }

    fn clear(&mut self) {
        self.reset();
    }
}

impl Aggregate for StreamAggregator {
    type Snapshot = StreamSnapshot;

    fn current(&self) -> StreamSnapshot {
        self.snapshot().clone()
    }

    fn apply_canonical(&mut self, event: &CanonicalEvent) -> bool {
        match event {
            CanonicalEvent::Stream(event) => self.apply(event),
            CanonicalEvent::Job(_) => false,
        }
    }

    fn clear(&mut self) {
        self.reset();
    }
}

enum Command {
    Reset,
}

/// Live view of one tracked job or conversation.
///
/// Dropping the watch stops its task, removes its bus listener and leaves
/// its topic. The remote operation keeps running.
pub struct Watch<S> {
    id: String,
    snapshot: watch::Receiver<S>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
    _subscription: Subscription,
    _topic: TopicGuard,
}

pub type JobWatch = Watch<JobSnapshot>;
pub type StreamWatch = Watch<StreamSnapshot>;

impl<S: Clone> Watch<S> {
    /// Job id or conversation id this watch was created for.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> S {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.snapshot.clone()
    }

    /// Resolves with the first snapshot (current one included) matching
    /// `predicate`.
    pub async fn wait_until<F>(&self, mut predicate: F) -> Result<S, ClientError>
    where
        F: FnMut(&S) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| ClientError::TrackerClosed)?;
        Ok(snapshot.clone())
    }

    /// Returns the aggregate to `idle`. Later events for a job are ignored
    /// until a new watch is created.
    pub fn reset(&self) {
        let _ = self.commands.send(Command::Reset);
    }
}

impl<S> Drop for Watch<S> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ConnectionManager {
    /// Tracks `job_id` on its job topic, starting optimistically queued.
    pub fn track_job(&self, job_id: &str) -> JobWatch {
        let mut aggregator = ProgressAggregator::new();
        aggregator.start(job_id);
        spawn_watch(self, job_id, job_topic(job_id), aggregator)
    }

    /// Tracks the streamed reply of `conversation_id`.
    pub fn track_stream(&self, conversation_id: &str) -> StreamWatch {
        spawn_watch(
            self,
            conversation_id,
            conversation_topic(conversation_id),
            StreamAggregator::new(),
        )
    }
}

fn spawn_watch<A: Aggregate>(
    manager: &ConnectionManager,
    id: &str,
    topic: String,
    aggregate: A,
) -> Watch<A::Snapshot> {
    // Listen before joining so nothing delivered right after the join is lost.
    let (subscription, events) = manager.bus().subscribe(&topic);
    let guard = manager.hold_topic(&topic);
    let (snapshot_tx, snapshot_rx) = watch::channel(aggregate.current());
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(drive(aggregate, events, commands_rx, snapshot_tx));
    debug!(event = "watch_started", topic = %topic);
    Watch {
        id: id.to_string(),
        snapshot: snapshot_rx,
        commands: commands_tx,
        task,
        _subscription: subscription,
        _topic: guard,
    }
}

async fn drive<A: Aggregate>(
    mut aggregate: A,
    mut events: mpsc::UnboundedReceiver<InboundEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    snapshot_tx: watch::Sender<A::Snapshot>,
) {
    loop {
        tokio::select! {
            Some(inbound) = events.recv() => {
                let Some(event) = normalize(&inbound.event, &inbound.payload) else {
                    debug!(event = "event_unrecognized", topic = %inbound.topic, name = %inbound.event);
                    continue;
                };
                if aggregate.apply_canonical(&event) {
                    snapshot_tx.send_replace(aggregate.current());
                }
            }
            Some(command) = commands.recv() => match command {
                Command::Reset => {
                    aggregate.clear();
                    snapshot_tx.send_replace(aggregate.current());
                }
            },
            else => break,
        }
    }
}
