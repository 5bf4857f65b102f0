//! Client side of the push channel: one authenticated websocket connection,
//! topic subscriptions that survive reconnects, per-job and per-conversation
//! trackers, and the offline write queue with its replay coordinator.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

mod bus;
mod config;
mod connection;
mod error;
mod replay;
mod tracker;

pub use bus::{EventBus, InboundEvent, Subscription};
pub use config::{ClientConfig, ReconnectPolicy, ReplayConfig, DEFAULT_SYNCED_DISPLAY};
pub use connection::{ConnectionManager, TopicGuard};
pub use error::{ClientError, ReplayError};
pub use replay::{DrainReport, HttpRequestChannel, ReplayCoordinator, RequestChannel, SubmitOutcome};
pub use tracker::{JobWatch, StreamWatch, Watch};

pub use jobpulse_core::{
    ConnectionState, HttpMethod, JobSnapshot, JobStatus, NewAction, QueueStatus, QueuedAction,
    StreamSnapshot, StreamState,
};

/// Credential handed over by the auth layer. Issued and refreshed elsewhere.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub client_id: String,
    pub token: String,
}

impl Identity {
    pub fn new(client_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            token: token.into(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("client_id", &self.client_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
