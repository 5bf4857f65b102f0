use jobpulse_core::wire::FrameError;
use jobpulse_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("missing credential: an authenticated identity is required")]
    MissingCredential,
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("handshake rejected ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("connection closed during handshake")]
    ClosedDuringHandshake,
    #[error("tracker closed")]
    TrackerClosed,
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },
    #[error("{method} {target} returned status {status}")]
    Status {
        method: String,
        target: String,
        status: u16,
    },
    #[error("request failed: {0}")]
    Failed(String),
    #[error("drain halted at entry {position} ({action_id}): {reason}")]
    DrainHalted {
        position: usize,
        action_id: String,
        reason: String,
    },
}
