//! Error types for the transfer engine.

use sluice_protocol::{ProtocolError, TransferId};
use sluice_transfer::TransferError;

use crate::substrate::SubstrateError;

/// Errors produced by the transfer manager.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("substrate error: {0}")]
    Substrate(#[from] SubstrateError),

    #[error("network is not healthy")]
    NetworkUnhealthy,

    #[error("manager has not been started")]
    NotStarted,

    #[error("manager has already been started")]
    AlreadyStarted,

    #[error("transfer {0} has not failed")]
    NotFailed(TransferId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
