//! Reliable file transfer over a fingerprint-addressed substrate.
//!
//! The [`Manager`] splits a file into parts, batches them, and transmits
//! each under a single-use fingerprint through a [`Substrate`]. Parts that
//! are not confirmed within the resend wait are transmitted again under a
//! fresh fingerprint until the fingerprint budget runs out. On the receiving
//! side, one processor per expected fingerprint decrypts arriving parts and
//! feeds them into the transfer state.
//!
//! Confirmation works by the sender listening on its own recipient identity:
//! it registers the same fingerprints the receiver does and marks a part
//! received when its own copy arrives.

mod batch;
mod error;
pub mod keys;
pub mod loopback;
mod manager;
pub mod params;
mod receive;
mod resend;
mod send;
pub mod substrate;

pub use error::EngineError;
pub use manager::{
    Manager, ReceivedProgressCallback, SendCompleteCallback, SendRequest, SentProgressCallback,
};
pub use params::Params;
pub use substrate::{Payload, PayloadProcessor, SendReport, Substrate, SubstrateError};

pub use sluice_protocol::{FileInfo, FileLink, TransferId};
pub use sluice_transfer::{ReceivedProgress, SentPartStatus, SentProgress, TransferStatus};
