//! Stream reconciliation and incremental rendering for resumable agent
//! conversations.
//!
//! Assistant replies arrive as an ordered, chunked feed of envelopes that may
//! be duplicated, resumed mid-message, or handed over to a queued follow-up.
//! [`engine::EngineHandle`] folds that feed into a coherent transcript held in
//! a live view and persisted through a [`store::MessageCache`].

pub mod config;
pub mod engine;
pub mod message;
pub mod store;
pub mod transport;

pub use turnstream_protocol as protocol;

/// Build information.
pub mod build_info {
    /// Crate version.
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
