//! Message storage.
//!
//! The engine depends only on the [`MessageCache`] trait. The bundled
//! [`InMemoryMessageCache`] backs the CLI and the test suite.

mod cache;
mod error;
mod memory;
mod ordered;

pub use cache::MessageCache;
pub use error::{StorageError, StorageResult};
pub use memory::InMemoryMessageCache;
pub(crate) use ordered::OrderedMessages;
