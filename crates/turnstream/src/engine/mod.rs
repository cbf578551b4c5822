//! Stream reconciliation engine.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐  open/resume   ┌───────────┐
//!  │ EngineHandle │───────────────▶│ Transport │
//!  └──────┬───────┘                └─────┬─────┘
//!         │ mpsc commands                │ StreamChannel
//!         ▼                              ▼
//!  ┌──────────────────────────────┐   ┌──────┐
//!  │ StreamEngine (one tokio task)│◀──│ pump │  (one per stream)
//!  │  SessionRegistry             │   └──────┘
//!  │  SequenceDeduplicator        │
//!  │  ContentAccumulator/stream   │──▶ LiveMessages (every envelope)
//!  │  ProjectionScheduler         │──▶ MessageCache (debounced, forced at terminal)
//!  └──────────────┬───────────────┘
//!                 │ broadcast
//!                 ▼
//!            EngineEvent
//! ```
//!
//! Envelope path: registry resolves the owning session, the deduplicator
//! gates the sequence, the router peels off permission and usage traffic,
//! content is folded into the session's accumulator, and the projection
//! updates the live view immediately and the cache on the debounce timer.
//! Terminal envelopes force a final cache write and tear the session down.

mod accumulator;
mod actor;
mod actor_types;
mod dedup;
mod events;
mod handle;
mod notifier;
mod projection;
mod registry;
mod router;
mod tools;
mod view;

pub use accumulator::{ContentAccumulator, ContentSnapshot, PushOutcome};
pub use actor_types::{
    CHANNEL_CAPACITY, EVENT_CAPACITY, EngineError, EngineSettings, StreamInfo, StreamTicket,
};
pub use dedup::{DEFAULT_WINDOW_CAPACITY, SequenceDeduplicator};
pub use events::{EngineEvent, FailureOrigin, StreamFailure};
pub use handle::{EngineBuilder, EngineHandle};
pub use notifier::{LogNotifier, Notifier, SilentNotifier};
pub use projection::{DEFAULT_DEBOUNCE, FlushDue, ProjectionScheduler};
pub use registry::{PumpGuard, SessionRegistry, StreamOrigin, StreamSession};
pub use router::{Routed, Terminal, route};
pub use tools::{ToolAggregateBuilder, ToolTransition, ToolUpsert};
pub use view::LiveMessages;
