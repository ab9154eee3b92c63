//! Infrastructure Layer
//!
//! Stateful engines built on the domain ports.

pub mod action_queue;
pub mod cache_store;
pub mod codec;
pub mod conflict_engine;
pub mod shutdown;

pub use action_queue::{
    ActionFilter, ActionQueue, PassSummary, QueueConfig, QueueEvent, QueueStats, TerminalFailureHook,
};
pub use cache_store::{CacheConfig, CacheStore};
pub use codec::{CodecError, PayloadCodec};
pub use conflict_engine::{ConflictConfig, ConflictEngine, ConflictEvent, ConflictStats};
pub use shutdown::{PassGuard, ShutdownController};
