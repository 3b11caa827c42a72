//! Talk Store - conversation and message persistence
//!
//! Conversations ("talks") and their append-only message logs live behind the
//! [`TalkStore`] trait. Two backends are provided: [`MemoryTalkStore`] for
//! standalone deployments and tests, and [`SqliteTalkStore`] for anything that
//! has to survive a restart or be shared between processes.
//!
//! Every scope-aware operation takes a [`ScopeTags`] filter. An empty filter is
//! unrestricted; a talk outside the filter behaves exactly like a missing one.

pub mod error;
pub mod ids;
pub mod memory;
pub mod models;
pub mod sqlite;
pub mod store;

pub use error::StoreError;
pub use ids::{IdGenerator, MAX_NODE_ID, SequentialIds, SnowflakeIds};
pub use memory::MemoryTalkStore;
pub use models::{MessageBody, NewTalk, ScopeTags, TalkInfo, TalkMessage, TalkQuery, TalkStatus};
pub use sqlite::SqliteTalkStore;
pub use store::TalkStore;
