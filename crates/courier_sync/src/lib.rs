//! # Courier Sync
//!
//! Keeps a local object store and a messaging backend in agreement.
//!
//! This crate provides:
//! - An object store contract with all-or-nothing change batches
//! - Transcoders that turn dirty objects into requests and responses back
//!   into store changes
//! - A tiered transcoder registry and the polling strategy driving it
//! - An outstanding-item tracker with retry and backoff
//! - The sync engine actor and its handle
//! - Transcoders for clients, users, connections, conversations and messages
//!
//! ## Architecture
//!
//! Local edits mark objects dirty. The engine hears about every store
//! transaction and forwards it to the transcoders, which queue work. Each
//! time the scheduler has a free slot, the strategy asks transcoders in
//! tier order for a request. Responses come back on the engine task and
//! are applied as sync-origin changes, which never queue upstream work.
//! Push events are applied the same way.
//!
//! ## Key Invariants
//!
//! - Only the engine task touches transcoder state
//! - A transcoder's responses are applied in admission order
//! - An object is never in flight twice at the same time
//! - Remote changes never overwrite keys with unpushed local edits
//! - Synchronization is complete only when every transcoder is idle

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod error;
mod outstanding;
mod registry;
mod store;
mod transcoder;
pub mod transcoders;

pub use engine::{EngineConfig, EngineStats, EngineStatus, SyncEngine, SyncEngineHandle};
pub use error::{StoreError, StoreResult, SyncError, SyncResult};
pub use outstanding::{Disposition, OutstandingItems, SyncState};
pub use registry::{Admission, PollOutcome, ResponseSequencer, SyncStrategy, TranscoderRegistry};
pub use store::{
    perform_changes, ChangeBatch, ChangeOrigin, ChangeSet, EntityKind, Fields, MemoryStore,
    Mutation, ObjectChange, ObjectId, ObjectStore, Record, StoreConfig,
};
pub use transcoder::{
    acknowledge, object_fields, remote_id_of, DownstreamCodec, DownstreamSync, EntityTranscoder,
    EventHandler, Page, PagedCodec, PagedSync, Push, SyncPart, Tier, Transcoder, UpstreamChange,
    UpstreamCodec, UpstreamSync,
};
pub use transcoders::default_registry;
