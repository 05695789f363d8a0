//! Offline-first sync engine
//!
//! Provides:
//! - Idempotent processing of queued client actions
//! - Version-based conflict detection and configurable resolution
//! - Paged incremental downloads
//!
//! # Upload Protocol
//!
//! 1. Client sends an `UploadRequest` with its queued actions
//! 2. Each action is recorded under its client id; replays return the stored result
//! 3. Actions edited from an outdated version conflict if someone else changed the entity
//! 4. Conflicts are resolved with the strategy configured for the entity type
//! 5. Client clears `success` results and resolved conflicts, retries the rest
//!
//! # Conflict Resolution
//!
//! - `server_wins` (default): the server state stands, client discards its copy
//! - `client_wins`: the client change is written on top of the server state
//! - `merge`: field-level three-way merge, falling back to manual
//! - `manual`: a reviewer settles the conflict later
//! - A deletion on the server always wins

mod action;
mod action_log;
mod applier;
mod conflict;
mod coordinator;
mod delta;
mod resolver;
mod state_store;
mod types;

pub use action::{ActionPayload, GroupKey, ValidatedAction};
pub use action_log::{ActionLog, Recorded};
pub use applier::{ActionApplier, ApplyOutcome, EntityWrite};
pub use conflict::{ConflictDetector, ConflictLog, Verdict};
pub use coordinator::{sync_health, SyncCoordinator};
pub use delta::{DeltaPage, DeltaProducer};
pub use resolver::{merge_fields, AutoResolution, ConflictResolver, FieldPolicy, MergePolicy};
pub use state_store::SyncStateStore;
pub use types::{
    ActionResult, ActionStatus, ActionType, ClientSyncState, ConflictStatus, ConflictStrategy,
    DownloadQuery, DownloadResponse, OfflineAction, ResolveConflictRequest,
    ResolveConflictResponse, ResultStatus, StatusQuery, StatusResponse, SyncConflict, SyncHealth,
    UploadAction, UploadRequest, UploadResponse,
};
