//! Civic Sync Server Library
//!
//! Offline-first synchronization and conflict resolution for civic issue
//! reporting clients.
//!
//! # Modules
//!
//! - `sync`: the sync engine (action log, conflict handling, deltas)
//! - `entities`: syncable entity types and the entity access interface
//! - `routes`: HTTP surface

pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod routes;
pub mod state;
pub mod sync;
pub mod time;
