//! Versioned response cache with per-class strategies.
//!
//! This module provides:
//! - Named generations of request-keyed response snapshots in SQLite
//! - An install/activate lifecycle that keeps one active generation per slot
//! - Cache-first, network-first and pass-through strategies with offline
//!   fallback and background revalidation

mod generation;
mod refresh;
mod router;
mod storage;
mod types;

pub use generation::{ActivationReport, Generations, InstalledGeneration, Slot};
pub use router::CacheRouter;
pub use storage::{CacheStorage, SqliteStorage};
pub use types::{CacheResult, CacheSource, ResourceEntry};
