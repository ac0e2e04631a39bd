//! Pure decision functions for the federation manager.
//!
//! This module is the functional core behind the service objects: every
//! function here is deterministic, performs no I/O and takes time as an
//! explicit parameter. The services gather state under their locks, call
//! into this module, and apply the returned decision.
//!
//! # Tiger Style
//!
//! - Saturating arithmetic for all time calculations
//! - No panics; all functions are total
//!
//! # Module Organization
//!
//! - [`backoff`]: RPC retry spacing and log throttling
//! - [`dependency`]: Dependency expression parsing and aggregation
//! - [`features`]: Cluster feature constraint evaluation
//! - [`lock`]: Cluster-lock grant decisions and fallback tie-breaking
//! - [`reconcile`]: Per-job reconciliation decisions after a resync

pub mod backoff;
pub mod dependency;
pub mod features;
pub mod lock;
pub mod reconcile;
