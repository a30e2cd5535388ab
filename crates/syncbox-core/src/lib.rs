//! syncbox Core - Domain logic and business rules
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `ChangeRecord`, `IndexEntry`, `RemoteChange`, `ConflictReport`
//! - **Reconciliation** - the pure `compute_diff` and the conflict policy
//! - **Error taxonomy** - `SyncError`, `TransferError` and the `ErrorList` aggregate
//! - **Port definitions** - Traits for adapters: `ILocalIndex`, `IRemoteStore`, `IRestClient`
//! - **Configuration** - YAML-backed `Config` with validation
//!
//! # Architecture
//!
//! This crate follows the hexagonal (ports & adapters) architecture pattern.
//! The domain module contains pure business logic with no I/O.
//! Ports define trait interfaces that adapter crates implement.

pub mod config;
pub mod domain;
pub mod ports;
