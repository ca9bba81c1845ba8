//! localsync Core - Domain model and business rules
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `Schema`, `ModelDefinition`, `ModelInstance`, `MutationEvent`, `ModelMetadata`
//! - **Condition engine** - immutable predicate trees with optimizer, negator, matcher and fetch compiler
//! - **Port definitions** - Traits for adapters: `IStorageAdapter`, `IRemoteApi`, `ISyncFeed`, ...
//! - **Configuration** - YAML-backed engine settings
//!
//! # Architecture
//!
//! The domain module holds pure data types with no I/O. Ports define trait
//! interfaces that adapter crates implement (`localsync-cache` for storage,
//! application code for the remote side). The sync crate orchestrates domain
//! entities through these ports.

pub mod condition;
pub mod config;
pub mod domain;
pub mod ports;
