//! Multi-exchange price-feed oracle core: ingest raw venue ticks, validate them, aggregate
//! them into a per-feed consensus price, and serve that consensus through a small request API
//! plus a health/alert bus. The HTTP/RPC surface, configuration file watching, and alert
//! delivery transports are external collaborators; this crate only implements the core (C1…C9).
//!
//! Grounded on the teacher's own crate root (`src/lib.rs`), which re-exports its modules flatly
//! with no internal `prelude`.

pub mod adapters;
pub mod aggregator;
pub mod cache;
pub mod config;
pub mod error;
pub mod feeds;
pub mod health;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod resilience;
pub mod validator;
