//! The Small Sync - order orchestration and dual-path sync engine.
//!
//! One process per device. The order terminal (`pos`) owns the
//! [`orchestrator::OrderOrchestrator`] and hosts the local mesh; kitchen and
//! bump displays keep a [`replica::KitchenReplica`]. Every device talks to
//! the cloud coordinator and to the local mesh through one
//! [`sync::SyncTransport`]. [`node::SyncNode`] wires it all together.

pub mod api;
pub mod board;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod kitchen;
pub mod logging;
pub mod mapping;
pub mod models;
pub mod node;
pub mod orchestrator;
pub mod print;
pub mod reconcile;
pub mod replica;
pub mod repository;
pub mod roster;
pub mod router;
pub mod sinks;
pub mod storage;
pub mod sync;

pub use config::{DeviceRole, Environment, NodeArgs, NodeConfig};
pub use error::NodeError;
pub use node::SyncNode;

/// Version string with the build's git SHA and timestamp.
pub const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("BUILD_GIT_SHA"),
    ", built ",
    env!("BUILD_TIMESTAMP"),
    ")"
);
