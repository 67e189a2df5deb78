//! Error taxonomy for the sync engine.
//!
//! Validation and duplicate conditions are handled inside the orchestrator
//! (logged, never thrown). Persistence errors surface to the caller because
//! durability cannot be guaranteed. Transport and reconciliation errors are
//! logged and retried by their loops.

use thiserror::Error;

use crate::models::{KitchenItemStatus, OrderStatus};

/// Local durable-storage failure.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialize {entity}: {source}")]
    Serialize {
        entity: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("{0}")]
    Other(String),
}

/// Inbound order failed kitchen validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("order has no order number")]
    MissingOrderNumber,

    #[error("order has no items")]
    NoItems,

    #[error("item #{index} has no name")]
    MissingItemName { index: usize },

    #[error("item #{index} has no quantity")]
    InvalidQuantity { index: usize },
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator is not started")]
    NotStarted,

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("invalid kitchen transition {from} -> {to}")]
    InvalidKitchenTransition {
        from: KitchenItemStatus,
        to: KitchenItemStatus,
    },

    #[error("persistence: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("ledger: {0}")]
    Ledger(String),
}

/// Channel-level failure. Never fatal to order processing.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake: {0}")]
    Handshake(String),

    #[error("registration rejected: {message} ({code})")]
    Rejected { message: String, code: String },

    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("discovery: {0}")]
    Discovery(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

/// Remote API failure.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("remote API not configured: {0}")]
    NotConfigured(&'static str),

    #[error("{0}")]
    Network(String),

    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },

    #[error("invalid response from remote API: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Backpressure responses are deferred without counting as a retry.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, ApiError::Status { status: 429, .. })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid {field}: {value}")]
    Invalid { field: &'static str, value: String },

    #[error("persistence: {0}")]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("persistence: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("orchestrator: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid inbound order: {0}")]
    Ingest(#[from] serde_json::Error),

    #[error("{0} devices do not take orders")]
    NotOrderTerminal(crate::config::DeviceRole),
}
