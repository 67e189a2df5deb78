//! Node configuration.
//!
//! Resolution order per field: command line / `SMALL_SYNC_*` environment
//! variable, then the OS keyring (secrets and tenant only), then the
//! `local_settings` table, then built-in defaults. The device id is generated
//! once and persisted so a node keeps its identity across restarts.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Args;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api;
use crate::db;
use crate::error::ConfigError;
use crate::storage;

pub const DEFAULT_MESH_PORT: u16 = 3847;
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_RECONCILE_STARTUP_DELAY_SECS: u64 = 30;
pub const DEFAULT_BATCH_SIZE: usize = 50;

pub const SETTINGS_CATEGORY: &str = "node";

/// Device role on the site. Exactly one `pos` per site hosts the local mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Pos,
    Kds,
    Bds,
    Manager,
}

impl DeviceRole {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceRole::Pos => "pos",
            DeviceRole::Kds => "kds",
            DeviceRole::Bds => "bds",
            DeviceRole::Manager => "manager",
        }
    }

    /// Order-taking terminal: owns the orchestrator and serves the mesh.
    pub fn is_order_terminal(self) -> bool {
        self == DeviceRole::Pos
    }

    /// Kitchen or bump display: keeps a replica of kitchen tickets.
    pub fn is_display(self) -> bool {
        matches!(self, DeviceRole::Kds | DeviceRole::Bds)
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceRole {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pos" => Ok(DeviceRole::Pos),
            "kds" | "kitchen" => Ok(DeviceRole::Kds),
            "bds" | "bump" => Ok(DeviceRole::Bds),
            "manager" => Ok(DeviceRole::Manager),
            other => Err(format!("unknown device role: {other}")),
        }
    }
}

/// Host capabilities, passed explicitly instead of probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Environment {
    /// Durable on-disk storage is available.
    pub has_local_persistence: bool,
    /// Raw sockets / multicast are available for the local mesh.
    pub has_native_bridge: bool,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            has_local_persistence: true,
            has_native_bridge: true,
        }
    }
}

/// Command-line arguments for the node. Every flag can also come from the
/// environment.
#[derive(Debug, Clone, Default, Args)]
pub struct NodeArgs {
    /// Tenant (business) identifier.
    #[arg(long, env = "SMALL_SYNC_TENANT_ID")]
    pub tenant_id: Option<String>,

    /// Stable device id; generated and persisted when omitted.
    #[arg(long, env = "SMALL_SYNC_DEVICE_ID")]
    pub device_id: Option<String>,

    /// pos | kds | bds | manager
    #[arg(long, env = "SMALL_SYNC_ROLE")]
    pub role: Option<String>,

    /// Directory holding the database and logs.
    #[arg(long, env = "SMALL_SYNC_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Remote coordinator base URL (ws:// or wss://).
    #[arg(long, env = "SMALL_SYNC_COORDINATOR_URL")]
    pub coordinator_url: Option<String>,

    /// API key or connection string.
    #[arg(long, env = "SMALL_SYNC_API_KEY")]
    pub api_key: Option<String>,

    /// Admin API base URL used by reconciliation.
    #[arg(long, env = "SMALL_SYNC_ADMIN_URL")]
    pub admin_url: Option<String>,

    #[arg(long, env = "SMALL_SYNC_MESH_PORT")]
    pub mesh_port: Option<u16>,

    /// Static `host:port` of the mesh server; skips discovery.
    #[arg(long, env = "SMALL_SYNC_MESH_SERVER")]
    pub mesh_server: Option<String>,

    /// Disable mDNS advertising and browsing.
    #[arg(long, env = "SMALL_SYNC_NO_MDNS")]
    pub no_mdns: bool,

    /// Run without the local mesh channel.
    #[arg(long, env = "SMALL_SYNC_NO_MESH")]
    pub no_mesh: bool,

    /// Keep all state in memory.
    #[arg(long, env = "SMALL_SYNC_EPHEMERAL")]
    pub ephemeral: bool,

    #[arg(long, env = "SMALL_SYNC_RECONCILE_INTERVAL_SECS")]
    pub reconcile_interval_secs: Option<u64>,

    #[arg(long, env = "SMALL_SYNC_RECONCILE_DELAY_SECS")]
    pub reconcile_startup_delay_secs: Option<u64>,

    #[arg(long, env = "SMALL_SYNC_BATCH_SIZE")]
    pub batch_size: Option<usize>,

    /// Print a kitchen ticket when an order is accepted.
    #[arg(long, env = "SMALL_SYNC_AUTO_PRINT")]
    pub auto_print: Option<bool>,
}

impl NodeArgs {
    pub fn environment(&self) -> Environment {
        Environment {
            has_local_persistence: !self.ephemeral,
            has_native_bridge: !self.no_mesh,
        }
    }

    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| PathBuf::from("data"))
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub tenant_id: String,
    pub device_id: String,
    pub role: DeviceRole,
    pub data_dir: PathBuf,
    pub coordinator_url: Option<String>,
    pub api_key: Option<String>,
    pub admin_url: Option<String>,
    pub mesh_port: u16,
    pub mesh_server: Option<String>,
    pub mdns_enabled: bool,
    pub reconcile_interval: Duration,
    pub reconcile_startup_delay: Duration,
    pub batch_size: usize,
    pub auto_print_on_accept: bool,
    pub environment: Environment,
}

impl NodeConfig {
    /// Resolve the layered configuration. `keyring` looks up a credential by
    /// key (normally [`storage::get_credential`]).
    pub fn resolve<K>(args: &NodeArgs, conn: &Connection, keyring: K) -> Result<Self, ConfigError>
    where
        K: Fn(&str) -> Option<String>,
    {
        let setting = |key: &str| db::get_setting(conn, SETTINGS_CATEGORY, key);
        let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        // API key may be a connection string carrying tenant and admin URL.
        let raw_key = non_empty(args.api_key.clone()).or_else(|| non_empty(keyring(storage::KEY_API_KEY)));
        let (api_key, decoded_tenant, decoded_admin) = match raw_key {
            Some(raw) => match api::extract_api_key_from_connection_string(&raw) {
                Some(key) => (
                    Some(key),
                    api::extract_tenant_id_from_connection_string(&raw),
                    api::extract_admin_url_from_connection_string(&raw),
                ),
                None => (Some(raw), None, None),
            },
            None => (None, None, None),
        };

        let tenant_id = non_empty(args.tenant_id.clone())
            .or(decoded_tenant)
            .or_else(|| non_empty(keyring(storage::KEY_TENANT_ID)))
            .or_else(|| non_empty(setting("tenant_id")))
            .ok_or(ConfigError::Missing("tenant_id"))?;

        let device_id = match non_empty(args.device_id.clone()).or_else(|| non_empty(setting("device_id"))) {
            Some(id) => id,
            None => {
                let id = format!("dev-{}", uuid::Uuid::new_v4());
                db::set_setting(conn, SETTINGS_CATEGORY, "device_id", &id)?;
                info!(device_id = %id, "Generated device id");
                id
            }
        };

        let role = match non_empty(args.role.clone()).or_else(|| non_empty(setting("device_role"))) {
            Some(raw) => raw.parse::<DeviceRole>().map_err(|_| ConfigError::Invalid {
                field: "role",
                value: raw,
            })?,
            None => DeviceRole::Pos,
        };

        let mesh_port = match args.mesh_port {
            Some(port) => port,
            None => parse_setting(setting("mesh_port"), "mesh_port")?.unwrap_or(DEFAULT_MESH_PORT),
        };

        let reconcile_interval_secs = match args.reconcile_interval_secs {
            Some(v) => v,
            None => parse_setting(setting("reconcile_interval_secs"), "reconcile_interval_secs")?
                .unwrap_or(DEFAULT_RECONCILE_INTERVAL_SECS),
        };
        let reconcile_startup_delay_secs = args
            .reconcile_startup_delay_secs
            .unwrap_or(DEFAULT_RECONCILE_STARTUP_DELAY_SECS);

        let batch_size = match args.batch_size {
            Some(v) => v,
            None => parse_setting(setting("batch_size"), "batch_size")?.unwrap_or(DEFAULT_BATCH_SIZE),
        };
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "batch_size",
                value: "0".into(),
            });
        }

        let auto_print_on_accept = match args.auto_print {
            Some(v) => v,
            None => setting("auto_print_on_accept").is_some_and(|v| is_truthy(&v)),
        };

        let admin_url = non_empty(args.admin_url.clone())
            .or(decoded_admin)
            .or_else(|| non_empty(keyring(storage::KEY_ADMIN_URL)))
            .map(|u| api::normalize_admin_url(&u));

        let coordinator_url = non_empty(args.coordinator_url.clone())
            .or_else(|| non_empty(keyring(storage::KEY_COORDINATOR_URL)))
            .map(|u| u.trim_end_matches('/').to_string());

        let mesh_server = non_empty(args.mesh_server.clone()).or_else(|| non_empty(setting("mesh_server")));

        Ok(Self {
            tenant_id,
            device_id,
            role,
            data_dir: args.resolved_data_dir(),
            coordinator_url,
            api_key,
            admin_url,
            mesh_port,
            mesh_server,
            mdns_enabled: !args.no_mdns,
            reconcile_interval: Duration::from_secs(reconcile_interval_secs.max(1)),
            reconcile_startup_delay: Duration::from_secs(reconcile_startup_delay_secs),
            batch_size,
            auto_print_on_accept,
            environment: args.environment(),
        })
    }
}

fn parse_setting<T: FromStr>(raw: Option<String>, field: &'static str) -> Result<Option<T>, ConfigError> {
    match raw {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { field, value }),
    }
}

fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}
