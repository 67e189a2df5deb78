//! mDNS advertisement and discovery of the site's mesh server.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info};

use crate::error::TransportError;

pub const SERVICE_TYPE: &str = "_smallsync._tcp.local.";
const INSTANCE_PREFIX: &str = "small-sync";

fn discovery_error(context: &str, e: impl std::fmt::Display) -> TransportError {
    TransportError::Discovery(format!("{context}: {e}"))
}

/// Host labels must be DNS-safe.
fn host_label(raw: &str) -> String {
    let label: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .take(63)
        .collect();
    if label.is_empty() {
        "small-sync".to_string()
    } else {
        label
    }
}

fn matches_tenant(advertised: Option<&str>, tenant_id: &str) -> bool {
    advertised == Some(tenant_id)
}

/// Keeps the mesh server registered until shut down.
pub struct MeshAdvertiser {
    daemon: ServiceDaemon,
    fullname: String,
}

impl MeshAdvertiser {
    pub fn register(tenant_id: &str, server_id: &str, port: u16) -> Result<Self, TransportError> {
        let daemon = ServiceDaemon::new().map_err(|e| discovery_error("create mDNS daemon", e))?;
        let ip = local_ip_address::local_ip().map_err(|e| discovery_error("resolve local IP", e))?;
        let ip_str = ip.to_string();

        let instance = format!("{INSTANCE_PREFIX}-{}", host_label(server_id));
        let host = format!("{}.local.", host_label(server_id));
        let mut properties = HashMap::new();
        properties.insert("tenant".to_string(), tenant_id.to_string());
        properties.insert("server_id".to_string(), server_id.to_string());

        let service = ServiceInfo::new(SERVICE_TYPE, &instance, &host, ip_str.as_str(), port, properties)
            .map_err(|e| discovery_error("build service info", e))?;
        let fullname = service.get_fullname().to_string();
        daemon
            .register(service)
            .map_err(|e| discovery_error("register service", e))?;

        info!(%fullname, ip = %ip_str, port, "Mesh server advertised over mDNS");
        Ok(Self { daemon, fullname })
    }

    pub fn shutdown(self) {
        let _ = self.daemon.unregister(&self.fullname);
        let _ = self.daemon.shutdown();
        debug!(fullname = %self.fullname, "mDNS advertisement withdrawn");
    }
}

/// Browse for a mesh server advertising `tenant_id`. `Ok(None)` when
/// nothing answered within `timeout`.
pub async fn discover(tenant_id: &str, timeout: Duration) -> Result<Option<SocketAddr>, TransportError> {
    let tenant = tenant_id.to_string();
    tokio::task::spawn_blocking(move || browse(&tenant, timeout))
        .await
        .map_err(|e| discovery_error("discovery task", e))?
}

fn browse(tenant_id: &str, timeout: Duration) -> Result<Option<SocketAddr>, TransportError> {
    let daemon = ServiceDaemon::new().map_err(|e| discovery_error("create mDNS daemon", e))?;
    let receiver = daemon
        .browse(SERVICE_TYPE)
        .map_err(|e| discovery_error("browse", e))?;

    let deadline = Instant::now() + timeout;
    let mut found = None;
    while found.is_none() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match receiver.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                if !matches_tenant(info.get_property_val_str("tenant"), tenant_id) {
                    debug!(fullname = %info.get_fullname(), "Skipping mesh server of another tenant");
                    continue;
                }
                if let Some(ip) = info.get_addresses().iter().next() {
                    let addr = SocketAddr::new(IpAddr::from(*ip), info.get_port());
                    info!(%addr, "Discovered mesh server");
                    found = Some(addr);
                }
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    let _ = daemon.stop_browse(SERVICE_TYPE);
    let _ = daemon.shutdown();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_label_is_dns_safe() {
        assert_eq!(host_label("dev-1234"), "dev-1234");
        assert_eq!(host_label("pos_1.front"), "pos-1-front");
        assert_eq!(host_label(""), "small-sync");
        assert_eq!(host_label(&"x".repeat(80)).len(), 63);
    }

    #[test]
    fn only_same_tenant_matches() {
        assert!(matches_tenant(Some("t1"), "t1"));
        assert!(!matches_tenant(Some("t2"), "t1"));
        assert!(!matches_tenant(None, "t1"));
    }
}
