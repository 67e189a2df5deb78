//! Dual-path replication: a cloud channel to the remote coordinator and a
//! local-mesh channel between devices on the site network.
//!
//! Each channel runs its own connect / retry loop and owns its own slot
//! (role, connection state, peer, outbound queue). The orchestrator sees a
//! single [`SyncTransport::broadcast`] and a single receive subscription no
//! matter which channels are up. Broadcasting while nothing is connected
//! drops the event; the originating mutation is already persisted locally.

pub mod cloud;
pub mod discovery;
pub mod lan_client;
pub mod lan_server;
pub mod message;
mod session;

pub use message::{ServerInfo, SyncEvent, SyncMessage};

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DeviceRole, Environment, NodeConfig};
use crate::error::TransportError;
use crate::sinks::SyncSink;

/// Fixed delay between cloud connection attempts.
pub const CLOUD_RETRY: Duration = Duration::from_secs(5);
/// Fixed delay between local-mesh client connection attempts.
pub const MESH_RETRY: Duration = Duration::from_secs(10);
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Relay buffer of the mesh server.
const FANOUT_CAPACITY: usize = 1000;

// ---------------------------------------------------------------------------
// Channel state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Cloud,
    LocalMesh,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelKind::Cloud => "cloud",
            ChannelKind::LocalMesh => "local_mesh",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    Server,
    Client,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    pub channel: ChannelKind,
    pub role: ChannelRole,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportStatus {
    pub cloud: ChannelStatus,
    pub local_mesh: ChannelStatus,
}

/// A frame queued for every mesh client except `exclude`.
#[derive(Debug, Clone)]
pub(crate) struct Relay {
    pub exclude: Option<String>,
    pub text: String,
}

enum Outbound {
    None,
    Session(mpsc::UnboundedSender<String>),
    Fanout(broadcast::Sender<Relay>),
}

struct ChannelSlot {
    role: ChannelRole,
    state: ConnectionState,
    peer: Option<String>,
    outbound: Outbound,
    /// Registered mesh clients (server role only).
    clients: usize,
}

impl ChannelSlot {
    fn new() -> Self {
        Self {
            role: ChannelRole::Inactive,
            state: ConnectionState::Disconnected,
            peer: None,
            outbound: Outbound::None,
            clients: 0,
        }
    }

    fn status(&self, channel: ChannelKind) -> ChannelStatus {
        ChannelStatus {
            channel,
            role: self.role,
            state: self.state,
            peer_address: self.peer.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tenant_id: String,
    pub device_id: String,
    pub role: DeviceRole,
    pub coordinator_url: Option<String>,
    pub api_key: Option<String>,
    /// Interface the mesh server listens on.
    pub mesh_bind: String,
    /// `0` picks an ephemeral port; see [`SyncTransport::mesh_local_addr`].
    pub mesh_port: u16,
    pub mesh_server: Option<String>,
    pub mdns_enabled: bool,
    pub cloud_retry: Duration,
    pub mesh_retry: Duration,
    pub ping_interval: Duration,
    pub handshake_timeout: Duration,
}

impl TransportConfig {
    pub fn from_node(config: &NodeConfig) -> Self {
        Self {
            tenant_id: config.tenant_id.clone(),
            device_id: config.device_id.clone(),
            role: config.role,
            coordinator_url: config.coordinator_url.clone(),
            api_key: config.api_key.clone(),
            mesh_bind: "0.0.0.0".to_string(),
            mesh_port: config.mesh_port,
            mesh_server: config.mesh_server.clone(),
            mdns_enabled: config.mdns_enabled,
            cloud_retry: CLOUD_RETRY,
            mesh_retry: MESH_RETRY,
            ping_interval: PING_INTERVAL,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

type ReceiveHandler = Arc<dyn Fn(ChannelKind, SyncEvent) + Send + Sync>;
type ConnectionHandler = Arc<dyn Fn(&ChannelStatus) + Send + Sync>;

struct Shared {
    device_id: String,
    cloud: Mutex<ChannelSlot>,
    mesh: Mutex<ChannelSlot>,
    receive_handlers: RwLock<Vec<ReceiveHandler>>,
    connection_handlers: RwLock<Vec<ConnectionHandler>>,
    mesh_local_addr: Mutex<Option<SocketAddr>>,
    cancel: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    advertiser: Mutex<Option<discovery::MeshAdvertiser>>,
}

/// Cheap to clone; all clones share the same channels.
#[derive(Clone)]
pub struct SyncTransport {
    shared: Arc<Shared>,
}

/// What a session loop should do with an inbound frame.
pub(crate) enum FrameAction {
    None,
    Reply(String),
    Reject(String),
}

impl SyncTransport {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                device_id: device_id.into(),
                cloud: Mutex::new(ChannelSlot::new()),
                mesh: Mutex::new(ChannelSlot::new()),
                receive_handlers: RwLock::new(Vec::new()),
                connection_handlers: RwLock::new(Vec::new()),
                mesh_local_addr: Mutex::new(None),
                cancel: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                advertiser: Mutex::new(None),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    /// Subscribe to events received from other devices.
    pub fn on_receive<F>(&self, handler: F)
    where
        F: Fn(ChannelKind, SyncEvent) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.shared.receive_handlers.write() {
            handlers.push(Arc::new(handler));
        }
    }

    /// Subscribe to channel role / state / peer changes.
    pub fn on_connection_change<F>(&self, handler: F)
    where
        F: Fn(&ChannelStatus) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.shared.connection_handlers.write() {
            handlers.push(Arc::new(handler));
        }
    }

    pub fn status(&self) -> TransportStatus {
        TransportStatus {
            cloud: self.channel_status(ChannelKind::Cloud),
            local_mesh: self.channel_status(ChannelKind::LocalMesh),
        }
    }

    pub fn channel_status(&self, kind: ChannelKind) -> ChannelStatus {
        self.with_slot(kind, |slot| slot.status(kind))
            .unwrap_or(ChannelStatus {
                channel: kind,
                role: ChannelRole::Inactive,
                state: ConnectionState::Disconnected,
                peer_address: None,
            })
    }

    /// Address the mesh server is listening on, once started.
    pub fn mesh_local_addr(&self) -> Option<SocketAddr> {
        self.shared.mesh_local_addr.lock().ok().and_then(|a| *a)
    }

    /// Send over every connected channel. Returns how many channels took it.
    pub fn broadcast(&self, event: SyncEvent) -> usize {
        let kind = event.kind();
        let text = match self.envelope(event) {
            Some(text) => text,
            None => return 0,
        };
        let sent = [ChannelKind::Cloud, ChannelKind::LocalMesh]
            .into_iter()
            .filter(|channel| self.send_text(*channel, &text))
            .count();
        if sent == 0 {
            debug!(event = kind, "No channel connected, event not replicated");
        } else {
            debug!(event = kind, channels = sent, "Event broadcast");
        }
        sent
    }

    /// Send on a single channel (used for per-connection resync requests).
    pub(crate) fn send_on(&self, channel: ChannelKind, event: SyncEvent) -> bool {
        match self.envelope(event) {
            Some(text) => self.send_text(channel, &text),
            None => false,
        }
    }

    fn envelope(&self, event: SyncEvent) -> Option<String> {
        let message = SyncMessage::Event {
            origin: self.shared.device_id.clone(),
            event,
        };
        match message.to_text() {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(error = %e, "Failed to serialize sync event");
                None
            }
        }
    }

    fn send_text(&self, channel: ChannelKind, text: &str) -> bool {
        self.with_slot(channel, |slot| {
            if slot.state != ConnectionState::Connected {
                return false;
            }
            match &slot.outbound {
                Outbound::Session(tx) => tx.send(text.to_string()).is_ok(),
                Outbound::Fanout(tx) => tx
                    .send(Relay {
                        exclude: None,
                        text: text.to_string(),
                    })
                    .is_ok(),
                Outbound::None => false,
            }
        })
        .unwrap_or(false)
    }

    /// Hand an inbound event to subscribers. Echoes of our own broadcasts
    /// are dropped.
    pub(crate) fn receive(&self, channel: ChannelKind, origin: &str, event: SyncEvent) -> bool {
        if origin == self.shared.device_id {
            debug!(%channel, event = event.kind(), "Dropping own echo");
            return false;
        }
        let handlers: Vec<ReceiveHandler> = match self.shared.receive_handlers.read() {
            Ok(h) => h.clone(),
            Err(_) => return false,
        };
        debug!(%channel, %origin, event = event.kind(), "Event received");
        for handler in &handlers {
            handler(channel, event.clone());
        }
        true
    }

    /// Common inbound handling for client-side sessions.
    pub(crate) fn handle_frame(&self, channel: ChannelKind, text: &str) -> FrameAction {
        match SyncMessage::parse(text) {
            Ok(SyncMessage::Event { origin, event }) => {
                self.receive(channel, &origin, event);
                FrameAction::None
            }
            Ok(SyncMessage::Ping) => match SyncMessage::Pong.to_text() {
                Ok(pong) => FrameAction::Reply(pong),
                Err(_) => FrameAction::None,
            },
            Ok(SyncMessage::Error { message, code }) => {
                warn!(%channel, %code, %message, "Peer reported error");
                if code == message::TENANT_MISMATCH {
                    FrameAction::Reject(message)
                } else {
                    FrameAction::None
                }
            }
            Ok(_) => FrameAction::None,
            Err(e) => {
                warn!(%channel, error = %e, "Ignoring malformed frame");
                FrameAction::None
            }
        }
    }

    // -- slot management -----------------------------------------------------

    fn slot(&self, kind: ChannelKind) -> &Mutex<ChannelSlot> {
        match kind {
            ChannelKind::Cloud => &self.shared.cloud,
            ChannelKind::LocalMesh => &self.shared.mesh,
        }
    }

    fn with_slot<R>(&self, kind: ChannelKind, f: impl FnOnce(&mut ChannelSlot) -> R) -> Option<R> {
        self.slot(kind).lock().ok().map(|mut slot| f(&mut slot))
    }

    /// Apply a slot mutation and notify handlers if the visible status moved.
    fn update(&self, kind: ChannelKind, f: impl FnOnce(&mut ChannelSlot)) {
        let change = self.with_slot(kind, |slot| {
            let before = slot.status(kind);
            f(slot);
            let after = slot.status(kind);
            (before != after).then_some(after)
        });
        if let Some(Some(status)) = change {
            info!(
                channel = %kind,
                role = ?status.role,
                state = ?status.state,
                peer = status.peer_address.as_deref().unwrap_or("-"),
                "Channel status changed"
            );
            let handlers: Vec<ConnectionHandler> = self
                .shared
                .connection_handlers
                .read()
                .map(|h| h.clone())
                .unwrap_or_default();
            for handler in &handlers {
                handler(&status);
            }
        }
    }

    pub(crate) fn set_role(&self, kind: ChannelKind, role: ChannelRole) {
        self.update(kind, |slot| slot.role = role);
    }

    pub(crate) fn set_state(&self, kind: ChannelKind, state: ConnectionState, peer: Option<String>) {
        self.update(kind, |slot| {
            slot.state = state;
            slot.peer = peer;
        });
    }

    pub(crate) fn attach_session(&self, kind: ChannelKind, tx: mpsc::UnboundedSender<String>, peer: String) {
        self.update(kind, |slot| {
            slot.outbound = Outbound::Session(tx);
            slot.state = ConnectionState::Connected;
            slot.peer = Some(peer);
        });
    }

    pub(crate) fn detach_session(&self, kind: ChannelKind) {
        self.update(kind, |slot| {
            slot.outbound = Outbound::None;
            slot.state = ConnectionState::Disconnected;
            slot.peer = None;
        });
    }

    fn attach_fanout(&self, tx: broadcast::Sender<Relay>, listen: SocketAddr) {
        self.update(ChannelKind::LocalMesh, |slot| {
            slot.role = ChannelRole::Server;
            slot.outbound = Outbound::Fanout(tx);
            slot.state = ConnectionState::Connecting;
            slot.peer = Some(listen.to_string());
            slot.clients = 0;
        });
    }

    /// A mesh client finished registration. Returns the new client count.
    pub(crate) fn mesh_client_joined(&self) -> usize {
        let mut count = 0;
        self.update(ChannelKind::LocalMesh, |slot| {
            slot.clients += 1;
            slot.state = ConnectionState::Connected;
            count = slot.clients;
        });
        count
    }

    pub(crate) fn mesh_client_left(&self) {
        self.update(ChannelKind::LocalMesh, |slot| {
            slot.clients = slot.clients.saturating_sub(1);
            if slot.clients == 0 {
                slot.state = ConnectionState::Connecting;
            }
        });
    }

    // -- lifecycle -----------------------------------------------------------

    /// Start the channels this device participates in. Only binding the mesh
    /// listener can fail; connect loops retry on their own.
    pub async fn start(&self, config: TransportConfig, env: Environment) -> Result<(), TransportError> {
        let cancel = CancellationToken::new();
        if let Ok(mut slot) = self.shared.cancel.lock() {
            if let Some(previous) = slot.replace(cancel.clone()) {
                previous.cancel();
            }
        }
        let config = Arc::new(config);
        let mut spawned = Vec::new();

        // Cloud channel
        if config.coordinator_url.is_some() {
            self.set_role(ChannelKind::Cloud, ChannelRole::Client);
            spawned.push(tokio::spawn(cloud::run(
                self.clone(),
                config.clone(),
                cancel.child_token(),
            )));
        } else {
            info!("No coordinator configured, cloud channel inactive");
            self.set_role(ChannelKind::Cloud, ChannelRole::Inactive);
        }

        // Local mesh
        if !env.has_native_bridge {
            info!("No native bridge, local mesh inactive");
            self.set_role(ChannelKind::LocalMesh, ChannelRole::Inactive);
        } else if config.role.is_order_terminal() {
            let listener = lan_server::bind(&config).await?;
            let local = listener
                .local_addr()
                .map_err(|source| TransportError::Bind {
                    addr: format!("{}:{}", config.mesh_bind, config.mesh_port),
                    source,
                })?;
            if let Ok(mut addr) = self.shared.mesh_local_addr.lock() {
                *addr = Some(local);
            }
            let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
            self.attach_fanout(fanout.clone(), local);
            info!(addr = %local, "Local mesh server listening");

            if config.mdns_enabled {
                match discovery::MeshAdvertiser::register(&config.tenant_id, &config.device_id, local.port()) {
                    Ok(advertiser) => {
                        if let Ok(mut slot) = self.shared.advertiser.lock() {
                            *slot = Some(advertiser);
                        }
                    }
                    Err(e) => warn!(error = %e, "mDNS advertise failed, clients need a static address"),
                }
            }

            spawned.push(tokio::spawn(lan_server::serve(
                self.clone(),
                listener,
                config.clone(),
                fanout,
                cancel.child_token(),
            )));
        } else {
            self.set_role(ChannelKind::LocalMesh, ChannelRole::Client);
            spawned.push(tokio::spawn(lan_client::run(
                self.clone(),
                config.clone(),
                cancel.child_token(),
            )));
        }

        if let Ok(mut tasks) = self.shared.tasks.lock() {
            tasks.extend(spawned);
        }
        Ok(())
    }

    /// Close every channel and stop all retry timers.
    pub async fn shutdown(&self) {
        if let Some(cancel) = self.shared.cancel.lock().ok().and_then(|mut c| c.take()) {
            cancel.cancel();
        }
        let tasks: Vec<JoinHandle<()>> = self
            .shared
            .tasks
            .lock()
            .map(|mut t| t.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Channel task did not stop in time");
            }
        }
        if let Some(advertiser) = self.shared.advertiser.lock().ok().and_then(|mut a| a.take()) {
            advertiser.shutdown();
        }
        for kind in [ChannelKind::Cloud, ChannelKind::LocalMesh] {
            self.update(kind, |slot| {
                slot.outbound = Outbound::None;
                slot.state = ConnectionState::Disconnected;
                slot.peer = None;
                slot.clients = 0;
            });
        }
        info!("Sync transport stopped");
    }
}

impl SyncSink for SyncTransport {
    fn broadcast(&self, event: SyncEvent) -> usize {
        SyncTransport::broadcast(self, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn requested(device: &str) -> SyncEvent {
        SyncEvent::SyncRequested {
            device_id: device.into(),
        }
    }

    #[test]
    fn broadcast_without_channels_is_dropped() {
        let transport = SyncTransport::new("pos-1");
        assert_eq!(transport.broadcast(requested("pos-1")), 0);
    }

    #[test]
    fn broadcast_reaches_every_connected_channel() {
        let transport = SyncTransport::new("pos-1");
        let (cloud_tx, mut cloud_rx) = mpsc::unbounded_channel();
        let (mesh_tx, mut mesh_rx) = mpsc::unbounded_channel();
        transport.attach_session(ChannelKind::Cloud, cloud_tx, "cloud".into());
        transport.attach_session(ChannelKind::LocalMesh, mesh_tx, "10.0.0.2:3847".into());

        assert_eq!(transport.broadcast(requested("pos-1")), 2);
        let frame = cloud_rx.try_recv().unwrap();
        assert!(frame.contains(r#""origin":"pos-1""#));
        assert!(mesh_rx.try_recv().is_ok());

        transport.detach_session(ChannelKind::Cloud);
        assert_eq!(transport.broadcast(requested("pos-1")), 1);
    }

    #[test]
    fn own_echo_is_not_delivered() {
        let transport = SyncTransport::new("kds-1");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        transport.on_receive(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!transport.receive(ChannelKind::LocalMesh, "kds-1", requested("kds-1")));
        assert!(transport.receive(ChannelKind::LocalMesh, "pos-1", requested("pos-1")));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn connection_handlers_see_only_real_changes() {
        let transport = SyncTransport::new("kds-1");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        transport.on_connection_change(move |status| {
            log.lock().unwrap().push((status.channel, status.state));
        });

        transport.set_state(ChannelKind::Cloud, ConnectionState::Connecting, None);
        transport.set_state(ChannelKind::Cloud, ConnectionState::Connecting, None);
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.attach_session(ChannelKind::Cloud, tx, "coordinator".into());
        transport.detach_session(ChannelKind::Cloud);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (ChannelKind::Cloud, ConnectionState::Connecting),
                (ChannelKind::Cloud, ConnectionState::Connected),
                (ChannelKind::Cloud, ConnectionState::Disconnected),
            ]
        );
    }

    #[test]
    fn mesh_server_state_follows_client_count() {
        let transport = SyncTransport::new("pos-1");
        let (fanout, mut rx) = broadcast::channel(16);
        transport.attach_fanout(fanout, "127.0.0.1:3847".parse().unwrap());
        let status = transport.channel_status(ChannelKind::LocalMesh);
        assert_eq!(status.role, ChannelRole::Server);
        assert_eq!(status.state, ConnectionState::Connecting);
        assert_eq!(transport.broadcast(requested("pos-1")), 0);

        assert_eq!(transport.mesh_client_joined(), 1);
        assert_eq!(transport.mesh_client_joined(), 2);
        assert_eq!(transport.broadcast(requested("pos-1")), 1);
        let relay = rx.try_recv().unwrap();
        assert!(relay.exclude.is_none());

        transport.mesh_client_left();
        transport.mesh_client_left();
        assert_eq!(
            transport.channel_status(ChannelKind::LocalMesh).state,
            ConnectionState::Connecting
        );
    }

    #[test]
    fn tenant_mismatch_frame_rejects_session() {
        let transport = SyncTransport::new("kds-1");
        let frame = r#"{"type":"error","message":"Tenant ID mismatch","code":"TENANT_MISMATCH"}"#;
        assert!(matches!(
            transport.handle_frame(ChannelKind::LocalMesh, frame),
            FrameAction::Reject(_)
        ));
        assert!(matches!(
            transport.handle_frame(ChannelKind::LocalMesh, r#"{"type":"ping"}"#),
            FrameAction::Reply(_)
        ));
        assert!(matches!(
            transport.handle_frame(ChannelKind::LocalMesh, "garbage"),
            FrameAction::None
        ));
    }
}
