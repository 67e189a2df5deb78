//! Local-mesh client used by kitchen and bar displays.
//!
//! Finds the site's mesh server (static address, else mDNS), registers with
//! the tenant id, and keeps the session alive. Retries every `mesh_retry`.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::{self, ClientStream, SessionEnd};
use super::{
    discovery, ChannelKind, ConnectionState, ServerInfo, SyncMessage, SyncTransport, TransportConfig,
    DISCOVERY_TIMEOUT,
};
use crate::error::TransportError;

pub(crate) async fn run(transport: SyncTransport, config: Arc<TransportConfig>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        transport.set_state(ChannelKind::LocalMesh, ConnectionState::Connecting, None);

        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            attempt = connect_to_server(&config) => attempt,
        };
        match attempt {
            Ok(Some((addr, ws, server))) => {
                info!(
                    %addr,
                    server_id = %server.server_id,
                    clients = server.connected_clients,
                    "Joined local mesh"
                );
                let end = session::run(
                    &transport,
                    ChannelKind::LocalMesh,
                    ws,
                    addr,
                    config.ping_interval,
                    &cancel,
                )
                .await;
                match end {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Rejected(reason) => warn!(%reason, "Mesh server rejected this device"),
                    SessionEnd::Closed => info!("Local mesh session closed"),
                }
            }
            Ok(None) => {
                debug!("No mesh server found");
                transport.set_state(ChannelKind::LocalMesh, ConnectionState::Disconnected, None);
            }
            Err(e) => {
                warn!(error = %e, "Mesh connect failed");
                transport.set_state(ChannelKind::LocalMesh, ConnectionState::Disconnected, None);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.mesh_retry) => {}
        }
    }

    transport.set_state(ChannelKind::LocalMesh, ConnectionState::Disconnected, None);
}

async fn connect_to_server(
    config: &TransportConfig,
) -> Result<Option<(String, ClientStream, ServerInfo)>, TransportError> {
    let Some(addr) = resolve_server(config).await? else {
        return Ok(None);
    };
    let (ws, server) = connect_and_register(&addr, config).await?;
    Ok(Some((addr, ws, server)))
}

async fn resolve_server(config: &TransportConfig) -> Result<Option<String>, TransportError> {
    if let Some(addr) = config.mesh_server.as_deref().filter(|a| !a.is_empty()) {
        return Ok(Some(addr.to_string()));
    }
    if !config.mdns_enabled {
        return Ok(None);
    }
    let found = discovery::discover(&config.tenant_id, DISCOVERY_TIMEOUT).await?;
    Ok(found.map(|addr| addr.to_string()))
}

/// Open the socket and complete the register / registered handshake.
async fn connect_and_register(
    addr: &str,
    config: &TransportConfig,
) -> Result<(ClientStream, ServerInfo), TransportError> {
    let url = if addr.starts_with("ws://") || addr.starts_with("wss://") {
        addr.to_string()
    } else {
        format!("ws://{addr}")
    };
    let (mut ws, _) = tokio::time::timeout(config.handshake_timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| TransportError::Timeout("mesh connect"))?
        .map_err(|source| TransportError::Connect {
            url: url.clone(),
            source,
        })?;

    let register = SyncMessage::Register {
        device_type: config.role,
        tenant_id: config.tenant_id.clone(),
        device_id: config.device_id.clone(),
    }
    .to_text()?;
    ws.send(Message::Text(register)).await?;

    let reply = tokio::time::timeout(config.handshake_timeout, next_text(&mut ws))
        .await
        .map_err(|_| TransportError::Timeout("mesh registration"))??;

    match SyncMessage::parse(&reply)? {
        SyncMessage::Registered { client_id, server_info } => {
            debug!(%client_id, "Registered with mesh server");
            Ok((ws, server_info))
        }
        SyncMessage::Error { message, code } => Err(TransportError::Rejected { message, code }),
        other => Err(TransportError::Handshake(format!(
            "unexpected reply to register: {other:?}"
        ))),
    }
}

async fn next_text(ws: &mut ClientStream) -> Result<String, TransportError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Close(_))) | None => {
                return Err(TransportError::Handshake(
                    "connection closed during registration".into(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}
