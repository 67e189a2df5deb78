//! Local-mesh server hosted by the POS terminal.
//!
//! Clients must send `register` with a matching tenant id before anything
//! else. Events a client sends are delivered locally and relayed to every
//! other registered client.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::message::{REGISTRATION_REQUIRED, TENANT_MISMATCH};
use super::{ChannelKind, Relay, ServerInfo, SyncMessage, SyncTransport, TransportConfig};
use crate::error::TransportError;

type ServerSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type ServerStream = SplitStream<WebSocketStream<TcpStream>>;

pub(crate) async fn bind(config: &TransportConfig) -> Result<TcpListener, TransportError> {
    let addr = format!("{}:{}", config.mesh_bind, config.mesh_port);
    TcpListener::bind(&addr)
        .await
        .map_err(|source| TransportError::Bind { addr, source })
}

pub(crate) async fn serve(
    transport: SyncTransport,
    listener: TcpListener,
    config: Arc<TransportConfig>,
    fanout: broadcast::Sender<Relay>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Mesh connection accepted");
                    let transport = transport.clone();
                    let config = config.clone();
                    let fanout = fanout.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(transport, stream, peer, config, fanout, cancel).await {
                            debug!(%peer, error = %e, "Mesh connection ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Mesh accept failed"),
            }
        }
    }
    info!("Local mesh server stopped");
}

async fn handle_connection(
    transport: SyncTransport,
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<TransportConfig>,
    fanout: broadcast::Sender<Relay>,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    let ws = tokio::time::timeout(config.handshake_timeout, accept_async(stream))
        .await
        .map_err(|_| TransportError::Timeout("websocket upgrade"))??;
    let (mut sink, mut source) = ws.split();

    let first = tokio::time::timeout(config.handshake_timeout, next_text(&mut source))
        .await
        .map_err(|_| TransportError::Timeout("client registration"))??;

    let (device_type, device_id) = match SyncMessage::parse(&first) {
        Ok(SyncMessage::Register {
            device_type,
            tenant_id,
            device_id,
        }) => {
            if tenant_id != config.tenant_id {
                warn!(%peer, %device_id, client_tenant = %tenant_id, "Rejecting mesh client: tenant mismatch");
                reject(&mut sink, "Tenant ID mismatch", TENANT_MISMATCH).await;
                return Ok(());
            }
            (device_type, device_id)
        }
        _ => {
            warn!(%peer, "First frame was not a registration");
            reject(&mut sink, "Registration required", REGISTRATION_REQUIRED).await;
            return Ok(());
        }
    };

    let client_id = Uuid::new_v4().to_string();
    // Subscribe before acknowledging so nothing broadcast in between is lost.
    let relay_rx = fanout.subscribe();
    let connected = transport.mesh_client_joined();
    info!(%peer, %device_id, device_type = %device_type, clients = connected, "Mesh client registered");

    let result = run_client(
        &transport,
        &config,
        &client_id,
        connected,
        &mut sink,
        &mut source,
        relay_rx,
        &fanout,
        &cancel,
    )
    .await;

    transport.mesh_client_left();
    info!(%peer, %device_id, "Mesh client disconnected");
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_client(
    transport: &SyncTransport,
    config: &TransportConfig,
    client_id: &str,
    connected: usize,
    sink: &mut ServerSink,
    source: &mut ServerStream,
    mut relay_rx: broadcast::Receiver<Relay>,
    fanout: &broadcast::Sender<Relay>,
    cancel: &CancellationToken,
) -> Result<(), TransportError> {
    let ack = SyncMessage::Registered {
        client_id: client_id.to_string(),
        server_info: ServerInfo {
            server_id: config.device_id.clone(),
            tenant_id: config.tenant_id.clone(),
            connected_clients: connected,
            server_time: Utc::now(),
        },
    }
    .to_text()?;
    sink.send(Message::Text(ack)).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            relay = relay_rx.recv() => match relay {
                Ok(relay) => {
                    if relay.exclude.as_deref() == Some(client_id) {
                        continue;
                    }
                    sink.send(Message::Text(relay.text)).await?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%client_id, skipped, "Mesh client lagging, frames dropped");
                }
                Err(RecvError::Closed) => break,
            },
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => match SyncMessage::parse(&text) {
                    Ok(SyncMessage::Event { origin, event }) => {
                        let _ = fanout.send(Relay {
                            exclude: Some(client_id.to_string()),
                            text: text.clone(),
                        });
                        transport.receive(ChannelKind::LocalMesh, &origin, event);
                    }
                    Ok(SyncMessage::Ping) => {
                        sink.send(Message::Text(SyncMessage::Pong.to_text()?)).await?;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(%client_id, error = %e, "Ignoring malformed frame"),
                },
                Some(Ok(Message::Ping(payload))) => {
                    sink.send(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

async fn reject(sink: &mut ServerSink, message: &str, code: &str) {
    let frame = SyncMessage::Error {
        message: message.to_string(),
        code: code.to_string(),
    };
    if let Ok(text) = frame.to_text() {
        let _ = sink.send(Message::Text(text)).await;
    }
    let _ = sink.close().await;
}

async fn next_text(source: &mut ServerStream) -> Result<String, TransportError> {
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Close(_))) | None => {
                return Err(TransportError::Handshake(
                    "connection closed before registration".into(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}
