//! Cloud channel: persistent WebSocket to the remote coordinator.
//!
//! Connects to `{coordinator}/ws/{tenant_id}` with the terminal API key,
//! registers, and reconnects after a fixed delay whenever the link drops.

use std::sync::Arc;

use futures_util::SinkExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::session::{self, ClientStream, SessionEnd};
use super::{ChannelKind, ConnectionState, SyncMessage, SyncTransport, TransportConfig};
use crate::error::TransportError;

/// Build the coordinator socket URL, mapping http(s) schemes to ws(s).
pub fn cloud_url(base: &str, tenant_id: &str) -> String {
    let base = base.trim().trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        format!("wss://{base}")
    };
    format!("{base}/ws/{tenant_id}")
}

pub(crate) async fn run(transport: SyncTransport, config: Arc<TransportConfig>, cancel: CancellationToken) {
    let Some(base) = config.coordinator_url.as_deref() else {
        return;
    };
    let url = cloud_url(base, &config.tenant_id);
    info!(%url, "Cloud channel starting");

    loop {
        if cancel.is_cancelled() {
            break;
        }
        transport.set_state(ChannelKind::Cloud, ConnectionState::Connecting, None);

        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            attempt = connect(&url, &config) => attempt,
        };
        match attempt {
            Ok(ws) => {
                info!(%url, "Cloud channel connected");
                let end = session::run(
                    &transport,
                    ChannelKind::Cloud,
                    ws,
                    url.clone(),
                    config.ping_interval,
                    &cancel,
                )
                .await;
                match end {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Rejected(reason) => warn!(%reason, "Coordinator rejected this device"),
                    SessionEnd::Closed => info!("Cloud channel closed"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Cloud connect failed");
                transport.set_state(ChannelKind::Cloud, ConnectionState::Disconnected, None);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.cloud_retry) => {}
        }
    }

    transport.set_state(ChannelKind::Cloud, ConnectionState::Disconnected, None);
}

async fn connect(url: &str, config: &TransportConfig) -> Result<ClientStream, TransportError> {
    let mut request = url.into_client_request().map_err(|source| TransportError::Connect {
        url: url.to_string(),
        source,
    })?;
    if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
        let value = HeaderValue::from_str(key)
            .map_err(|e| TransportError::Handshake(format!("invalid API key header: {e}")))?;
        request.headers_mut().insert("X-POS-API-Key", value);
    }

    let (mut ws, _) = tokio::time::timeout(config.handshake_timeout, connect_async(request))
        .await
        .map_err(|_| TransportError::Timeout("cloud connect"))?
        .map_err(|source| TransportError::Connect {
            url: url.to_string(),
            source,
        })?;

    let register = SyncMessage::Register {
        device_type: config.role,
        tenant_id: config.tenant_id.clone(),
        device_id: config.device_id.clone(),
    }
    .to_text()?;
    ws.send(Message::Text(register)).await?;
    Ok(ws)
}
