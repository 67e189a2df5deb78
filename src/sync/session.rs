//! Client-side session loop shared by the cloud and mesh-client channels.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ChannelKind, FrameAction, SyncEvent, SyncMessage, SyncTransport};

pub(crate) type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
pub(crate) enum SessionEnd {
    Cancelled,
    Closed,
    Rejected(String),
}

/// Pump a registered connection until it closes, the peer rejects us, or
/// `cancel` fires. The channel slot is Connected for exactly the lifetime of
/// this call.
pub(crate) async fn run(
    transport: &SyncTransport,
    channel: ChannelKind,
    ws: ClientStream,
    peer: String,
    ping_interval: Duration,
    cancel: &CancellationToken,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    transport.attach_session(channel, tx, peer);

    // Pull peers' current state on every (re)connect.
    transport.send_on(
        channel,
        SyncEvent::SyncRequested {
            device_id: transport.device_id().to_string(),
        },
    );

    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break SessionEnd::Cancelled;
            }
            outbound = rx.recv() => match outbound {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(%channel, error = %e, "Send failed");
                        break SessionEnd::Closed;
                    }
                }
                None => break SessionEnd::Closed,
            },
            _ = ping.tick() => {
                if let Ok(text) = SyncMessage::Ping.to_text() {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break SessionEnd::Closed;
                    }
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match transport.handle_frame(channel, &text) {
                    FrameAction::None => {}
                    FrameAction::Reply(reply) => {
                        if sink.send(Message::Text(reply)).await.is_err() {
                            break SessionEnd::Closed;
                        }
                    }
                    FrameAction::Reject(reason) => break SessionEnd::Rejected(reason),
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => break SessionEnd::Closed,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%channel, error = %e, "Read failed");
                    break SessionEnd::Closed;
                }
            }
        }
    };

    transport.detach_session(channel);
    end
}
