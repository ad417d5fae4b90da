//! Outbound WebSocket transport: retrying connector, frame classification,
//! and send helpers shared by the tunnel client and the light-wallet client.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::stream::SplitSink;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{
    connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::error::TunnelError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Ping interval keeping idle sessions alive through intermediaries.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

const CONNECT_ATTEMPTS: u32 = 10;

/// A classified application frame: mux data or a control message.
#[derive(Debug, Clone)]
pub enum WsFrame {
    Binary(Vec<u8>),
    Text(String),
}

/// Connect to `url` with up to ten attempts. The per-attempt timeout starts
/// at 4s and grows by 2s each round; non-timeout failures also sleep that
/// long before the next try. Credentials go out as HTTP Basic on the
/// upgrade request.
pub async fn connect(
    url: &str,
    username: Option<&str>,
    password: Option<&str>,
    verify_ssl: bool,
    headers: &[(&'static str, &str)],
) -> Result<WsStream, TunnelError> {
    let mut retry_timeout = Duration::from_secs(2);

    for attempt in 1..=CONNECT_ATTEMPTS {
        retry_timeout += Duration::from_secs(2);

        let mut request = url
            .into_client_request()
            .map_err(|e| TunnelError::Transport(format!("invalid websocket url {url}: {e}")))?;

        if let (Some(username), Some(password)) = (username, password) {
            let credentials = BASE64.encode(format!("{username}:{password}"));
            let value = HeaderValue::from_str(&format!("Basic {credentials}"))
                .map_err(|e| TunnelError::Transport(format!("invalid credentials: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }
        for (name, value) in headers {
            let value = HeaderValue::from_str(value)
                .map_err(|e| TunnelError::Transport(format!("invalid header {name}: {e}")))?;
            request.headers_mut().insert(*name, value);
        }

        let connector = if verify_ssl {
            None
        } else {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| TunnelError::Transport(format!("tls connector: {e}")))?;
            Some(Connector::NativeTls(tls))
        };

        match tokio::time::timeout(
            retry_timeout,
            connect_async_tls_with_config(request, None, false, connector),
        )
        .await
        {
            Ok(Ok((ws, _response))) => {
                info!(url, "websocket connected");
                return Ok(ws);
            }
            Ok(Err(e)) => {
                warn!(url, attempt, error = %e, "websocket connect failed, retrying");
                tokio::time::sleep(retry_timeout).await;
            }
            Err(_) => {
                warn!(
                    url,
                    attempt,
                    timeout_secs = retry_timeout.as_secs(),
                    "websocket connect timed out, retrying"
                );
            }
        }
    }

    Err(TunnelError::Transport(format!(
        "giving up on {url} after {CONNECT_ATTEMPTS} attempts"
    )))
}

/// Next BINARY or TEXT payload. Ping/pong frames are skipped; a close frame,
/// stream end, or protocol error yields `None` and ends the session.
pub async fn recv_frame<S>(stream: &mut S) -> Option<WsFrame>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match stream.next().await? {
            Ok(Message::Binary(data)) => return Some(WsFrame::Binary(data.to_vec())),
            Ok(Message::Text(text)) => return Some(WsFrame::Text(text.to_string())),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(frame)) => {
                debug!(?frame, "websocket closed by peer");
                return None;
            }
            Ok(other) => {
                debug!(?other, "unexpected websocket message type");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "websocket receive failed");
                return None;
            }
        }
    }
}

/// Submit one frame to the peer.
pub async fn send_frame<S>(sink: &mut S, frame: WsFrame) -> Result<(), TunnelError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let message = match frame {
        WsFrame::Binary(data) => Message::binary(data),
        WsFrame::Text(text) => Message::text(text),
    };
    sink.send(message)
        .await
        .map_err(|e| TunnelError::Transport(format!("websocket send: {e}")))
}

/// Heartbeat ping.
pub async fn send_ping<S>(sink: &mut S) -> Result<(), TunnelError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    sink.send(Message::Ping(Vec::new().into()))
        .await
        .map_err(|e| TunnelError::Transport(format!("websocket ping: {e}")))
}

/// Serialized writer for one session: drains the frame queue into the sink
/// and keeps the heartbeat going. Concurrent tasks submit through the
/// channel, so partial frames never interleave. Returns when the sink fails
/// or the queue closes.
pub async fn drain_frames(
    mut sink: SplitSink<WsStream, Message>,
    mut frames: UnboundedReceiver<WsFrame>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                if send_frame(&mut sink, frame).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if send_ping(&mut sink).await.is_err() {
                    break;
                }
            }
        }
    }
}
