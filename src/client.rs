//! Client proxy: a local SOCKS5 listener bridged onto a multiplexed
//! upstream WebSocket session.
//!
//! The SOCKS5 listener outlives every session. A reconnect supervisor
//! rebuilds the WebSocket whenever it dies; in-flight streams are not
//! replayed, their local sockets are closed when the per-stream routes are
//! dropped. Frames queued while disconnected are flushed into the next
//! session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{eyre, Result, WrapErr};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::account::Account;
use crate::config::Config;
use crate::control::{CtrlBody, CtrlMsg, SIGN_MESSAGE_SUFFIX};
use crate::error::TunnelError;
use crate::mux::{Multiplexing, Role};
use crate::socks5::{Progress, Socks5Parser};
use crate::ws::{self, WsFrame, WsStream};

const READ_CHUNK: usize = 8192;
const GREETING_BYTE_LIMIT: usize = 20;
const REQUEST_BYTE_LIMIT: usize = 100;

/// Inbound traffic routed to one local SOCKS5 connection.
#[derive(Debug)]
enum StreamEvent {
    Response { result: bool, reason: Option<String> },
    Data(Vec<u8>),
}

/// State shared between the SOCKS5 handlers and the session dispatcher.
struct ClientShared {
    mux: Mutex<Multiplexing>,
    streams: Mutex<HashMap<u32, UnboundedSender<StreamEvent>>>,
    send_q: UnboundedSender<WsFrame>,
    account: Option<Account>,
}

fn release_stream(shared: &ClientShared, stream_id: u32) {
    shared
        .streams
        .lock()
        .expect("stream table lock poisoned")
        .remove(&stream_id);
    shared
        .mux
        .lock()
        .expect("mux lock poisoned")
        .del_stream(stream_id);
}

/// Bind the SOCKS5 listener from the configuration and run forever.
pub async fn run_client(config: &Config) -> Result<()> {
    let listener = TcpListener::bind((config.socks5_address.as_str(), config.socks5_port))
        .await
        .wrap_err_with(|| {
            format!(
                "Failed to bind socks5 listener on {}:{}",
                config.socks5_address, config.socks5_port
            )
        })?;
    run_with_listener(config, listener).await
}

/// Run the proxy on an already-bound listener (used by integration tests).
pub async fn run_with_listener(config: &Config, listener: TcpListener) -> Result<()> {
    let account = match &config.nano_seed {
        Some(seed) => Some(Account::from_seed(seed, 0).map_err(|e| eyre!("bad seed: {e}"))?),
        None => None,
    };

    let (send_q, mut from_streams) = mpsc::unbounded_channel();
    let shared = Arc::new(ClientShared {
        mux: Mutex::new(Multiplexing::new(Role::Client)),
        streams: Mutex::new(HashMap::new()),
        send_q,
        account,
    });

    info!(addr = %listener.local_addr()?, "socks5 listener ready");

    let accept_shared = shared.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((conn, peer)) => {
                    let shared = accept_shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_socks(conn, shared).await {
                            debug!(peer = %peer, error = %e, "socks5 connection failed");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "socks5 accept failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    });

    let url = config
        .server_url
        .clone()
        .ok_or_else(|| eyre!("client role requires SERVER_URL"))?;

    // reconnect supervisor
    loop {
        match ws::connect(
            &url,
            config.username.as_deref(),
            config.password.as_deref(),
            config.verify_ssl,
            &[],
        )
        .await
        {
            Ok(session) => {
                if let Err(e) = run_session(&shared, session, &mut from_streams).await {
                    warn!(error = %e, "tunnel session failed");
                }
            }
            Err(e) => error!(error = %e, "could not reach server, retrying"),
        }

        // streams belong to the dead session; dropping their routes makes
        // each local pump observe the loss and close its socket
        shared
            .streams
            .lock()
            .expect("stream table lock poisoned")
            .clear();
        info!("tunnel session closed, reconnecting");
    }
}

/// Drive one WebSocket session: forward the shared send queue to a
/// dedicated writer task, dispatch inbound frames, and stop when either
/// side of the transport dies or a protocol violation terminates the
/// session. The shared queue itself survives for the next session.
async fn run_session(
    shared: &Arc<ClientShared>,
    session: WsStream,
    from_streams: &mut UnboundedReceiver<WsFrame>,
) -> Result<(), TunnelError> {
    let (sink, mut stream) = session.split();
    let (to_session, session_q) = mpsc::unbounded_channel();
    let mut writer = tokio::spawn(ws::drain_frames(sink, session_q));

    let result = loop {
        tokio::select! {
            outbound = from_streams.recv() => {
                let Some(frame) = outbound else {
                    break Err(TunnelError::Transport("send queue closed".into()));
                };
                if to_session.send(frame).is_err() {
                    break Err(TunnelError::Transport("websocket writer stopped".into()));
                }
            }
            inbound = ws::recv_frame(&mut stream) => {
                let outcome = match inbound {
                    Some(WsFrame::Binary(data)) => dispatch_binary(shared, &data),
                    Some(WsFrame::Text(text)) => dispatch_control(shared, &text),
                    None => Err(TunnelError::Transport("websocket session ended".into())),
                };
                if let Err(e) = outcome {
                    break Err(e);
                }
            }
            _ = &mut writer => {
                break Err(TunnelError::Transport("websocket writer stopped".into()));
            }
        }
    };

    writer.abort();
    result
}

/// Route a mux frame to its stream; an empty payload retires the id.
fn dispatch_binary(shared: &ClientShared, data: &[u8]) -> Result<(), TunnelError> {
    let (stream_id, payload) = Multiplexing::decode(data)?;

    let mut streams = shared.streams.lock().expect("stream table lock poisoned");
    let Some(route) = streams.get(&stream_id) else {
        debug!(stream_id, "dropping frame for unknown stream");
        return Ok(());
    };
    let _ = route.send(StreamEvent::Data(payload.to_vec()));

    if payload.is_empty() {
        streams.remove(&stream_id);
        shared
            .mux
            .lock()
            .expect("mux lock poisoned")
            .del_stream(stream_id);
    }
    Ok(())
}

fn dispatch_control(shared: &ClientShared, text: &str) -> Result<(), TunnelError> {
    let msg = CtrlMsg::from_json(text)?;

    match msg.body {
        CtrlBody::Charge {
            coin,
            server_account,
            price_kilo_requests,
            price_gigabytes,
        } => {
            info!(
                coin = %coin,
                server_account = %server_account,
                price_kilo_requests,
                price_gigabytes,
                "server advertised pricing"
            );
            let Some(account) = &shared.account else {
                info!("no seed configured, skipping signature");
                return Ok(());
            };

            let unix_secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let timestamped_msg = format!("{unix_secs}{SIGN_MESSAGE_SUFFIX}");
            let signature = hex::encode(account.sign(timestamped_msg.as_bytes())?);

            let stream_id = shared
                .mux
                .lock()
                .expect("mux lock poisoned")
                .new_stream();
            let reply = CtrlMsg::new(
                stream_id,
                CtrlBody::Signature {
                    client_account: account.address().to_string(),
                    timestamped_msg,
                    signature,
                },
            );
            let _ = shared.send_q.send(WsFrame::Text(reply.to_json()?));
        }
        CtrlBody::Response { result, reason } => {
            let streams = shared.streams.lock().expect("stream table lock poisoned");
            match streams.get(&msg.stream_id) {
                Some(route) => {
                    let _ = route.send(StreamEvent::Response { result, reason });
                }
                None => debug!(stream_id = msg.stream_id, "response for unknown stream"),
            }
        }
        CtrlBody::Balance {
            balance,
            total_pay,
            total_spend,
            total_requests,
            total_bytes,
        } => {
            info!(
                balance = %balance,
                total_pay = %total_pay,
                total_spend = %total_spend,
                total_requests = %total_requests,
                total_bytes = %total_bytes,
                "server pushed bill"
            );
        }
        other => debug!(?other, "ignoring control message"),
    }
    Ok(())
}

/// Serve one local SOCKS5 connection end to end.
async fn handle_socks(conn: TcpStream, shared: Arc<ClientShared>) -> Result<(), TunnelError> {
    let (mut local_read, mut local_write) = conn.into_split();
    let mut parser = Socks5Parser::new();

    let transport = |e: std::io::Error| TunnelError::Transport(format!("socks5 socket: {e}"));

    // byte-at-a-time parse, bounded so a bad client cannot grow the buffer
    let mut buffer = Vec::with_capacity(32);
    let mut done = false;
    for _ in 0..GREETING_BYTE_LIMIT {
        buffer.push(local_read.read_u8().await.map_err(transport)?);
        if parser.receive_greeting(&buffer)? == Progress::Done {
            done = true;
            break;
        }
    }
    if !done {
        return Err(TunnelError::Parse("socks5 greeting too long".into()));
    }
    local_write
        .write_all(&parser.send_greeting())
        .await
        .map_err(transport)?;

    buffer.clear();
    done = false;
    for _ in 0..REQUEST_BYTE_LIMIT {
        buffer.push(local_read.read_u8().await.map_err(transport)?);
        if parser.receive_request(&buffer)? == Progress::Done {
            done = true;
            break;
        }
    }
    if !done {
        return Err(TunnelError::Parse("socks5 request too long".into()));
    }

    let (address_type, dst_addr, dst_port) = parser.destination()?;

    let stream_id = shared
        .mux
        .lock()
        .expect("mux lock poisoned")
        .new_stream();
    let (route, mut events) = mpsc::unbounded_channel();
    shared
        .streams
        .lock()
        .expect("stream table lock poisoned")
        .insert(stream_id, route);

    info!(stream_id, dst_addr = %dst_addr, dst_port, "tunnel request");

    let request = CtrlMsg::new(
        stream_id,
        CtrlBody::Request {
            address_type,
            dst_addr,
            dst_port,
        },
    );
    match request.to_json() {
        Ok(json) => {
            let _ = shared.send_q.send(WsFrame::Text(json));
        }
        Err(e) => {
            release_stream(&shared, stream_id);
            return Err(e);
        }
    }

    // the first event on the route is the server's verdict
    let accepted = match events.recv().await {
        Some(StreamEvent::Response { result: true, .. }) => true,
        Some(StreamEvent::Response { result: false, reason }) => {
            warn!(stream_id, reason = ?reason, "tunnel request refused");
            false
        }
        Some(StreamEvent::Data(_)) => {
            warn!(stream_id, "data before response, dropping stream");
            false
        }
        // session died while we waited
        None => false,
    };

    if !accepted {
        let _ = local_write.write_all(&parser.send_failed_response(1)).await;
        release_stream(&shared, stream_id);
        return Ok(());
    }

    if let Err(e) = local_write.write_all(&parser.send_success_response()).await {
        release_stream(&shared, stream_id);
        return Err(transport(e));
    }

    // ws -> local: an empty chunk or a lost route closes the local socket
    let ws_to_local = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Data(data) if data.is_empty() => break,
                StreamEvent::Data(data) => {
                    if local_write.write_all(&data).await.is_err() {
                        break;
                    }
                }
                StreamEvent::Response { .. } => {}
            }
        }
    });

    // local -> ws: EOF becomes the empty-payload half-close marker
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match local_read.read(&mut buf).await {
            Ok(0) => {
                let _ = shared
                    .send_q
                    .send(WsFrame::Binary(Multiplexing::encode(stream_id, &[])));
                break;
            }
            Ok(n) => {
                let _ = shared
                    .send_q
                    .send(WsFrame::Binary(Multiplexing::encode(stream_id, &buf[..n])));
            }
            Err(e) => {
                debug!(stream_id, error = %e, "local read failed");
                ws_to_local.abort();
                break;
            }
        }
    }

    Ok(())
}
