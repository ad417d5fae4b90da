//! Server proxy: accepts tunnel sessions over WebSocket, opens one outbound
//! TCP connection per stream, and meters the client's ledger per request and
//! per forwarded byte.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use eyre::{eyre, Result, WrapErr};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use sqlx::SqlitePool;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::config::Config;
use crate::control::{CtrlBody, CtrlMsg, REASON_ACCOUNT_NOT_VERIFIED, REASON_NEGATIVE_BALANCE};
use crate::db;
use crate::error::TunnelError;
use crate::maintainer::Maintainer;
use crate::mux::{Multiplexing, Role};
use crate::pricing::{self, Pricing, SharedPricing};
use crate::wallet::NanoLightClient;
use crate::ws::WsFrame;

const READ_CHUNK: usize = 8192;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pricing advertised to every new session.
#[derive(Debug, Clone)]
pub struct ChargeInfo {
    pub coin: String,
    pub server_account: String,
    pub price_kilo_requests: f64,
    pub price_gigabytes: f64,
}

/// Shared server state handed to every session.
#[derive(Clone)]
pub struct ServerState {
    pub db: Option<SqlitePool>,
    pub charge: Option<ChargeInfo>,
    pub pricing: SharedPricing,
    /// HTTP Basic credentials checked on the upgrade request when set.
    pub auth: Option<(String, String)>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/healthz", get(liveness))
        .route("/", get(ws_handler))
        .route("/{*tail}", get(ws_handler))
        .with_state(state)
}

async fn liveness() -> &'static str {
    "OK"
}

fn basic_auth_ok(headers: &HeaderMap, username: &str, password: &str) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded) else {
        return false;
    };
    String::from_utf8(decoded)
        .map(|credentials| credentials == format!("{username}:{password}"))
        .unwrap_or(false)
}

async fn ws_handler(
    State(state): State<ServerState>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    if let Some((username, password)) = &state.auth {
        if !basic_auth_ok(&headers, username, password) {
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic")],
                "unauthorized",
            )
                .into_response();
        }
    }

    upgrade.on_upgrade(move |socket| async move {
        info!("new tunnel session");
        match run_session(socket, state).await {
            Ok(()) => info!("tunnel session closed"),
            Err(e) => warn!(error = %e, "tunnel session ended with error"),
        }
    })
}

/// One tunnel session: mux state, the outbound socket per stream, and the
/// billing identity bound by a verified signature.
struct Session {
    state: ServerState,
    mux: Multiplexing,
    streams: HashMap<u32, OwnedWriteHalf>,
    client_account: Option<String>,
    account_verified: bool,
    to_ws: UnboundedSender<WsFrame>,
}

async fn send_ws(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: WsFrame,
) -> Result<(), TunnelError> {
    let message = match frame {
        WsFrame::Binary(data) => Message::Binary(data.into()),
        WsFrame::Text(text) => Message::Text(text.into()),
    };
    sink.send(message)
        .await
        .map_err(|e| TunnelError::Transport(format!("websocket send: {e}")))
}

/// Serialized writer for one session: every task submits frames through
/// the channel, so partial frames never interleave on the socket.
async fn drain_session(
    mut sink: SplitSink<WebSocket, Message>,
    mut frames: tokio::sync::mpsc::UnboundedReceiver<WsFrame>,
) {
    let mut heartbeat = tokio::time::interval(crate::ws::HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                if send_ws(&mut sink, frame).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn run_session(socket: WebSocket, state: ServerState) -> Result<(), TunnelError> {
    let (sink, mut stream) = socket.split();
    let (to_ws, outbound) = mpsc::unbounded_channel();
    let mut writer = tokio::spawn(drain_session(sink, outbound));

    let mut session = Session {
        mux: Multiplexing::new(Role::Server),
        streams: HashMap::new(),
        client_account: None,
        // without pricing there is nothing to verify
        account_verified: state.charge.is_none(),
        to_ws,
        state,
    };

    if let Some(charge) = session.state.charge.clone() {
        let msg = CtrlMsg::new(
            session.mux.new_stream(),
            CtrlBody::Charge {
                coin: charge.coin,
                server_account: charge.server_account,
                price_kilo_requests: charge.price_kilo_requests,
                price_gigabytes: charge.price_gigabytes,
            },
        );
        let _ = session.to_ws.send(WsFrame::Text(msg.to_json()?));
    }

    let result = loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(e) = session.handle_binary(&data).await {
                            break Err(e);
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = session.handle_control(text.as_str()).await {
                            break Err(e);
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket receive failed");
                        break Ok(());
                    }
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

impl Session {
    /// Handle one control message. An auth or parse error terminates the
    /// session.
    async fn handle_control(&mut self, text: &str) -> Result<(), TunnelError> {
        let msg = CtrlMsg::from_json(text)?;

        match msg.body {
            CtrlBody::Signature {
                client_account,
                timestamped_msg,
                signature,
            } => {
                let verifier = Account::from_address(&client_account).map_err(|e| {
                    TunnelError::Auth(format!("bad account {client_account}: {e}"))
                })?;
                if !verifier.verify(timestamped_msg.as_bytes(), &signature) {
                    return Err(TunnelError::Auth(format!(
                        "signature not valid for {client_account}"
                    )));
                }

                if let Some(pool) = self.state.db.clone() {
                    if let Err(e) = register_client(&pool, &client_account).await {
                        // balance stays unknown, so requests stay refused
                        warn!(error = %e, "failed to register client account");
                        return Ok(());
                    }
                }

                self.account_verified = true;
                self.client_account = Some(client_account.clone());
                info!(account = %client_account, "client account verified");
                self.push_bill().await;
                Ok(())
            }
            CtrlBody::Request {
                dst_addr, dst_port, ..
            } => {
                self.handle_request(msg.stream_id, dst_addr, dst_port).await;

                // balance pushes ride on request debits only, byte debits
                // are far too frequent for control-plane chatter
                if let (Some(account), Some(pool)) =
                    (self.client_account.clone(), self.state.db.clone())
                {
                    let threshold =
                        pricing::snapshot(&self.state.pricing).balance_warn_threshold;
                    match db::get_bill_balance(&pool, &account).await {
                        Ok(balance) if balance < threshold as i128 => self.push_bill().await,
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "balance read failed"),
                    }
                }
                Ok(())
            }
            other => {
                debug!(?other, "ignoring control message");
                Ok(())
            }
        }
    }

    async fn handle_request(&mut self, stream_id: u32, dst_addr: String, dst_port: u16) {
        if self.streams.contains_key(&stream_id) {
            warn!(stream_id, "conflicting stream id, dropping request");
            return;
        }

        if !self.account_verified {
            self.respond(stream_id, false, Some(REASON_ACCOUNT_NOT_VERIFIED));
            return;
        }

        // the request is debited even when it ends up refused
        let balance = charge_request(&self.state, &self.client_account).await;
        if balance < 0 {
            self.respond(stream_id, false, Some(REASON_NEGATIVE_BALANCE));
            return;
        }

        let connect = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((dst_addr.as_str(), dst_port)),
        )
        .await;
        let outbound = match connect {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                info!(stream_id, dst_addr = %dst_addr, dst_port, error = %e, "outbound connect failed");
                self.respond(stream_id, false, None);
                return;
            }
            Err(_) => {
                info!(stream_id, dst_addr = %dst_addr, dst_port, "outbound connect timed out");
                self.respond(stream_id, false, None);
                return;
            }
        };

        info!(stream_id, dst_addr = %dst_addr, dst_port, "outbound connected");
        self.respond(stream_id, true, None);

        let (read_half, write_half) = outbound.into_split();
        self.streams.insert(stream_id, write_half);
        tokio::spawn(outbound_to_ws(
            read_half,
            stream_id,
            self.to_ws.clone(),
            self.state.clone(),
            self.client_account.clone(),
        ));
    }

    /// Route one mux frame to its outbound socket, debiting the bytes. An
    /// empty payload (from the client or forced by a negative balance)
    /// half-closes the target and retires the stream.
    async fn handle_binary(&mut self, data: &[u8]) -> Result<(), TunnelError> {
        let (stream_id, payload) = Multiplexing::decode(data)?;

        if !self.streams.contains_key(&stream_id) {
            debug!(stream_id, "unknown stream id");
            return Ok(());
        }

        let mut payload = payload.to_vec();
        let balance = charge_bytes(&self.state, &self.client_account, payload.len()).await;
        if balance < 0 {
            warn!(stream_id, balance, "negative balance, forcing stream close");
            payload.clear();
        }

        if payload.is_empty() {
            // dropping the write half sends FIN while the outbound pump
            // keeps draining the other direction
            self.streams.remove(&stream_id);
            return Ok(());
        }

        let writer = self.streams.get_mut(&stream_id).expect("checked above");
        if let Err(e) = writer.write_all(&payload).await {
            debug!(stream_id, error = %e, "outbound write failed");
            self.streams.remove(&stream_id);
        }
        Ok(())
    }

    fn respond(&self, stream_id: u32, result: bool, reason: Option<&str>) {
        let msg = CtrlMsg::new(
            stream_id,
            CtrlBody::Response {
                result,
                reason: reason.map(str::to_string),
            },
        );
        match msg.to_json() {
            Ok(json) => {
                let _ = self.to_ws.send(WsFrame::Text(json));
            }
            Err(e) => warn!(error = %e, "response encode failed"),
        }
    }

    /// Push the client's current bill as a BALANCE message.
    async fn push_bill(&mut self) {
        let Some(account) = self.client_account.clone() else {
            return;
        };
        let Some(pool) = self.state.db.clone() else {
            return;
        };

        match db::get_bill(&pool, &account).await {
            Ok(bill) => {
                let msg = CtrlMsg::new(
                    self.mux.new_stream(),
                    CtrlBody::Balance {
                        balance: bill.balance,
                        total_pay: bill.total_pay,
                        total_spend: bill.total_spend,
                        total_requests: bill.total_requests,
                        total_bytes: bill.total_bytes,
                    },
                );
                match msg.to_json() {
                    Ok(json) => {
                        let _ = self.to_ws.send(WsFrame::Text(json));
                    }
                    Err(e) => warn!(error = %e, "bill encode failed"),
                }
            }
            Err(e) => warn!(error = %e, "bill read failed"),
        }
    }
}

async fn register_client(pool: &SqlitePool, account: &str) -> Result<()> {
    db::update_account(pool, account, db::ROLE_CLIENT, None).await?;
    db::recompute_bills(pool).await?;
    Ok(())
}

/// Debit one request and return the post-debit balance. Unmetered sessions
/// read as solvent; a failing ledger reads as insolvent.
async fn charge_request(state: &ServerState, account: &Option<String>) -> i128 {
    let (Some(pool), Some(account)) = (&state.db, account) else {
        return 1;
    };
    let raw_per_request = pricing::snapshot(&state.pricing).raw_per_request;

    let result = async {
        db::increase_total_requests(pool, account, 1).await?;
        db::increase_total_spend(pool, account, raw_per_request).await?;
        db::update_bill_balance(pool, account).await?;
        db::get_bill_balance(pool, account).await
    }
    .await;

    match result {
        Ok(balance) => balance,
        Err(e) => {
            warn!(error = %e, "request debit failed, denying service");
            -1
        }
    }
}

/// Debit `size` forwarded bytes and return the post-debit balance.
async fn charge_bytes(state: &ServerState, account: &Option<String>, size: usize) -> i128 {
    let (Some(pool), Some(account)) = (&state.db, account) else {
        return 1;
    };
    let raw_per_byte = pricing::snapshot(&state.pricing).raw_per_byte;
    let spend = raw_per_byte.saturating_mul(size as u128);

    let result = async {
        db::increase_total_bytes(pool, account, size as u64).await?;
        db::increase_total_spend(pool, account, spend).await?;
        db::update_bill_balance(pool, account).await?;
        db::get_bill_balance(pool, account).await
    }
    .await;

    match result {
        Ok(balance) => balance,
        Err(e) => {
            warn!(error = %e, "byte debit failed, denying service");
            -1
        }
    }
}

/// Pump target-to-client traffic, debiting every chunk. A read error or
/// EOF (or a forced empty chunk on negative balance) emits the half-close
/// marker and ends the pump.
async fn outbound_to_ws(
    mut read_half: OwnedReadHalf,
    stream_id: u32,
    to_ws: UnboundedSender<WsFrame>,
    state: ServerState,
    account: Option<String>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let mut data = match read_half.read(&mut buf).await {
            Ok(n) => buf[..n].to_vec(),
            Err(e) => {
                debug!(stream_id, error = %e, "outbound read failed");
                Vec::new()
            }
        };

        let balance = charge_bytes(&state, &account, data.len()).await;
        if balance < 0 {
            data.clear();
        }

        let eof = data.is_empty();
        // a send failure means the session is gone and the pump with it
        if to_ws
            .send(WsFrame::Binary(Multiplexing::encode(stream_id, &data)))
            .is_err()
            || eof
        {
            break;
        }
    }
}

/// Build the shared state from configuration and, when metering is on,
/// spawn the ledger maintainer.
pub async fn build_state(config: &Config) -> Result<ServerState> {
    let auth = match (config.username.clone(), config.password.clone()) {
        (Some(username), Some(password)) => Some((username, password)),
        _ => None,
    };

    let Some(coin) = config.cryptocoin.clone() else {
        info!("metering disabled, tunneling for free");
        return Ok(ServerState {
            db: None,
            charge: None,
            pricing: pricing::new_shared(Pricing::default()),
            auth,
        });
    };

    let seed = config
        .nano_seed
        .as_ref()
        .ok_or_else(|| eyre!("CRYPTOCOIN requires NANO_SEED"))?;
    let account = Account::from_seed(seed, 0).map_err(|e| eyre!("bad seed: {e}"))?;
    info!(account = %account.address(), "server account");

    let pool = db::create_pool(&config.database).await?;
    db::run_migrations(&pool).await?;

    let shared_pricing = pricing::new_shared(Pricing::from_rates(
        pricing::STARTUP_COIN_PRICE,
        config.price_kilo_requests,
        config.price_gigabytes,
    ));

    let maintainer = Maintainer {
        db: pool.clone(),
        pricing: shared_pricing.clone(),
        server_account: account.address().to_string(),
        price_kilo_requests: config.price_kilo_requests,
        price_gigabytes: config.price_gigabytes,
        interval: Duration::from_secs(config.maintainer_interval_secs),
    };
    let wallet = NanoLightClient::new(config.light_server_url.clone(), account.clone());
    tokio::spawn(maintainer.run(wallet));

    Ok(ServerState {
        db: Some(pool),
        charge: Some(ChargeInfo {
            coin,
            server_account: account.address().to_string(),
            price_kilo_requests: config.price_kilo_requests,
            price_gigabytes: config.price_gigabytes,
        }),
        pricing: shared_pricing,
        auth,
    })
}

/// Serve tunnel sessions on an already-bound TCP listener (used by
/// integration tests).
pub async fn serve_tcp(listener: tokio::net::TcpListener, state: ServerState) -> Result<()> {
    axum::serve(listener, router(state))
        .await
        .wrap_err("server failed")
}

/// Serve tunnel sessions on TCP or, when `unix_path` is set, a unix socket.
pub async fn run_server(config: &Config) -> Result<()> {
    let state = build_state(config).await?;

    if let Some(path) = &config.unix_path {
        let _ = std::fs::remove_file(path);
        let listener = tokio::net::UnixListener::bind(path)
            .wrap_err_with(|| format!("Failed to bind unix socket {path}"))?;
        info!(path = %path, "tunnel server listening on unix socket");
        axum::serve(listener, router(state))
            .await
            .wrap_err("server failed")?;
    } else {
        let listener =
            tokio::net::TcpListener::bind((config.server_host.as_str(), config.server_port))
                .await
                .wrap_err_with(|| {
                    format!(
                        "Failed to bind {}:{}",
                        config.server_host, config.server_port
                    )
                })?;
        info!(addr = %listener.local_addr()?, "tunnel server listening");
        serve_tcp(listener, state).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_basic_auth_check() {
        let mut headers = HeaderMap::new();
        assert!(!basic_auth_ok(&headers, "user", "pass"));

        let encoded = BASE64.encode("user:pass");
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
        );
        assert!(basic_auth_ok(&headers, "user", "pass"));
        assert!(!basic_auth_ok(&headers, "user", "other"));
    }
}
