//! End-to-end tunnel tests over loopback: a real client session, a real
//! axum server, and a real target socket.

use std::net::SocketAddr;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;

use nanotunnel::account::{encode_account, Account};
use nanotunnel::config::{Config, Mode, Role};
use nanotunnel::pricing::{self, Pricing};
use nanotunnel::server::{self, ChargeInfo, ServerState};
use nanotunnel::{client, db};

const IO_TIMEOUT: Duration = Duration::from_secs(10);

const SOCKS_SUCCESS: [u8; 10] = [5, 0, 0, 1, 0, 0, 0, 0, 0, 0];
const SOCKS_FAILURE: [u8; 10] = [5, 1, 0, 1, 0, 0, 0, 0, 0, 0];

fn client_config(server_addr: SocketAddr, nano_seed: Option<String>) -> Config {
    Config {
        role: Role::Client,
        mode: Mode::Proxy,
        server_url: Some(format!("ws://{server_addr}/")),
        server_host: "0.0.0.0".into(),
        server_port: 0,
        unix_path: None,
        username: None,
        password: None,
        verify_ssl: true,
        socks5_address: "127.0.0.1".into(),
        socks5_port: 0,
        nano_seed,
        cryptocoin: None,
        price_kilo_requests: 0.01,
        price_gigabytes: 0.01,
        database: "unused.db".into(),
        light_server_url: "wss://light.example/".into(),
        maintainer_interval_secs: 60,
    }
}

fn free_state() -> ServerState {
    ServerState {
        db: None,
        charge: None,
        pricing: pricing::new_shared(Pricing::default()),
        auth: None,
    }
}

async fn metered_state(name: &str) -> (ServerState, SqlitePool) {
    let path = std::env::temp_dir().join(format!(
        "nanotunnel-e2e-{}-{}.db",
        name,
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    let pool = db::create_pool(path.to_str().unwrap()).await.unwrap();
    db::run_migrations(&pool).await.unwrap();

    let state = ServerState {
        db: Some(pool.clone()),
        charge: Some(ChargeInfo {
            coin: "nano".into(),
            server_account: encode_account(&[1u8; 32]),
            price_kilo_requests: 0.01,
            price_gigabytes: 0.01,
        }),
        pricing: pricing::new_shared(Pricing::from_rates(1.0, 0.01, 0.01)),
        auth: None,
    };
    (state, pool)
}

async fn start_server(state: ServerState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server::serve_tcp(listener, state).await;
    });
    addr
}

async fn start_client(config: Config) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = client::run_with_listener(&config, listener).await;
    });
    addr
}

/// Echo target: mirrors every byte, reports what it received once the
/// client side half-closes, then closes its end.
async fn start_echo_target() -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (report, collected) = oneshot::channel();

    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match conn.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    received.extend_from_slice(&buf[..n]);
                    if conn.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = report.send(received);
    });

    (addr, collected)
}

async fn socks_handshake(socks_addr: SocketAddr, target: SocketAddr) -> (TcpStream, [u8; 10]) {
    let mut local = TcpStream::connect(socks_addr).await.unwrap();

    local.write_all(&[5, 1, 0]).await.unwrap();
    let mut greeting_reply = [0u8; 2];
    timeout(IO_TIMEOUT, local.read_exact(&mut greeting_reply))
        .await
        .expect("greeting reply timed out")
        .unwrap();
    assert_eq!(greeting_reply, [5, 0]);

    let mut request = vec![5, 1, 0, 1];
    match target {
        SocketAddr::V4(v4) => request.extend_from_slice(&v4.ip().octets()),
        SocketAddr::V6(_) => panic!("loopback target is v4"),
    }
    request.extend_from_slice(&target.port().to_be_bytes());
    local.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    timeout(IO_TIMEOUT, local.read_exact(&mut reply))
        .await
        .expect("request reply timed out")
        .unwrap();

    (local, reply)
}

#[tokio::test]
async fn test_connect_echo_and_half_close() {
    let server_addr = start_server(free_state()).await;
    let socks_addr = start_client(client_config(server_addr, None)).await;
    let (target_addr, collected) = start_echo_target().await;

    let (mut local, reply) = socks_handshake(socks_addr, target_addr).await;
    assert_eq!(reply, SOCKS_SUCCESS);

    // bytes travel local -> tunnel -> target and echo back in order
    let payload = b"0123456789";
    local.write_all(payload).await.unwrap();
    let mut echoed = [0u8; 10];
    timeout(IO_TIMEOUT, local.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&echoed, payload);

    // local EOF propagates as a half-close: the target sees exactly the
    // bytes we wrote, then shutdown-write
    local.shutdown().await.unwrap();
    let received = timeout(IO_TIMEOUT, collected)
        .await
        .expect("target never saw EOF")
        .unwrap();
    assert_eq!(received, payload);

    // the target closing surfaces as EOF on the local socket
    let mut sink = [0u8; 16];
    let n = timeout(IO_TIMEOUT, local.read(&mut sink))
        .await
        .expect("local EOF timed out")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_unverified_request_is_refused() {
    let (state, pool) = metered_state("unverified").await;
    let server_addr = start_server(state).await;
    // no seed configured, so the client never signs
    let socks_addr = start_client(client_config(server_addr, None)).await;
    let (target_addr, _collected) = start_echo_target().await;

    let (_local, reply) = socks_handshake(socks_addr, target_addr).await;
    assert_eq!(reply, SOCKS_FAILURE);

    // refusal happened before any debit: no client account was registered
    assert!(db::get_client_accounts(&pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_negative_balance_refuses_and_debits() {
    let (state, pool) = metered_state("negative").await;
    let server_addr = start_server(state).await;

    let seed = "ab".repeat(32);
    let account = Account::from_seed(&seed, 0).unwrap();
    let socks_addr = start_client(client_config(server_addr, Some(seed))).await;
    let (target_addr, _collected) = start_echo_target().await;

    // wait for the signature exchange to register the account
    let mut registered = false;
    for _ in 0..100 {
        if db::account_exists(&pool, account.address()).await.unwrap() {
            registered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(registered, "client account never registered");

    // with zero total_pay, the very first request debit drives the balance
    // negative, so the connect must be refused without touching the target
    let mut refused_after_debit = false;
    for _ in 0..20 {
        let (_local, reply) = socks_handshake(socks_addr, target_addr).await;
        assert_eq!(reply, SOCKS_FAILURE);

        let bill = db::get_bill(&pool, account.address()).await.unwrap();
        if bill.total_requests != "0" {
            refused_after_debit = true;
            assert!(
                db::get_bill_balance(&pool, account.address()).await.unwrap() < 0,
                "balance should be negative after the debit"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(refused_after_debit, "request was never debited");
}
