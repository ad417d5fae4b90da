//! Light-wallet client for the nanocast websocket service.
//!
//! The service answers JSON requests asynchronously on one socket and also
//! broadcasts price data periodically, so every request reads responses
//! until one carries the expected keys. State blocks are signed locally;
//! proof-of-work comes from the service's `work_generate`.

use async_trait::async_trait;
use eyre::{bail, eyre, Result, WrapErr};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::ws::{self, WsFrame, WsStream};

pub const EMPTY_PREVIOUS: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

const DEFAULT_REPRESENTATIVE: &str =
    "nano_1nanode8ngaakzbck8smq6ru9bethqwyehomf79sae1k7xd47dkidjqzffeg";

/// Reads attempted per request before giving up.
const RECV_ATTEMPTS: u32 = 10;

/// The narrow interface the proxy core consumes. The maintainer is generic
/// over it so the chain service can be mocked out in tests.
#[async_trait]
pub trait LightWallet: Send {
    /// Current coin price in the fiat unit the operator quotes in.
    async fn price(&mut self) -> Result<f64>;

    /// Raw account history walking backward from `head` (or the frontier).
    async fn history(&mut self, count: u32, head: Option<&str>) -> Result<Vec<Value>>;

    /// Hashes of send blocks pending receipt.
    async fn pending(&mut self) -> Result<Vec<String>>;

    /// Receive every pending send block.
    async fn receive_all(&mut self) -> Result<()>;

    /// Send `amount_raw` to `dest_account`; returns the new frontier hash.
    async fn send(&mut self, dest_account: &str, amount_raw: u128) -> Result<String>;

    /// Balance/frontier/representative summary for the account.
    async fn account_info(&mut self) -> Result<Value>;
}

pub struct NanoLightClient {
    server_url: String,
    account: Account,
    ws: Option<WsStream>,
}

impl NanoLightClient {
    pub fn new(server_url: impl Into<String>, account: Account) -> Self {
        Self {
            server_url: server_url.into(),
            account,
            ws: None,
        }
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.ws.is_none() {
            let ws = ws::connect(
                &self.server_url,
                None,
                None,
                true,
                &[("X-Client-Version", "30"), ("User-Agent", "SwiftWebSocket")],
            )
            .await
            .wrap_err_with(|| format!("connect to light server {}", self.server_url))?;
            self.ws = Some(ws);
        }
        Ok(())
    }

    /// Send one request and read frames until a response carries every
    /// expected key. Price broadcasts are skipped unless the request asked
    /// for them; a transport failure drops the connection so the next call
    /// reconnects.
    async fn request(&mut self, request: Value, expected_keys: &[&str]) -> Result<Value> {
        self.ensure_connected().await?;
        // taken out so a failure below leaves us disconnected
        let mut ws = self.ws.take().expect("connected above");

        let payload = request.to_string();
        if let Err(e) = ws::send_frame(&mut ws, WsFrame::Text(payload)).await {
            bail!("light server send: {e}");
        }

        let ignore_price =
            !(expected_keys.contains(&"currency") && expected_keys.contains(&"price"));
        let timeout = if expected_keys.contains(&"work") {
            Duration::from_secs(90)
        } else {
            Duration::from_secs(30)
        };

        for _ in 0..RECV_ATTEMPTS {
            let frame = match tokio::time::timeout(timeout, ws::recv_frame(&mut ws)).await {
                Ok(Some(frame)) => frame,
                Ok(None) => bail!("light server connection closed, expected {expected_keys:?}"),
                Err(_) => bail!("timeout waiting for {expected_keys:?} from light server"),
            };

            let text = match frame {
                WsFrame::Text(text) => text,
                WsFrame::Binary(_) => {
                    warn!("unexpected binary frame from light server");
                    continue;
                }
            };

            let response: Value = match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "malformed json from light server");
                    continue;
                }
            };

            if ignore_price && response.get("currency").is_some() && response.get("price").is_some()
            {
                debug!("skipping broadcast price message");
                continue;
            }

            if let Some(error) = response.get("error") {
                self.ws = Some(ws);
                bail!("light server error: {error}");
            }

            if expected_keys.iter().all(|key| response.get(key).is_some()) {
                self.ws = Some(ws);
                return Ok(response);
            }

            warn!(%response, "unexpected message from light server");
        }

        self.ws = Some(ws);
        bail!("no {expected_keys:?} response after {RECV_ATTEMPTS} reads")
    }

    async fn work_generate(&mut self, data_hex: &str) -> Result<String> {
        let response = self
            .request(
                json!({ "action": "work_generate", "hash": data_hex }),
                &["work"],
            )
            .await?;
        value_string(&response, "work")
    }

    async fn block_hash(
        &mut self,
        previous: &str,
        representative: &str,
        balance: u128,
        link: &str,
    ) -> Result<String> {
        let block = json!({
            "type": "state",
            "account": self.account.address(),
            "previous": previous,
            "representative": representative,
            "balance": balance.to_string(),
            "link": link,
            "signature": "",
            "work": "0000000000000000",
        });
        let response = self
            .request(
                json!({ "action": "block_hash", "json_block": true, "block": block }),
                &["hash"],
            )
            .await?;
        value_string(&response, "hash")
    }

    async fn block_info(&mut self, hash: &str) -> Result<Value> {
        let response = self
            .request(
                json!({ "action": "blocks_info", "hashes": [hash] }),
                &["blocks"],
            )
            .await?;
        response
            .get("blocks")
            .and_then(|blocks| blocks.get(hash))
            .cloned()
            .ok_or_else(|| eyre!("blocks_info response missing {hash}"))
    }

    /// Amount carried by a send block, needed to compute the receive-side
    /// balance.
    async fn sent_amount(&mut self, source_hash: &str) -> Result<u128> {
        let info = self.block_info(source_hash).await?;
        let amount = info
            .get("amount")
            .and_then(|v| v.as_str())
            .ok_or_else(|| eyre!("source block {source_hash} has no amount"))?;
        amount
            .parse()
            .wrap_err_with(|| format!("bad amount in source block {source_hash}"))
    }

    /// Hash, sign, work, and publish one state block; returns the new
    /// frontier hash.
    async fn process_state_block(
        &mut self,
        previous: Option<&str>,
        representative: Option<&str>,
        balance: u128,
        link: &str,
    ) -> Result<String> {
        let previous = previous.unwrap_or(EMPTY_PREVIOUS);
        let representative = representative.unwrap_or(DEFAULT_REPRESENTATIVE);

        let hash_hex = self
            .block_hash(previous, representative, balance, link)
            .await?;
        let hash_bytes = hex::decode(&hash_hex).wrap_err("block hash is not hex")?;
        let signature = hex::encode(
            self.account
                .sign(&hash_bytes)
                .map_err(|e| eyre!("sign block: {e}"))?,
        );

        // an open block has no previous; its work target is the public key
        let work_data = if previous == EMPTY_PREVIOUS {
            self.account.public_key_hex()
        } else {
            previous.to_string()
        };
        let work = self.work_generate(&work_data).await?;

        let block = json!({
            "type": "state",
            "account": self.account.address(),
            "previous": previous,
            "representative": representative,
            "balance": balance.to_string(),
            "link": link,
            "signature": signature,
            "work": work,
        });
        let response = self
            .request(
                json!({ "action": "process", "block": block.to_string() }),
                &["hash"],
            )
            .await?;
        value_string(&response, "hash")
    }

    /// Receive into an account with no chain yet.
    async fn open(&mut self, source_hash: &str) -> Result<String> {
        let amount = self.sent_amount(source_hash).await?;
        let frontier = self
            .process_state_block(None, None, amount, source_hash)
            .await?;
        info!(amount, frontier = %frontier, "opened account with first receive");
        Ok(frontier)
    }

    async fn receive(&mut self, source_hash: &str) -> Result<()> {
        let info = match self.account_info().await {
            Ok(info) => info,
            Err(e) if e.to_string().contains("Account not found") => {
                debug!("account not opened yet, receiving with an open block");
                self.open(source_hash).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let balance_before: u128 = value_string(&info, "balance")?
            .parse()
            .wrap_err("bad balance in account_info")?;
        let previous = value_string(&info, "frontier")?;
        let representative = value_string(&info, "representative").ok();

        let amount = self.sent_amount(source_hash).await?;
        let balance_after = balance_before.saturating_add(amount);

        let frontier = self
            .process_state_block(
                Some(&previous),
                representative.as_deref(),
                balance_after,
                source_hash,
            )
            .await?;
        info!(amount, balance_after, frontier = %frontier, "received pending block");
        Ok(())
    }
}

#[async_trait]
impl LightWallet for NanoLightClient {
    async fn price(&mut self) -> Result<f64> {
        let response = self
            .request(
                json!({ "action": "price_data", "currency": "usd" }),
                &["currency", "price"],
            )
            .await?;
        let price = response
            .get("price")
            .ok_or_else(|| eyre!("price_data without price"))?;
        match price {
            Value::Number(n) => n.as_f64().ok_or_else(|| eyre!("price is not finite")),
            Value::String(s) => s.parse().wrap_err("price is not a number"),
            other => bail!("unexpected price value: {other}"),
        }
    }

    async fn history(&mut self, count: u32, head: Option<&str>) -> Result<Vec<Value>> {
        let mut request = json!({
            "action": "account_history",
            "raw": true,
            "account": self.account.address(),
            "count": count,
        });
        if let Some(head) = head {
            request["head"] = json!(head);
        }
        let response = self.request(request, &["account", "history"]).await?;
        match response.get("history") {
            Some(Value::Array(blocks)) => Ok(blocks.clone()),
            // an empty chain comes back as an empty string
            _ => Ok(Vec::new()),
        }
    }

    async fn pending(&mut self) -> Result<Vec<String>> {
        let account = self.account.address().to_string();
        let attempt = self
            .request(
                json!({ "action": "accounts_pending", "count": 10, "accounts": [account.clone()] }),
                &["blocks"],
            )
            .await
            .and_then(|response| {
                response
                    .get("blocks")
                    .and_then(|blocks| blocks.get(&account))
                    .cloned()
                    .ok_or_else(|| eyre!("accounts_pending response missing account"))
            });

        let blocks = match attempt {
            Ok(blocks) => blocks,
            Err(e) => {
                warn!(error = %e, "accounts_pending failed, falling back to pending");
                let response = self
                    .request(
                        json!({ "action": "pending", "count": 10, "account": account }),
                        &["blocks"],
                    )
                    .await?;
                response
                    .get("blocks")
                    .cloned()
                    .ok_or_else(|| eyre!("pending response missing blocks"))?
            }
        };

        Ok(hashes_from_blocks(&blocks))
    }

    async fn receive_all(&mut self) -> Result<()> {
        let pending = self.pending().await?;
        if pending.is_empty() {
            debug!("no pending block found");
            return Ok(());
        }

        info!(count = pending.len(), "receiving pending blocks");
        for hash in pending {
            self.receive(&hash).await?;
        }
        Ok(())
    }

    async fn send(&mut self, dest_account: &str, amount_raw: u128) -> Result<String> {
        let info = self.account_info().await?;
        let balance_before: u128 = value_string(&info, "balance")?
            .parse()
            .wrap_err("bad balance in account_info")?;
        if amount_raw > balance_before {
            bail!("cannot send {amount_raw} raw with balance {balance_before}");
        }

        let previous = value_string(&info, "frontier")?;
        let representative = value_string(&info, "representative").ok();

        self.process_state_block(
            Some(&previous),
            representative.as_deref(),
            balance_before - amount_raw,
            dest_account,
        )
        .await
    }

    async fn account_info(&mut self) -> Result<Value> {
        self.request(
            json!({
                "action": "account_info",
                "representative": true,
                "pending": true,
                "account": self.account.address(),
            }),
            &["balance", "pending", "frontier"],
        )
        .await
    }
}

fn value_string(value: &Value, key: &str) -> Result<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| eyre!("response missing string field {key}"))
}

/// Pending blocks arrive either as a plain hash array or as a hash-keyed
/// object with amounts.
fn hashes_from_blocks(blocks: &Value) -> Vec<String> {
    match blocks {
        Value::Array(hashes) => hashes
            .iter()
            .filter_map(|h| h.as_str().map(str::to_string))
            .collect(),
        Value::Object(map) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}
