//! Background ledger maintenance.
//!
//! Each tick refreshes the coin price into the pricing snapshot, receives
//! pending payments, pulls new chain history into the ledger, and recomputes
//! every client's `total_pay`. Failures are logged and the loop carries on;
//! the data path keeps serving from the last good state.

use std::time::Duration;

use eyre::Result;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::db::{self, NewBlock, ROLE_SERVER};
use crate::pricing::{self, Pricing, SharedPricing};
use crate::wallet::{LightWallet, EMPTY_PREVIOUS};

pub struct Maintainer {
    pub db: SqlitePool,
    pub pricing: SharedPricing,
    pub server_account: String,
    pub price_kilo_requests: f64,
    pub price_gigabytes: f64,
    pub interval: Duration,
}

impl Maintainer {
    pub async fn run<W: LightWallet>(self, mut wallet: W) {
        info!(interval_secs = self.interval.as_secs(), "ledger maintainer running");
        loop {
            if let Err(e) = self.tick(&mut wallet).await {
                error!(error = %e, "ledger maintenance failed");
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    pub async fn tick<W: LightWallet>(&self, wallet: &mut W) -> Result<()> {
        db::update_account(&self.db, &self.server_account, ROLE_SERVER, None).await?;

        match wallet.price().await {
            Ok(price) => {
                let refreshed =
                    Pricing::from_rates(price, self.price_kilo_requests, self.price_gigabytes);
                pricing::store(&self.pricing, refreshed);
                info!(
                    price,
                    raw_per_request = refreshed.raw_per_request,
                    raw_per_byte = refreshed.raw_per_byte,
                    "pricing refreshed"
                );
            }
            Err(e) => warn!(error = %e, "price fetch failed"),
        }

        if let Err(e) = wallet.receive_all().await {
            warn!(error = %e, "receive pending failed");
        }

        self.sync_history(wallet).await?;

        db::recompute_bills(&self.db).await?;
        Ok(())
    }

    /// Walk history backward in growing windows until a block already in
    /// the ledger or the open block, then upsert oldest-first. Re-fetched
    /// head blocks are harmless because the upsert is idempotent.
    async fn sync_history<W: LightWallet>(&self, wallet: &mut W) -> Result<()> {
        let mut collected: Vec<Value> = Vec::new();
        let mut head: Option<String> = None;
        let mut count = 2;

        loop {
            let batch = wallet.history(count, head.as_deref()).await?;
            if batch.is_empty() {
                break;
            }
            collected.extend(batch);
            count = 20;

            let last = collected.last().expect("just extended");
            let last_hash = last
                .get("hash")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if last_hash.is_empty() || head.as_deref() == Some(&last_hash) {
                break;
            }

            let known = db::get_block(&self.db, &last_hash).await?.is_some();
            let legacy_open = last.get("type").and_then(|v| v.as_str()) == Some("open");
            let state_open =
                last.get("previous").and_then(|v| v.as_str()) == Some(EMPTY_PREVIOUS);

            head = Some(last_hash);
            if known || legacy_open || state_open {
                break;
            }
        }

        collected.reverse();
        let mut stored = 0usize;
        for value in &collected {
            match block_from_history(value) {
                Some(block) => {
                    db::update_block(&self.db, &self.server_account, &block).await?;
                    stored += 1;
                }
                None => warn!(%value, "history entry without hash"),
            }
        }
        if stored > 0 {
            info!(blocks = stored, "history synced");
        }
        Ok(())
    }
}

fn field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// Convert one raw `account_history` entry into a ledger block row.
fn block_from_history(value: &Value) -> Option<NewBlock> {
    Some(NewBlock {
        hash: field(value, "hash")?,
        account: field(value, "account"),
        block_type: field(value, "type"),
        subtype: field(value, "subtype"),
        amount: field(value, "amount"),
        balance: field(value, "balance"),
        link: field(value, "link"),
        representative: field(value, "representative"),
        signature: field(value, "signature"),
        work: field(value, "work"),
        previous: field(value, "previous"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    const SERVER: &str = "xrb_maintainer_server";
    const CLIENT: &str = "xrb_maintainer_client";

    /// Canned chain service: a fixed price and a two-block history ending
    /// in the open block.
    struct MockWallet {
        history: Vec<Value>,
        receive_calls: u32,
    }

    #[async_trait]
    impl LightWallet for MockWallet {
        async fn price(&mut self) -> Result<f64> {
            Ok(1.0)
        }

        async fn history(&mut self, count: u32, head: Option<&str>) -> Result<Vec<Value>> {
            // first window is two blocks wide and starts at the frontier
            assert_eq!(count, 2);
            assert!(head.is_none());
            Ok(self.history.clone())
        }

        async fn pending(&mut self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn receive_all(&mut self) -> Result<()> {
            self.receive_calls += 1;
            Ok(())
        }

        async fn send(&mut self, _dest_account: &str, _amount_raw: u128) -> Result<String> {
            unimplemented!("not used by the maintainer")
        }

        async fn account_info(&mut self) -> Result<Value> {
            unimplemented!("not used by the maintainer")
        }
    }

    fn mock_wallet() -> MockWallet {
        MockWallet {
            history: vec![
                json!({
                    "hash": "FRONTIER",
                    "type": "state",
                    "subtype": "receive",
                    "account": CLIENT,
                    "amount": "7",
                    "previous": "OPENHASH",
                }),
                json!({
                    "hash": "OPENHASH",
                    "type": "state",
                    "subtype": "receive",
                    "account": CLIENT,
                    "amount": "5",
                    "previous": EMPTY_PREVIOUS,
                }),
            ],
            receive_calls: 0,
        }
    }

    async fn test_maintainer(name: &str) -> Maintainer {
        let path = std::env::temp_dir().join(format!(
            "nanotunnel-maint-{}-{}.db",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        let pool = db::create_pool(path.to_str().unwrap()).await.unwrap();
        db::run_migrations(&pool).await.unwrap();

        Maintainer {
            db: pool,
            pricing: pricing::new_shared(Pricing::default()),
            server_account: SERVER.into(),
            price_kilo_requests: 0.01,
            price_gigabytes: 0.01,
            interval: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_tick_syncs_history_and_bills() {
        let maintainer = test_maintainer("tick").await;
        let mut wallet = mock_wallet();

        maintainer.tick(&mut wallet).await.unwrap();

        assert_eq!(wallet.receive_calls, 1);
        // both blocks landed
        assert!(db::get_block(&maintainer.db, "FRONTIER").await.unwrap().is_some());
        assert!(db::get_block(&maintainer.db, "OPENHASH").await.unwrap().is_some());
        // total_pay recomputed from both receive blocks
        let bill = db::get_bill(&maintainer.db, CLIENT).await.unwrap();
        assert_eq!(bill.total_pay, "12");
        // pricing snapshot refreshed away from zero
        assert!(pricing::snapshot(&maintainer.pricing).raw_per_request > 0);
    }

    #[tokio::test]
    async fn test_tick_is_idempotent() {
        let maintainer = test_maintainer("idem").await;

        let mut wallet = mock_wallet();
        maintainer.tick(&mut wallet).await.unwrap();
        let first = db::get_bill(&maintainer.db, CLIENT).await.unwrap();

        // the second tick walks straight into known blocks
        let mut wallet = mock_wallet();
        maintainer.tick(&mut wallet).await.unwrap();
        let second = db::get_bill(&maintainer.db, CLIENT).await.unwrap();

        assert_eq!(first.total_pay, second.total_pay);
    }

    #[test]
    fn test_block_from_history_requires_hash() {
        assert!(block_from_history(&json!({ "type": "state" })).is_none());
        let block = block_from_history(&json!({ "hash": "AB", "amount": "3" })).unwrap();
        assert_eq!(block.hash, "AB");
        assert_eq!(block.amount.as_deref(), Some("3"));
        assert!(block.subtype.is_none());
    }
}
