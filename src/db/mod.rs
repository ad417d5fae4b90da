//! Persistent ledger: tracked accounts, their block history, and per-client
//! bills.
//!
//! The pool is capped at a single connection so every read-modify-write
//! transaction on a bill row is serialized; the data path and the maintainer
//! share the pool.

use std::collections::HashSet;

use eyre::{Result, WrapErr};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::time::Duration;
use tracing::warn;

pub mod models;

pub use models::*;

/// Open (creating if missing) the ledger database at `path`.
pub async fn create_pool(path: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .wrap_err_with(|| format!("Failed to open ledger database at {path}"))
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run ledger migrations")?;
    Ok(())
}

fn parse_raw(value: &str) -> Result<u128> {
    value
        .trim()
        .parse()
        .wrap_err_with(|| format!("ledger amount is not a nonnegative integer: {value}"))
}

fn parse_balance(value: &str) -> Result<i128> {
    value
        .trim()
        .parse()
        .wrap_err_with(|| format!("ledger balance is not an integer: {value}"))
}

/// Upsert an account row.
pub async fn update_account(
    pool: &SqlitePool,
    account: &str,
    role: &str,
    frontier: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO nano_account (account, role, frontier)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(account) DO UPDATE SET role = excluded.role, frontier = excluded.frontier
        "#,
    )
    .bind(account)
    .bind(role)
    .bind(frontier)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to upsert account {account}"))?;

    Ok(())
}

/// Check whether an account row exists.
pub async fn account_exists(pool: &SqlitePool, account: &str) -> Result<bool> {
    let row: (bool,) =
        sqlx::query_as(r#"SELECT EXISTS(SELECT 1 FROM nano_account WHERE account = ?1)"#)
            .bind(account)
            .fetch_one(pool)
            .await
            .wrap_err("Failed to check account existence")?;

    Ok(row.0)
}

/// All accounts registered with the server role.
pub async fn get_server_accounts(pool: &SqlitePool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as(r#"SELECT account FROM nano_account WHERE role = ?1"#)
            .bind(ROLE_SERVER)
            .fetch_all(pool)
            .await
            .wrap_err("Failed to get server accounts")?;

    Ok(rows.into_iter().map(|r| r.0).collect())
}

/// Every account that ever sent to a server account, derived from receive
/// blocks. Server accounts are excluded since servers may pay each other.
pub async fn get_client_accounts(pool: &SqlitePool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"SELECT DISTINCT account FROM block_chain
           WHERE subtype = 'receive' AND account IS NOT NULL"#,
    )
    .fetch_all(pool)
    .await
    .wrap_err("Failed to get client accounts")?;

    let servers: HashSet<String> = get_server_accounts(pool).await?.into_iter().collect();
    Ok(rows
        .into_iter()
        .map(|r| r.0)
        .filter(|account| !servers.contains(account))
        .collect())
}

/// Look up a block by hash.
pub async fn get_block(pool: &SqlitePool, hash: &str) -> Result<Option<Block>> {
    sqlx::query_as::<_, Block>(r#"SELECT * FROM block_chain WHERE hash = ?1"#)
        .bind(hash)
        .fetch_optional(pool)
        .await
        .wrap_err_with(|| format!("Failed to get block {hash}"))
}

/// Upsert one history block for `owner_account`.
pub async fn update_block(pool: &SqlitePool, owner_account: &str, block: &NewBlock) -> Result<()> {
    if block.block_type.as_deref() != Some("state") {
        warn!(
            hash = %block.hash,
            block_type = ?block.block_type,
            "non-state block in history"
        );
    }

    sqlx::query(
        r#"
        INSERT INTO block_chain (hash, owner_account, account, type, subtype, amount, balance,
            link, representative, signature, work, previous)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(hash) DO UPDATE SET
            owner_account = excluded.owner_account,
            account = excluded.account,
            type = excluded.type,
            subtype = excluded.subtype,
            amount = excluded.amount,
            balance = excluded.balance,
            link = excluded.link,
            representative = excluded.representative,
            signature = excluded.signature,
            work = excluded.work,
            previous = excluded.previous
        "#,
    )
    .bind(&block.hash)
    .bind(owner_account)
    .bind(&block.account)
    .bind(&block.block_type)
    .bind(&block.subtype)
    .bind(&block.amount)
    .bind(&block.balance)
    .bind(&block.link)
    .bind(&block.representative)
    .bind(&block.signature)
    .bind(&block.work)
    .bind(&block.previous)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to upsert block {}", block.hash))?;

    Ok(())
}

/// All receive blocks on `server_account`'s chain whose sender is
/// `client_account`.
pub async fn get_receive_blocks(
    pool: &SqlitePool,
    server_account: &str,
    client_account: &str,
) -> Result<Vec<Block>> {
    sqlx::query_as::<_, Block>(
        r#"SELECT * FROM block_chain
           WHERE subtype = 'receive' AND owner_account = ?1 AND account = ?2"#,
    )
    .bind(server_account)
    .bind(client_account)
    .fetch_all(pool)
    .await
    .wrap_err("Failed to get receive blocks")
}

/// Fetch the bill for an account, creating a zero row if absent.
pub async fn get_bill(pool: &SqlitePool, account: &str) -> Result<Bill> {
    sqlx::query(r#"INSERT OR IGNORE INTO proxy_bill (client_account) VALUES (?1)"#)
        .bind(account)
        .execute(pool)
        .await
        .wrap_err("Failed to ensure bill row")?;

    sqlx::query_as::<_, Bill>(r#"SELECT * FROM proxy_bill WHERE client_account = ?1"#)
        .bind(account)
        .fetch_one(pool)
        .await
        .wrap_err_with(|| format!("Failed to get bill for {account}"))
}

/// Current balance in raw; may be negative. Missing rows read as zero.
pub async fn get_bill_balance(pool: &SqlitePool, account: &str) -> Result<i128> {
    let row: Option<(String,)> =
        sqlx::query_as(r#"SELECT balance FROM proxy_bill WHERE client_account = ?1"#)
            .bind(account)
            .fetch_optional(pool)
            .await
            .wrap_err_with(|| format!("Failed to get bill balance for {account}"))?;

    match row {
        Some((balance,)) => parse_balance(&balance),
        None => Ok(0),
    }
}

/// Read-modify-write a counter column inside one transaction. `column` is a
/// fixed identifier supplied by the wrappers below, never caller input.
async fn increase_counter(
    pool: &SqlitePool,
    account: &str,
    column: &str,
    delta: u128,
) -> Result<()> {
    let mut tx = pool.begin().await.wrap_err("Failed to begin transaction")?;

    sqlx::query(r#"INSERT OR IGNORE INTO proxy_bill (client_account) VALUES (?1)"#)
        .bind(account)
        .execute(&mut *tx)
        .await
        .wrap_err("Failed to ensure bill row")?;

    let query = format!("SELECT {column} FROM proxy_bill WHERE client_account = ?1");
    let (current,): (String,) = sqlx::query_as(&query)
        .bind(account)
        .fetch_one(&mut *tx)
        .await
        .wrap_err_with(|| format!("Failed to read {column}"))?;

    let updated = parse_raw(&current)?.saturating_add(delta).to_string();

    let query = format!("UPDATE proxy_bill SET {column} = ?1 WHERE client_account = ?2");
    sqlx::query(&query)
        .bind(&updated)
        .bind(account)
        .execute(&mut *tx)
        .await
        .wrap_err_with(|| format!("Failed to update {column}"))?;

    tx.commit().await.wrap_err("Failed to commit transaction")
}

pub async fn increase_total_requests(pool: &SqlitePool, account: &str, n: u64) -> Result<()> {
    increase_counter(pool, account, "total_requests", n as u128).await
}

pub async fn increase_total_bytes(pool: &SqlitePool, account: &str, n: u64) -> Result<()> {
    increase_counter(pool, account, "total_bytes", n as u128).await
}

pub async fn increase_total_spend(pool: &SqlitePool, account: &str, raw: u128) -> Result<()> {
    increase_counter(pool, account, "total_spend", raw).await
}

/// Overwrite `total_pay` with the value recomputed from chain history.
pub async fn update_total_pay(pool: &SqlitePool, account: &str, total_pay: u128) -> Result<()> {
    sqlx::query(r#"INSERT OR IGNORE INTO proxy_bill (client_account) VALUES (?1)"#)
        .bind(account)
        .execute(pool)
        .await
        .wrap_err("Failed to ensure bill row")?;

    sqlx::query(r#"UPDATE proxy_bill SET total_pay = ?1 WHERE client_account = ?2"#)
        .bind(total_pay.to_string())
        .bind(account)
        .execute(pool)
        .await
        .wrap_err_with(|| format!("Failed to update total_pay for {account}"))?;

    Ok(())
}

/// Recompute `balance = total_pay - total_spend` and persist it.
pub async fn update_bill_balance(pool: &SqlitePool, account: &str) -> Result<()> {
    let mut tx = pool.begin().await.wrap_err("Failed to begin transaction")?;

    sqlx::query(r#"INSERT OR IGNORE INTO proxy_bill (client_account) VALUES (?1)"#)
        .bind(account)
        .execute(&mut *tx)
        .await
        .wrap_err("Failed to ensure bill row")?;

    let (total_pay, total_spend): (String, String) = sqlx::query_as(
        r#"SELECT total_pay, total_spend FROM proxy_bill WHERE client_account = ?1"#,
    )
    .bind(account)
    .fetch_one(&mut *tx)
    .await
    .wrap_err("Failed to read bill totals")?;

    let balance = parse_raw(&total_pay)? as i128 - parse_raw(&total_spend)? as i128;

    sqlx::query(r#"UPDATE proxy_bill SET balance = ?1 WHERE client_account = ?2"#)
        .bind(balance.to_string())
        .bind(account)
        .execute(&mut *tx)
        .await
        .wrap_err("Failed to update balance")?;

    tx.commit().await.wrap_err("Failed to commit transaction")
}

/// Recompute every known client's `total_pay` as the sum of receive-block
/// amounts into any server account, then refresh their balances. Newly seen
/// senders are registered as clients first.
pub async fn recompute_bills(pool: &SqlitePool) -> Result<()> {
    let servers = get_server_accounts(pool).await?;

    for client in get_client_accounts(pool).await? {
        update_account(pool, &client, ROLE_CLIENT, None).await?;

        let mut total_pay: u128 = 0;
        for server in &servers {
            for block in get_receive_blocks(pool, server, &client).await? {
                let amount = block.amount.as_deref().unwrap_or("0");
                total_pay = total_pay.saturating_add(parse_raw(amount)?);
            }
        }
        update_total_pay(pool, &client, total_pay).await?;
        update_bill_balance(pool, &client).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool(name: &str) -> SqlitePool {
        let path = std::env::temp_dir().join(format!(
            "nanotunnel-{}-{}.db",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        let pool = create_pool(path.to_str().unwrap()).await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    const CLIENT: &str = "xrb_1e3i81r51e3i81r51e3i81r51e3i81r51e3i81r51e3i81r51e3imxssakuq";
    const SERVER: &str = "xrb_server_test_account";

    #[tokio::test]
    async fn test_bill_balance_algebra() {
        let pool = test_pool("bill").await;
        update_account(&pool, CLIENT, ROLE_CLIENT, None).await.unwrap();

        let bill = get_bill(&pool, CLIENT).await.unwrap();
        assert_eq!(bill.total_pay, "0");
        assert_eq!(bill.balance, "0");

        update_total_pay(&pool, CLIENT, 100).await.unwrap();
        increase_total_spend(&pool, CLIENT, 30).await.unwrap();
        update_bill_balance(&pool, CLIENT).await.unwrap();
        assert_eq!(get_bill_balance(&pool, CLIENT).await.unwrap(), 70);

        increase_total_spend(&pool, CLIENT, 100).await.unwrap();
        update_bill_balance(&pool, CLIENT).await.unwrap();
        assert_eq!(get_bill_balance(&pool, CLIENT).await.unwrap(), -30);
    }

    #[tokio::test]
    async fn test_counters_accumulate() {
        let pool = test_pool("counters").await;
        update_account(&pool, CLIENT, ROLE_CLIENT, None).await.unwrap();

        increase_total_requests(&pool, CLIENT, 1).await.unwrap();
        increase_total_requests(&pool, CLIENT, 2).await.unwrap();
        increase_total_bytes(&pool, CLIENT, 8192).await.unwrap();

        let bill = get_bill(&pool, CLIENT).await.unwrap();
        assert_eq!(bill.total_requests, "3");
        assert_eq!(bill.total_bytes, "8192");
    }

    #[tokio::test]
    async fn test_missing_bill_reads_zero_balance() {
        let pool = test_pool("missing").await;
        assert_eq!(get_bill_balance(&pool, "xrb_nobody").await.unwrap(), 0);
    }

    fn receive_block(hash: &str, sender: &str, amount: &str) -> NewBlock {
        NewBlock {
            hash: hash.into(),
            account: Some(sender.into()),
            block_type: Some("state".into()),
            subtype: Some("receive".into()),
            amount: Some(amount.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_block_upsert_and_receive_queries() {
        let pool = test_pool("blocks").await;
        update_account(&pool, SERVER, ROLE_SERVER, None).await.unwrap();

        let block = receive_block("AA", CLIENT, "5");
        update_block(&pool, SERVER, &block).await.unwrap();
        // upsert with a changed amount overwrites, not duplicates
        let block = receive_block("AA", CLIENT, "6");
        update_block(&pool, SERVER, &block).await.unwrap();

        let blocks = get_receive_blocks(&pool, SERVER, CLIENT).await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].amount.as_deref(), Some("6"));

        // server accounts are not clients even if they appear as senders
        let clients = get_client_accounts(&pool).await.unwrap();
        assert_eq!(clients, vec![CLIENT.to_string()]);
    }

    #[tokio::test]
    async fn test_recompute_bills_is_idempotent() {
        let pool = test_pool("recompute").await;
        update_account(&pool, SERVER, ROLE_SERVER, None).await.unwrap();
        update_account(&pool, CLIENT, ROLE_CLIENT, None).await.unwrap();

        update_block(&pool, SERVER, &receive_block("B1", CLIENT, "5")).await.unwrap();
        update_block(&pool, SERVER, &receive_block("B2", CLIENT, "7")).await.unwrap();

        recompute_bills(&pool).await.unwrap();
        assert_eq!(get_bill(&pool, CLIENT).await.unwrap().total_pay, "12");
        assert_eq!(get_bill_balance(&pool, CLIENT).await.unwrap(), 12);

        recompute_bills(&pool).await.unwrap();
        assert_eq!(get_bill(&pool, CLIENT).await.unwrap().total_pay, "12");
    }
}
