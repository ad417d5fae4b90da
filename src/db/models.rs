use sqlx::FromRow;

// Amounts are raw (10^-30 NANO) and exceed i64, so they are stored as
// decimal TEXT and parsed to u128/i128 at the call sites.

pub const ROLE_SERVER: &str = "server";
pub const ROLE_CLIENT: &str = "client";

/// Per-client metering row. `balance = total_pay - total_spend` and is the
/// only field allowed to go negative.
#[derive(Debug, Clone, FromRow)]
pub struct Bill {
    pub client_account: String,
    pub total_pay: String,
    pub total_spend: String,
    pub balance: String,
    pub total_requests: String,
    pub total_bytes: String,
}

/// Normalized on-chain state block for a tracked account.
#[derive(Debug, Clone, FromRow)]
pub struct Block {
    pub hash: String,
    pub owner_account: String,
    /// Counterpart account: for a receive block, the sender.
    pub account: Option<String>,
    #[sqlx(rename = "type")]
    pub block_type: Option<String>,
    pub subtype: Option<String>,
    pub amount: Option<String>,
    pub balance: Option<String>,
    pub link: Option<String>,
    pub representative: Option<String>,
    pub signature: Option<String>,
    pub work: Option<String>,
    pub previous: Option<String>,
}

/// For upserting blocks fetched from account history.
#[derive(Debug, Clone, Default)]
pub struct NewBlock {
    pub hash: String,
    pub account: Option<String>,
    pub block_type: Option<String>,
    pub subtype: Option<String>,
    pub amount: Option<String>,
    pub balance: Option<String>,
    pub link: Option<String>,
    pub representative: Option<String>,
    pub signature: Option<String>,
    pub work: Option<String>,
    pub previous: Option<String>,
}
