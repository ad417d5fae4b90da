//! Typed errors for the tunnel dataplane.
//!
//! Session handlers map these onto the recovery policy: parse and auth
//! failures terminate the session, billing failures refuse or force-close
//! individual streams, transport failures trigger the client reconnect
//! supervisor, and ledger failures deny service while pricing is enabled.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    /// Malformed SOCKS5 bytes, mux frame, or control JSON.
    #[error("parse error: {0}")]
    Parse(String),

    /// Signature did not verify against the claimed account.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The client ledger cannot cover the operation.
    #[error("billing refused: {0}")]
    Billing(String),

    /// Connect/read/write failure on a socket or WebSocket.
    #[error("transport failed: {0}")]
    Transport(String),

    /// A connect attempt exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The ledger store failed; callers treat the balance as unknown.
    #[error("ledger failure: {0}")]
    Ledger(String),
}
