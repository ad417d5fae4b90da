//! Control messages carried as TEXT frames alongside the binary mux data.
//!
//! One JSON object per frame, tagged by `msg_type`. The optional `padding`
//! field lets a sender pad the wire length against traffic analysis; it is
//! ignored on decode. Validation runs on both encode and decode, and a
//! violation terminates the session it occurred on.

use serde::{Deserialize, Serialize};

use crate::error::TunnelError;

/// Refusal reason for a REQUEST from a session that has not proven account
/// ownership.
pub const REASON_ACCOUNT_NOT_VERIFIED: &str = "crypto coin client_account not verified";

/// Refusal reason for a REQUEST from an account whose ledger balance is
/// negative.
pub const REASON_NEGATIVE_BALANCE: &str = "negative balance";

/// Suffix the client appends to the unix timestamp when signing the
/// authentication nonce.
pub const SIGN_MESSAGE_SUFFIX: &str = "-message-to-sign";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CtrlMsg {
    pub stream_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub padding: Option<String>,
    #[serde(flatten)]
    pub body: CtrlBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "lowercase")]
pub enum CtrlBody {
    /// Client asks the server to open an outbound TCP for `stream_id`.
    Request {
        address_type: u8,
        dst_addr: String,
        dst_port: u16,
    },
    /// Server reply to a Request.
    Response {
        result: bool,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Server advertises its pricing at session start.
    #[serde(rename = "cryptocoin")]
    Charge {
        coin: String,
        server_account: String,
        price_kilo_requests: f64,
        price_gigabytes: f64,
    },
    /// Client proves account ownership by signing a timestamped nonce.
    Signature {
        client_account: String,
        timestamped_msg: String,
        signature: String,
    },
    /// Server pushes the client's ledger state. Amounts are decimal strings
    /// because raw values exceed what a JSON number can carry.
    Balance {
        balance: String,
        total_pay: String,
        total_spend: String,
        total_requests: String,
        total_bytes: String,
    },
}

impl CtrlMsg {
    pub fn new(stream_id: u32, body: CtrlBody) -> Self {
        Self {
            stream_id,
            padding: None,
            body,
        }
    }

    /// Serialize after validating.
    pub fn to_json(&self) -> Result<String, TunnelError> {
        self.validate()?;
        serde_json::to_string(self)
            .map_err(|e| TunnelError::Parse(format!("control message encode: {e}")))
    }

    /// Parse and validate one TEXT frame.
    pub fn from_json(data: &str) -> Result<Self, TunnelError> {
        let msg: CtrlMsg = serde_json::from_str(data)
            .map_err(|e| TunnelError::Parse(format!("control message decode: {e}")))?;
        msg.validate()?;
        Ok(msg)
    }

    fn validate(&self) -> Result<(), TunnelError> {
        if self.stream_id < 1 {
            return Err(TunnelError::Parse(format!(
                "stream_id must be positive: {}",
                self.stream_id
            )));
        }

        match &self.body {
            CtrlBody::Request { dst_addr, .. } => {
                if dst_addr.is_empty() {
                    return Err(TunnelError::Parse("request without dst_addr".into()));
                }
            }
            CtrlBody::Charge {
                coin,
                server_account,
                price_kilo_requests,
                price_gigabytes,
            } => {
                if coin.is_empty() || server_account.is_empty() {
                    return Err(TunnelError::Parse(
                        "cryptocoin without coin/server_account".into(),
                    ));
                }
                if *price_kilo_requests <= 0.0 || *price_gigabytes <= 0.0 {
                    return Err(TunnelError::Parse("cryptocoin prices must be positive".into()));
                }
            }
            CtrlBody::Signature {
                client_account,
                timestamped_msg,
                signature,
            } => {
                if client_account.is_empty() || timestamped_msg.is_empty() || signature.is_empty()
                {
                    return Err(TunnelError::Parse(
                        "signature must have client_account/timestamped_msg/signature".into(),
                    ));
                }
            }
            CtrlBody::Response { .. } | CtrlBody::Balance { .. } => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let msg = CtrlMsg::new(
            1,
            CtrlBody::Request {
                address_type: 3,
                dst_addr: "example.com".into(),
                dst_port: 443,
            },
        );
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""msg_type":"request""#));
        assert_eq!(CtrlMsg::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_charge_uses_cryptocoin_tag() {
        let msg = CtrlMsg::new(
            2,
            CtrlBody::Charge {
                coin: "nano".into(),
                server_account: "xrb_3t6k35gi95xu6tergt6p69ck76ogmitsa8mnijtpxm9fkcm736xtoncuohr3"
                    .into(),
                price_kilo_requests: 0.01,
                price_gigabytes: 0.01,
            },
        );
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""msg_type":"cryptocoin""#));
        assert_eq!(CtrlMsg::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_padding_ignored_on_decode() {
        let mut msg = CtrlMsg::new(
            1,
            CtrlBody::Response {
                result: true,
                reason: None,
            },
        );
        msg.padding = Some("x".repeat(100));
        let json = msg.to_json().unwrap();
        let parsed = CtrlMsg::from_json(&json).unwrap();
        // all non-padding fields match
        assert_eq!(parsed.stream_id, msg.stream_id);
        assert_eq!(parsed.body, msg.body);
    }

    #[test]
    fn test_response_reason_may_be_absent() {
        let parsed = CtrlMsg::from_json(
            r#"{"msg_type":"response","stream_id":5,"result":false}"#,
        )
        .unwrap();
        assert_eq!(
            parsed.body,
            CtrlBody::Response {
                result: false,
                reason: None
            }
        );
    }

    #[test]
    fn test_balance_amounts_survive_as_strings() {
        let msg = CtrlMsg::new(
            2,
            CtrlBody::Balance {
                balance: "-12000000000000000000000000000000000000".into(),
                total_pay: "1000000000000000000000000000000".into(),
                total_spend: "1000000012000000000000000000000000000000".into(),
                total_requests: "42".into(),
                total_bytes: "123456".into(),
            },
        );
        let json = msg.to_json().unwrap();
        assert_eq!(CtrlMsg::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_rejects_zero_stream_id() {
        assert!(CtrlMsg::from_json(
            r#"{"msg_type":"response","stream_id":0,"result":true,"reason":null}"#
        )
        .is_err());
    }

    #[test]
    fn test_rejects_unknown_msg_type() {
        assert!(CtrlMsg::from_json(r#"{"msg_type":"bogus","stream_id":1}"#).is_err());
    }

    #[test]
    fn test_rejects_request_missing_fields() {
        assert!(CtrlMsg::from_json(
            r#"{"msg_type":"request","stream_id":1,"dst_port":80}"#
        )
        .is_err());
    }
}
