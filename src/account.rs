//! Nano account strings, key derivation, and the Ed25519/BLAKE2b signature
//! scheme.
//!
//! An account string is `xrb_` (or `nano_`) followed by 52 characters
//! encoding the 32-byte public key (with 4 leading zero bits) in a custom
//! base32 alphabet, then 8 characters encoding a 5-byte BLAKE2b checksum of
//! the key with its bytes reversed. Keys derive from a 32-byte seed as
//! BLAKE2b-256(seed || index_be32). Signatures are Ed25519 with BLAKE2b-512
//! in place of SHA-512, built here directly on the dalek curve arithmetic.

use blake2::digest::consts::U32;
use blake2::digest::{Update, VariableOutput};
use blake2::{Blake2b, Blake2b512, Blake2bVar, Digest};
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;

use crate::error::TunnelError;

type Blake2b256 = Blake2b<U32>;

const XRB_ALPHABET: &[u8; 32] = b"13456789abcdefghijkmnopqrstuwxyz";

/// Length of the base32 key part of an account string.
const KEY_CHARS: usize = 52;
/// Length of the base32 checksum part.
const CHECKSUM_CHARS: usize = 8;

/// Encode `pad_bits` zero bits followed by `data` in the custom base32
/// alphabet. The total bit count must be a multiple of 5.
fn encode_b32(data: &[u8], pad_bits: usize) -> String {
    let total_bits = pad_bits + data.len() * 8;
    debug_assert_eq!(total_bits % 5, 0);

    let mut out = String::with_capacity(total_bits / 5);
    for chunk in 0..total_bits / 5 {
        let mut value = 0u8;
        for offset in 0..5 {
            let pos = chunk * 5 + offset;
            let bit = if pos < pad_bits {
                0
            } else {
                let p = pos - pad_bits;
                (data[p / 8] >> (7 - p % 8)) & 1
            };
            value = (value << 1) | bit;
        }
        out.push(XRB_ALPHABET[value as usize] as char);
    }
    out
}

/// Inverse of [`encode_b32`]: the first `pad_bits` bits must be zero.
fn decode_b32(encoded: &str, pad_bits: usize) -> Result<Vec<u8>, TunnelError> {
    let total_bits = encoded.len() * 5;
    let data_bits = total_bits
        .checked_sub(pad_bits)
        .filter(|bits| bits % 8 == 0)
        .ok_or_else(|| TunnelError::Parse("base32 length mismatch".into()))?;

    let mut data = vec![0u8; data_bits / 8];
    for (chunk, c) in encoded.bytes().enumerate() {
        let value = XRB_ALPHABET
            .iter()
            .position(|&a| a == c)
            .ok_or_else(|| TunnelError::Parse(format!("invalid base32 character {:?}", c as char)))?
            as u8;
        for offset in 0..5 {
            let bit = (value >> (4 - offset)) & 1;
            let pos = chunk * 5 + offset;
            if pos < pad_bits {
                if bit != 0 {
                    return Err(TunnelError::Parse("nonzero padding bits".into()));
                }
            } else {
                let p = pos - pad_bits;
                data[p / 8] |= bit << (7 - p % 8);
            }
        }
    }
    Ok(data)
}

/// 5-byte BLAKE2b digest of the public key, bytes reversed.
fn address_checksum(public_key: &[u8; 32]) -> [u8; 5] {
    let mut hasher = Blake2bVar::new(5).expect("5 is a valid blake2b output size");
    hasher.update(public_key);
    let mut checksum = [0u8; 5];
    hasher
        .finalize_variable(&mut checksum)
        .expect("output buffer matches digest size");
    checksum.reverse();
    checksum
}

/// Encode a public key as a canonical `xrb_` account string.
pub fn encode_account(public_key: &[u8; 32]) -> String {
    let key_part = encode_b32(public_key, 4);
    let checksum_part = encode_b32(&address_checksum(public_key), 0);
    format!("xrb_{key_part}{checksum_part}")
}

/// Decode an `xrb_` or `nano_` account string back to the public key,
/// verifying length, alphabet, and checksum.
pub fn decode_account(account: &str) -> Result<[u8; 32], TunnelError> {
    let rest = account
        .strip_prefix("xrb_")
        .or_else(|| account.strip_prefix("nano_"))
        .ok_or_else(|| {
            TunnelError::Parse(format!("account must start with xrb_ or nano_: {account}"))
        })?;

    if rest.len() != KEY_CHARS + CHECKSUM_CHARS {
        return Err(TunnelError::Parse(format!(
            "account body must be {} chars: {account}",
            KEY_CHARS + CHECKSUM_CHARS
        )));
    }

    let (key_part, checksum_part) = rest.split_at(KEY_CHARS);
    let key_bytes = decode_b32(key_part, 4)?;
    let public_key: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| TunnelError::Parse("account key part malformed".into()))?;

    if encode_b32(&address_checksum(&public_key), 0) != checksum_part {
        return Err(TunnelError::Parse(format!(
            "account checksum mismatch: {account}"
        )));
    }

    Ok(public_key)
}

/// Expand a 32-byte secret into the clamped scalar and hash prefix used by
/// Ed25519, with BLAKE2b-512 as the hash.
fn expand_secret(secret: &[u8; 32]) -> (Scalar, [u8; 32]) {
    let h = Blake2b512::digest(secret);
    let mut scalar_bytes = [0u8; 32];
    scalar_bytes.copy_from_slice(&h[..32]);
    scalar_bytes[0] &= 248;
    scalar_bytes[31] &= 127;
    scalar_bytes[31] |= 64;

    let mut prefix = [0u8; 32];
    prefix.copy_from_slice(&h[32..]);

    (Scalar::from_bytes_mod_order(scalar_bytes), prefix)
}

/// A Nano account: a public key with its canonical address, plus the secret
/// key when derived from a seed.
#[derive(Debug, Clone)]
pub struct Account {
    secret: Option<[u8; 32]>,
    public: [u8; 32],
    address: String,
}

impl Account {
    /// Derive the account at `index` from a 64-char hex seed:
    /// secret = BLAKE2b-256(seed || index_be32).
    pub fn from_seed(seed_hex: &str, index: u32) -> Result<Self, TunnelError> {
        let seed: [u8; 32] = hex::decode(seed_hex)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| TunnelError::Parse("seed must be 64 hex characters".into()))?;

        let mut hasher = Blake2b256::new();
        Digest::update(&mut hasher, seed);
        Digest::update(&mut hasher, index.to_be_bytes());
        let secret: [u8; 32] = hasher.finalize().into();

        let (scalar, _prefix) = expand_secret(&secret);
        let public = EdwardsPoint::mul_base(&scalar).compress().to_bytes();

        Ok(Self {
            secret: Some(secret),
            public,
            address: encode_account(&public),
        })
    }

    /// Verify-only account from an address string.
    pub fn from_address(address: &str) -> Result<Self, TunnelError> {
        let public = decode_account(address)?;
        Ok(Self {
            secret: None,
            public,
            address: encode_account(&public),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public).to_uppercase()
    }

    /// Sign `data` with Ed25519/BLAKE2b-512.
    pub fn sign(&self, data: &[u8]) -> Result<[u8; 64], TunnelError> {
        let secret = self
            .secret
            .ok_or_else(|| TunnelError::Auth("cannot sign without a secret key".into()))?;
        let (scalar, prefix) = expand_secret(&secret);

        let r = Scalar::from_hash(Blake2b512::new().chain_update(prefix).chain_update(data));
        let big_r = EdwardsPoint::mul_base(&r).compress();

        let k = Scalar::from_hash(
            Blake2b512::new()
                .chain_update(big_r.as_bytes())
                .chain_update(self.public)
                .chain_update(data),
        );
        let s = r + k * scalar;

        let mut signature = [0u8; 64];
        signature[..32].copy_from_slice(big_r.as_bytes());
        signature[32..].copy_from_slice(s.as_bytes());
        Ok(signature)
    }

    /// Verify a hex-encoded signature over `data`. Any malformed input
    /// verifies false.
    pub fn verify(&self, data: &[u8], signature_hex: &str) -> bool {
        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };
        if signature.len() != 64 {
            return false;
        }

        let mut s_bytes = [0u8; 32];
        s_bytes.copy_from_slice(&signature[32..]);
        let Some(s) = Option::<Scalar>::from(Scalar::from_canonical_bytes(s_bytes)) else {
            return false;
        };

        let mut r_bytes = [0u8; 32];
        r_bytes.copy_from_slice(&signature[..32]);

        let Some(minus_a) = CompressedEdwardsY(self.public).decompress().map(|p| -p) else {
            return false;
        };

        let k = Scalar::from_hash(
            Blake2b512::new()
                .chain_update(&signature[..32])
                .chain_update(self.public)
                .chain_update(data),
        );

        // s*B == R + k*A, checked as R == s*B - k*A
        let expected_r = EdwardsPoint::vartime_double_scalar_mul_basepoint(
            &k,
            &minus_a,
            &s,
        );
        expected_r.compress().to_bytes() == r_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SEED: &str = "0000000000000000000000000000000000000000000000000000000000000001";

    #[test]
    fn test_known_encode_vector() {
        // pyblake2-era reference vector: ASCII "0" repeated 32 times
        let public_key = [0x30u8; 32];
        assert_eq!(
            encode_account(&public_key),
            "xrb_1e3i81r51e3i81r51e3i81r51e3i81r51e3i81r51e3i81r51e3imxssakuq"
        );
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut public_key = [0u8; 32];
        for (i, byte) in public_key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let address = encode_account(&public_key);
        assert_eq!(address.len(), 64);
        assert_eq!(decode_account(&address).unwrap(), public_key);
    }

    #[test]
    fn test_decode_accepts_nano_prefix() {
        let public_key = [7u8; 32];
        let address = encode_account(&public_key);
        let renamed = address.replacen("xrb_", "nano_", 1);
        assert_eq!(decode_account(&renamed).unwrap(), public_key);
    }

    #[test]
    fn test_tampered_address_fails_checksum() {
        let address = encode_account(&[0x42u8; 32]);
        let mut chars: Vec<char> = address.chars().collect();
        // flip one character of the key part to a different alphabet char
        chars[10] = if chars[10] == '1' { '3' } else { '1' };
        let tampered: String = chars.into_iter().collect();
        assert!(decode_account(&tampered).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_prefix_and_length() {
        assert!(decode_account("abc_111").is_err());
        assert!(decode_account("xrb_111").is_err());
    }

    #[test]
    fn test_seed_derivation_is_deterministic() {
        let a = Account::from_seed(TEST_SEED, 0).unwrap();
        let b = Account::from_seed(TEST_SEED, 0).unwrap();
        assert_eq!(a.address(), b.address());

        let c = Account::from_seed(TEST_SEED, 1).unwrap();
        assert_ne!(a.address(), c.address());
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let account = Account::from_seed(TEST_SEED, 0).unwrap();
        let msg = b"1712345678-message-to-sign";
        let signature = hex::encode(account.sign(msg).unwrap());

        assert!(account.verify(msg, &signature));

        // verify-only account decoded from the address agrees
        let verifier = Account::from_address(account.address()).unwrap();
        assert!(verifier.verify(msg, &signature));
        assert!(!verifier.verify(b"other message", &signature));
    }

    #[test]
    fn test_verify_rejects_wrong_account() {
        let signer = Account::from_seed(TEST_SEED, 0).unwrap();
        let other = Account::from_seed(TEST_SEED, 7).unwrap();
        let msg = b"hello";
        let signature = hex::encode(signer.sign(msg).unwrap());
        assert!(!other.verify(msg, &signature));
    }

    #[test]
    fn test_verify_rejects_garbage_signature() {
        let account = Account::from_seed(TEST_SEED, 0).unwrap();
        assert!(!account.verify(b"msg", "zz"));
        assert!(!account.verify(b"msg", &"00".repeat(64)));
    }

    #[test]
    fn test_verify_only_account_cannot_sign() {
        let account = Account::from_seed(TEST_SEED, 0).unwrap();
        let verifier = Account::from_address(account.address()).unwrap();
        assert!(verifier.sign(b"msg").is_err());
    }
}
