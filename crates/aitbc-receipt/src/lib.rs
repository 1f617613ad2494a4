// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - RECEIPT MODULE
//
// Compute receipts: canonical encoding, content addressing, signing.
// - Ed25519 signing and verification (raw 32-byte public keys)
// - Deterministic length-prefixed wire codec (no floats, integer minor units)
// - receipt_id = SHA-256(canonical_encoding(payload)), hex-encoded
// - AITBC address derivation (Base58Check with BLAKE2b-160)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use blake2::Blake2b512;
use digest::Digest;
use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

pub mod wire;

use wire::{WireReader, WireWriter};

/// Ed25519 public key length (raw bytes)
pub const PUBLIC_KEY_LEN: usize = 32;
/// Ed25519 detached signature length
pub const SIGNATURE_LEN: usize = 64;

#[derive(Debug, PartialEq)]
pub enum ReceiptError {
    /// Signature bytes do not verify against the payload
    SignatureInvalid,
    /// The signer's public key is not in the trusted set
    UnknownSigner(String),
    /// Canonical encoding/decoding failed (type mismatch at the boundary)
    Encoding(String),
    /// Key material is malformed (wrong length, bad hex)
    InvalidKey(String),
}

impl std::fmt::Display for ReceiptError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ReceiptError::SignatureInvalid => write!(f, "SignatureInvalid"),
            ReceiptError::UnknownSigner(who) => write!(f, "UnknownSigner: {}", who),
            ReceiptError::Encoding(msg) => write!(f, "EncodingError: {}", msg),
            ReceiptError::InvalidKey(msg) => write!(f, "InvalidKey: {}", msg),
        }
    }
}

impl std::error::Error for ReceiptError {}

// ─────────────────────────────────────────────────────────────────
// KEY MATERIAL
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KeyPair {
    pub public_key: Vec<u8>,
    pub secret_key: Vec<u8>,
}

/// SECURITY: Zeroize secret key from memory on drop to prevent
/// recovery via memory dump, swap file, or core dump.
impl Drop for KeyPair {
    fn drop(&mut self) {
        self.secret_key.zeroize();
    }
}

impl KeyPair {
    pub fn public_key_hex(&self) -> String {
        hex::encode(&self.public_key)
    }

    /// AITBC address of this keypair (Base58Check, `AIT` prefix)
    pub fn address(&self) -> String {
        public_key_to_address(&self.public_key)
    }
}

/// Generate a new random Ed25519 keypair
pub fn generate_keypair() -> KeyPair {
    let signing = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
    KeyPair {
        public_key: signing.verifying_key().to_bytes().to_vec(),
        secret_key: signing.to_bytes().to_vec(),
    }
}

/// Reconstruct a keypair from a 32-byte secret seed.
/// Same seed ALWAYS produces the same keypair and address.
pub fn keypair_from_secret(secret_bytes: &[u8]) -> Result<KeyPair, ReceiptError> {
    let seed: [u8; 32] = secret_bytes.try_into().map_err(|_| {
        ReceiptError::InvalidKey(format!(
            "secret key must be 32 bytes, got {}",
            secret_bytes.len()
        ))
    })?;
    let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
    Ok(KeyPair {
        public_key: signing.verifying_key().to_bytes().to_vec(),
        secret_key: seed.to_vec(),
    })
}

/// Reconstruct a keypair from a hex-encoded 32-byte secret seed
/// (`RECEIPT_SIGNING_KEY_HEX` / `RECEIPT_ATTESTATION_KEY_HEX` format).
pub fn keypair_from_secret_hex(secret_hex: &str) -> Result<KeyPair, ReceiptError> {
    let bytes = hex::decode(secret_hex.trim())
        .map_err(|e| ReceiptError::InvalidKey(format!("bad secret hex: {}", e)))?;
    keypair_from_secret(&bytes)
}

/// Sign an arbitrary message with an Ed25519 secret key
pub fn sign_message(message: &[u8], secret_key_bytes: &[u8]) -> Result<Vec<u8>, ReceiptError> {
    let seed: [u8; 32] = secret_key_bytes
        .try_into()
        .map_err(|_| ReceiptError::InvalidKey("secret key must be 32 bytes".to_string()))?;
    let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
    Ok(signing.sign(message).to_bytes().to_vec())
}

/// Verify an Ed25519 signature (RFC 8032)
pub fn verify_message(message: &[u8], signature_bytes: &[u8], public_key_bytes: &[u8]) -> bool {
    let pk_array: [u8; PUBLIC_KEY_LEN] = match public_key_bytes.try_into() {
        Ok(a) => a,
        Err(_) => return false,
    };
    let vk = match ed25519_dalek::VerifyingKey::from_bytes(&pk_array) {
        Ok(k) => k,
        Err(_) => return false,
    };
    let sig = match ed25519_dalek::Signature::from_slice(signature_bytes) {
        Ok(s) => s,
        Err(_) => return false,
    };
    vk.verify(message, &sig).is_ok()
}

// ─────────────────────────────────────────────────────────────────
// SIGNATURES OVER RECEIPTS
// ─────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignatureKind {
    Ed25519,
}

impl SignatureKind {
    fn wire_byte(self) -> u8 {
        match self {
            SignatureKind::Ed25519 => 0,
        }
    }

    fn from_wire_byte(b: u8) -> Result<Self, ReceiptError> {
        match b {
            0 => Ok(SignatureKind::Ed25519),
            other => Err(ReceiptError::Encoding(format!(
                "unknown signature kind byte {}",
                other
            ))),
        }
    }
}

/// A detached signature over a receipt payload.
/// `signer_id` is the registered identity of the signer (miner id or
/// coordinator id), NOT the public key — the verifier resolves the key
/// from its own trust set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub kind: SignatureKind,
    pub signer_id: String,
    /// hex-encoded detached signature bytes
    pub bytes: String,
}

/// A miner-signed receipt plus zero-or-more coordinator attestations.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReceiptEnvelope {
    pub payload: ReceiptPayload,
    pub miner_signature: Signature,
    #[serde(default)]
    pub attestations: Vec<Signature>,
}

impl ReceiptEnvelope {
    pub fn receipt_id(&self, chain_id: u64) -> String {
        self.payload.receipt_id(chain_id)
    }

    /// Canonical encoding of the full envelope (payload + signatures).
    /// Used when a receipt rides inside a transaction payload so the
    /// transaction hash commits to the signatures as well.
    pub fn canonical_encode(&self, chain_id: u64) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_bytes(&self.payload.canonical_encode(chain_id));
        encode_signature(&mut w, &self.miner_signature);
        w.put_u32(self.attestations.len() as u32);
        for att in &self.attestations {
            encode_signature(&mut w, att);
        }
        w.into_bytes()
    }

    pub fn decode(chain_id: u64, bytes: &[u8]) -> Result<Self, ReceiptError> {
        let mut r = WireReader::new(bytes);
        let payload_bytes = r.take_bytes()?;
        let payload = ReceiptPayload::decode(chain_id, &payload_bytes)?;
        let miner_signature = decode_signature(&mut r)?;
        let n = r.take_u32()?;
        let mut attestations = Vec::with_capacity(n as usize);
        for _ in 0..n {
            attestations.push(decode_signature(&mut r)?);
        }
        r.finish()?;
        Ok(ReceiptEnvelope {
            payload,
            miner_signature,
            attestations,
        })
    }
}

fn encode_signature(w: &mut WireWriter, sig: &Signature) {
    w.put_u8(sig.kind.wire_byte());
    w.put_str(&sig.signer_id);
    w.put_str(&sig.bytes);
}

fn decode_signature(r: &mut WireReader) -> Result<Signature, ReceiptError> {
    let kind = SignatureKind::from_wire_byte(r.take_u8()?)?;
    let signer_id = r.take_str()?;
    let bytes = r.take_str()?;
    Ok(Signature {
        kind,
        signer_id,
        bytes,
    })
}

// ─────────────────────────────────────────────────────────────────
// RECEIPT PAYLOAD
// ─────────────────────────────────────────────────────────────────

/// The signed body of a compute receipt.
/// All money/units are integer minor units — floats never enter the
/// hash or signature boundary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReceiptPayload {
    pub job_id: String,
    pub provider_id: String,
    pub client_id: String,
    pub compute_units: u64,
    pub unit_type: String,
    /// price per unit in minor units
    pub unit_price: u128,
    pub model: String,
    pub started_at: u64,
    pub completed_at: u64,
    /// hex hash of the job output
    pub result_hash: String,
}

impl ReceiptPayload {
    /// Deterministic canonical encoding: chain-id domain separation first
    /// (prevents cross-chain replay), then every field in schema order.
    /// Strings are length-prefixed UTF-8; integers are fixed-width
    /// little-endian.
    pub fn canonical_encode(&self, chain_id: u64) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u64(chain_id);
        w.put_str(&self.job_id);
        w.put_str(&self.provider_id);
        w.put_str(&self.client_id);
        w.put_u64(self.compute_units);
        w.put_str(&self.unit_type);
        w.put_u128(self.unit_price);
        w.put_str(&self.model);
        w.put_u64(self.started_at);
        w.put_u64(self.completed_at);
        w.put_str(&self.result_hash);
        w.into_bytes()
    }

    /// Total inverse of `canonical_encode`. Fails with `EncodingError`
    /// on malformed bytes or a chain-id mismatch.
    pub fn decode(chain_id: u64, bytes: &[u8]) -> Result<Self, ReceiptError> {
        let mut r = WireReader::new(bytes);
        let encoded_chain = r.take_u64()?;
        if encoded_chain != chain_id {
            return Err(ReceiptError::Encoding(format!(
                "chain id mismatch: encoded {} expected {}",
                encoded_chain, chain_id
            )));
        }
        let payload = ReceiptPayload {
            job_id: r.take_str()?,
            provider_id: r.take_str()?,
            client_id: r.take_str()?,
            compute_units: r.take_u64()?,
            unit_type: r.take_str()?,
            unit_price: r.take_u128()?,
            model: r.take_str()?,
            started_at: r.take_u64()?,
            completed_at: r.take_u64()?,
            result_hash: r.take_str()?,
        };
        r.finish()?;
        Ok(payload)
    }

    /// Content address: hex SHA-256 of the canonical encoding.
    /// Unique across the system; consumed at most once by the mint step.
    pub fn receipt_id(&self, chain_id: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_encode(chain_id));
        hex::encode(hasher.finalize())
    }

    /// Total reward for this receipt in minor units (units × unit price).
    /// None on u128 overflow — callers must reject such payloads.
    pub fn reward_amount(&self) -> Option<u128> {
        (self.compute_units as u128).checked_mul(self.unit_price)
    }
}

/// Sign a receipt payload. The message is the hex receipt_id — the
/// content address itself — so any field change invalidates the signature.
pub fn sign_payload(
    payload: &ReceiptPayload,
    chain_id: u64,
    signer_id: &str,
    secret_key: &[u8],
) -> Result<Signature, ReceiptError> {
    let msg = payload.receipt_id(chain_id);
    let sig_bytes = sign_message(msg.as_bytes(), secret_key)?;
    Ok(Signature {
        kind: SignatureKind::Ed25519,
        signer_id: signer_id.to_string(),
        bytes: hex::encode(sig_bytes),
    })
}

/// Verify a signature over a receipt payload against a trusted public key.
pub fn verify_payload(
    payload: &ReceiptPayload,
    chain_id: u64,
    signature: &Signature,
    trusted_pubkey: &[u8],
) -> Result<(), ReceiptError> {
    if trusted_pubkey.len() != PUBLIC_KEY_LEN {
        return Err(ReceiptError::InvalidKey(format!(
            "public key must be {} bytes, got {}",
            PUBLIC_KEY_LEN,
            trusted_pubkey.len()
        )));
    }
    let sig_bytes = hex::decode(&signature.bytes)
        .map_err(|e| ReceiptError::Encoding(format!("bad signature hex: {}", e)))?;
    let msg = payload.receipt_id(chain_id);
    if verify_message(msg.as_bytes(), &sig_bytes, trusted_pubkey) {
        Ok(())
    } else {
        Err(ReceiptError::SignatureInvalid)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ADDRESS DERIVATION MODULE (Base58Check Format)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Derive an AITBC address from an Ed25519 public key (Base58Check format)
///
/// Format: Base58(version_byte + BLAKE2b160(pubkey) + checksum)
/// - Version: 0x17 (23 = "AIT" identifier)
/// - Hash: BLAKE2b-160 (first 20 bytes of BLAKE2b-512)
/// - Checksum: First 4 bytes of SHA256(SHA256(version + hash))
/// - Result: "AIT" prefix + Base58 encoded payload
pub fn public_key_to_address(public_key_bytes: &[u8]) -> String {
    const VERSION_BYTE: u8 = 0x17; // 23 = "AIT" identifier

    let mut hasher = Blake2b512::new();
    hasher.update(public_key_bytes);
    let hash_result = hasher.finalize();
    let pubkey_hash = &hash_result[..20];

    let mut payload = vec![VERSION_BYTE];
    payload.extend_from_slice(pubkey_hash);

    let checksum_full = {
        let hash1 = Sha256::digest(&payload);
        Sha256::digest(hash1)
    };
    let checksum = &checksum_full[..4];

    let mut address_bytes = payload;
    address_bytes.extend_from_slice(checksum);

    format!("AIT{}", bs58::encode(&address_bytes).into_string())
}

/// Validate AITBC address format and checksum
///
/// Checks:
/// 1. Starts with "AIT" prefix
/// 2. Valid Base58 encoding
/// 3. Correct length (25 bytes decoded)
/// 4. Valid checksum
pub fn validate_address(address: &str) -> bool {
    if !address.starts_with("AIT") {
        return false;
    }

    let base58_part = &address[3..];
    let decoded = match bs58::decode(base58_part).into_vec() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    // 1 (version) + 20 (hash) + 4 (checksum)
    if decoded.len() != 25 {
        return false;
    }

    let payload = &decoded[..21];
    let checksum = &decoded[21..];

    let expected_checksum = {
        let hash1 = Sha256::digest(payload);
        Sha256::digest(hash1)
    };

    checksum == &expected_checksum[..4]
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN_ID: u64 = 7;

    fn sample_payload() -> ReceiptPayload {
        ReceiptPayload {
            job_id: "job-42".to_string(),
            provider_id: "miner-1".to_string(),
            client_id: "client-9".to_string(),
            compute_units: 1_500,
            unit_type: "token".to_string(),
            unit_price: 25,
            model: "llama3.2".to_string(),
            started_at: 1_700_000_000,
            completed_at: 1_700_000_030,
            result_hash: "ab".repeat(32),
        }
    }

    #[test]
    fn test_payload_roundtrip() {
        let payload = sample_payload();
        let encoded = payload.canonical_encode(CHAIN_ID);
        let decoded = ReceiptPayload::decode(CHAIN_ID, &encoded).unwrap();
        assert_eq!(payload, decoded);
    }

    #[test]
    fn test_decode_rejects_wrong_chain() {
        let payload = sample_payload();
        let encoded = payload.canonical_encode(CHAIN_ID);
        let err = ReceiptPayload::decode(CHAIN_ID + 1, &encoded).unwrap_err();
        assert!(matches!(err, ReceiptError::Encoding(_)));
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let payload = sample_payload();
        let encoded = payload.canonical_encode(CHAIN_ID);
        let err = ReceiptPayload::decode(CHAIN_ID, &encoded[..encoded.len() - 3]).unwrap_err();
        assert!(matches!(err, ReceiptError::Encoding(_)));
    }

    #[test]
    fn test_receipt_id_changes_with_any_field() {
        let base = sample_payload();
        let base_id = base.receipt_id(CHAIN_ID);

        let mut changed = base.clone();
        changed.compute_units += 1;
        assert_ne!(base_id, changed.receipt_id(CHAIN_ID));

        let mut changed = base.clone();
        changed.result_hash = "cd".repeat(32);
        assert_ne!(base_id, changed.receipt_id(CHAIN_ID));

        // Same payload on a different chain gets a different id (replay guard)
        assert_ne!(base_id, base.receipt_id(CHAIN_ID + 1));
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let keypair = generate_keypair();
        let payload = sample_payload();

        let sig = sign_payload(&payload, CHAIN_ID, "miner-1", &keypair.secret_key).unwrap();
        assert_eq!(sig.kind, SignatureKind::Ed25519);
        verify_payload(&payload, CHAIN_ID, &sig, &keypair.public_key).unwrap();
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let keypair = generate_keypair();
        let payload = sample_payload();
        let sig = sign_payload(&payload, CHAIN_ID, "miner-1", &keypair.secret_key).unwrap();

        let mut tampered = payload.clone();
        tampered.unit_price = 9_999;
        let err = verify_payload(&tampered, CHAIN_ID, &sig, &keypair.public_key).unwrap_err();
        assert_eq!(err, ReceiptError::SignatureInvalid);
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let signer = generate_keypair();
        let other = generate_keypair();
        let payload = sample_payload();
        let sig = sign_payload(&payload, CHAIN_ID, "miner-1", &signer.secret_key).unwrap();

        let err = verify_payload(&payload, CHAIN_ID, &sig, &other.public_key).unwrap_err();
        assert_eq!(err, ReceiptError::SignatureInvalid);
    }

    #[test]
    fn test_envelope_roundtrip() {
        let miner = generate_keypair();
        let coordinator = generate_keypair();
        let payload = sample_payload();

        let envelope = ReceiptEnvelope {
            miner_signature: sign_payload(&payload, CHAIN_ID, "miner-1", &miner.secret_key)
                .unwrap(),
            attestations: vec![sign_payload(
                &payload,
                CHAIN_ID,
                "coordinator",
                &coordinator.secret_key,
            )
            .unwrap()],
            payload,
        };

        let encoded = envelope.canonical_encode(CHAIN_ID);
        let decoded = ReceiptEnvelope::decode(CHAIN_ID, &encoded).unwrap();
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn test_deterministic_keypair_from_seed() {
        let seed = [42u8; 32];
        let a = keypair_from_secret(&seed).unwrap();
        let b = keypair_from_secret(&seed).unwrap();
        assert_eq!(a.public_key, b.public_key);
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn test_address_derivation_and_validation() {
        let keypair = generate_keypair();
        let address = keypair.address();
        assert!(address.starts_with("AIT"));
        assert!(validate_address(&address));

        // Flip one character in the Base58 body — checksum must fail
        let mut corrupted: Vec<char> = address.chars().collect();
        let last = corrupted.len() - 1;
        corrupted[last] = if corrupted[last] == '2' { '3' } else { '2' };
        let corrupted: String = corrupted.into_iter().collect();
        assert!(!validate_address(&corrupted));

        assert!(!validate_address("LOSnotours"));
        assert!(!validate_address("AIT"));
    }

    #[test]
    fn test_reward_amount_overflow() {
        let mut payload = sample_payload();
        payload.compute_units = u64::MAX;
        payload.unit_price = u128::MAX;
        assert!(payload.reward_amount().is_none());

        payload.compute_units = 100;
        payload.unit_price = 3;
        assert_eq!(payload.reward_amount(), Some(300));
    }
}
