// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PROPERTY-BASED TESTS — aitbc-receipt
//
// Invariants that MUST hold for ALL possible inputs. proptest generates
// thousands of random inputs per property.
//
// Run: cargo test --release -p aitbc-receipt --test prop_receipt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use aitbc_receipt::{
    keypair_from_secret, public_key_to_address, sign_payload, validate_address, verify_payload,
    ReceiptPayload,
};
use proptest::prelude::*;

fn arb_payload() -> impl Strategy<Value = ReceiptPayload> {
    (
        "[a-z0-9-]{1,40}",                   // job_id
        "[a-z0-9-]{1,40}",                   // provider_id
        "[a-z0-9-]{1,40}",                   // client_id
        any::<u64>(),                        // compute_units
        "[a-z]{1,16}",                       // unit_type
        any::<u128>(),                       // unit_price
        "[a-zA-Z0-9_.:-]{1,32}",             // model
        1_600_000_000u64..=2_000_000_000u64, // started_at
        1_600_000_000u64..=2_000_000_000u64, // completed_at
        "[0-9a-f]{64}",                      // result_hash
    )
        .prop_map(
            |(
                job_id,
                provider_id,
                client_id,
                compute_units,
                unit_type,
                unit_price,
                model,
                started_at,
                completed_at,
                result_hash,
            )| ReceiptPayload {
                job_id,
                provider_id,
                client_id,
                compute_units,
                unit_type,
                unit_price,
                model,
                started_at,
                completed_at,
                result_hash,
            },
        )
}

proptest! {
    /// decode(canonical_encode(x)) == x for every valid payload
    #[test]
    fn prop_roundtrip_encoding(payload in arb_payload(), chain_id in any::<u64>()) {
        let encoded = payload.canonical_encode(chain_id);
        let decoded = ReceiptPayload::decode(chain_id, &encoded).unwrap();
        prop_assert_eq!(payload, decoded);
    }

    /// receipt_id is stable: same payload always hashes to the same id
    #[test]
    fn prop_receipt_id_deterministic(payload in arb_payload(), chain_id in any::<u64>()) {
        prop_assert_eq!(payload.receipt_id(chain_id), payload.receipt_id(chain_id));
        prop_assert_eq!(payload.receipt_id(chain_id).len(), 64);
    }

    /// Two payloads differing in any one field get different ids
    #[test]
    fn prop_receipt_id_sensitive(payload in arb_payload(), chain_id in any::<u64>(), delta in 1u64..1000) {
        let mut changed = payload.clone();
        changed.started_at = changed.started_at.wrapping_add(delta);
        prop_assert_ne!(payload.receipt_id(chain_id), changed.receipt_id(chain_id));
    }

    /// sign → verify succeeds; verify under a different key fails
    #[test]
    fn prop_sign_verify(payload in arb_payload(), seed in any::<[u8; 32]>(), other_seed in any::<[u8; 32]>()) {
        prop_assume!(seed != other_seed);
        let chain_id = 2u64;
        let signer = keypair_from_secret(&seed).unwrap();
        let other = keypair_from_secret(&other_seed).unwrap();

        let sig = sign_payload(&payload, chain_id, "signer", &signer.secret_key).unwrap();
        prop_assert!(verify_payload(&payload, chain_id, &sig, &signer.public_key).is_ok());
        prop_assert!(verify_payload(&payload, chain_id, &sig, &other.public_key).is_err());
    }

    /// Every derived address validates; truncating it does not
    #[test]
    fn prop_address_validates(seed in any::<[u8; 32]>()) {
        let keypair = keypair_from_secret(&seed).unwrap();
        let address = public_key_to_address(&keypair.public_key);
        prop_assert!(address.starts_with("AIT"));
        prop_assert!(validate_address(&address));
        prop_assert!(!validate_address(&address[..address.len() - 2]));
    }

    /// Arbitrary garbage never decodes to a payload AND never panics
    #[test]
    fn prop_decode_garbage_is_total(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        // Any outcome is fine except a panic; most inputs must fail cleanly
        let _ = ReceiptPayload::decode(1, &bytes);
    }
}
