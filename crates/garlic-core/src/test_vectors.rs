//! Wire-layout vectors for interop checks against other garlic implementations
//!
//! All fields are fixed (no random ids) so the encodings are byte-exact.

use crate::crypto::derive_iv;
use crate::garlic::{Clove, DeliveryInstruction, Garlic};
use crate::i2np::{I2npMessage, I2npPayload};
use crate::types::{IdentHash, TunnelId};
use serde::Serialize;

/// Test vector output format (JSON serializable)
#[derive(Serialize)]
pub struct TestVector {
    pub name: String,
    pub description: String,
    pub inputs: serde_json::Value,
    pub encoded_hex: String,
}

/// Generate all test vectors as JSON
pub fn generate_test_vectors() -> Vec<TestVector> {
    vec![
        single_clove_garlic_vector(),
        tunnel_instruction_vector(),
        iv_vector([0u8; 32]),
        iv_vector([0xab; 32]),
    ]
}

fn single_clove_garlic_vector() -> TestVector {
    let message = I2npMessage {
        message_id: 3,
        expiration: 4,
        payload: I2npPayload::DeliveryStatus {
            status_id: 1,
            timestamp: 2,
        },
    };
    let clove = Clove {
        instruction: DeliveryInstruction::local(),
        message,
        clove_id: 5,
        expiration: 6,
    };
    let garlic = Garlic {
        cloves: vec![clove],
        message_id: 7,
        expiration: 8,
    };

    TestVector {
        name: "single_local_clove".into(),
        description: "count | local instruction | delivery status | clove id | exp | cert | trailer".into(),
        inputs: serde_json::json!({
            "status_id": 1, "timestamp": 2,
            "i2np_message_id": 3, "i2np_expiration": 4,
            "clove_id": 5, "clove_expiration": 6,
            "garlic_message_id": 7, "garlic_expiration": 8,
        }),
        encoded_hex: hex::encode(garlic.to_bytes().unwrap_or_default()),
    }
}

fn tunnel_instruction_vector() -> TestVector {
    let instruction = DeliveryInstruction::tunnel(IdentHash([0x11; 32]), TunnelId(0x0102_0304));
    let mut buf = bytes::BytesMut::new();
    instruction.encode(&mut buf);

    TestVector {
        name: "tunnel_delivery_instruction".into(),
        description: "flag(type 3 << 5) | gateway hash | tunnel id".into(),
        inputs: serde_json::json!({
            "gateway_hex": hex::encode([0x11; 32]),
            "tunnel_id": 0x0102_0304u32,
        }),
        encoded_hex: hex::encode(&buf),
    }
}

fn iv_vector(seed: [u8; 32]) -> TestVector {
    TestVector {
        name: "iv_derivation".into(),
        description: "IV = SHA-256(seed)[0..16]".into(),
        inputs: serde_json::json!({ "seed_hex": hex::encode(seed) }),
        encoded_hex: hex::encode(derive_iv(&seed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_vectors() {
        let vectors = generate_test_vectors();
        assert_eq!(vectors.len(), 4);

        let json = serde_json::to_string_pretty(&vectors).unwrap();
        assert!(json.contains("single_local_clove"));
    }

    #[test]
    fn test_single_clove_garlic_bytes() {
        let v = single_clove_garlic_vector();
        assert_eq!(
            v.encoded_hex,
            concat!(
                "01",                                           // clove count
                "00",                                           // local delivery
                "0a", "00000003", "0000000000000004", "000c", "97", // i2np header
                "00000001", "0000000000000002",                 // delivery status
                "00000005", "0000000000000006", "000000",       // clove id, exp, cert
                "000000", "00000007", "0000000000000008",       // trailer
            )
        );
    }

    #[test]
    fn test_tunnel_instruction_bytes() {
        let v = tunnel_instruction_vector();
        assert_eq!(
            v.encoded_hex,
            format!("60{}01020304", "11".repeat(32))
        );
    }

    #[test]
    fn test_iv_vectors() {
        assert_eq!(iv_vector([0u8; 32]).encoded_hex, "66687aadf862bd776c8fc18b8e9f8e20");
        assert_eq!(iv_vector([0xab; 32]).encoded_hex, "9a2db2e23f1504cd056606553ac049c5");
    }
}
