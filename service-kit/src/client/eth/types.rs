use alloy_primitives::{Address, B256, Bytes, U256};
use num_bigint::BigInt;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Block reference for the pending block.
pub const PENDING_BLOCK: i64 = -1;
/// Block reference for the latest finalized block.
pub const FINALIZED_BLOCK: i64 = -3;
/// Block reference for the latest safe block.
pub const SAFE_BLOCK: i64 = -4;

/// Parameters of an `eth_call`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallMsg {
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub data: Bytes,
    pub value: Option<U256>,
    pub gas: u64,
    pub gas_price: Option<U256>,
}

impl CallMsg {
    pub fn new(to: Address, data: impl Into<Bytes>) -> Self {
        Self {
            to: Some(to),
            data: data.into(),
            ..Default::default()
        }
    }
}

/// JSON call object with only the fields that are set.
pub fn to_call_arg(msg: &CallMsg) -> Value {
    let mut arg = Map::new();
    if let Some(from) = msg.from {
        arg.insert("from".into(), Value::String(hex_address(&from)));
    }
    if let Some(to) = msg.to {
        arg.insert("to".into(), Value::String(hex_address(&to)));
    }
    if !msg.data.is_empty() {
        arg.insert("data".into(), Value::String(format!("0x{}", hex::encode(&msg.data))));
    }
    if let Some(value) = msg.value {
        arg.insert("value".into(), Value::String(format!("{value:#x}")));
    }
    if msg.gas != 0 {
        arg.insert("gas".into(), Value::String(format!("{:#x}", msg.gas)));
    }
    if let Some(gas_price) = msg.gas_price {
        arg.insert("gasPrice".into(), Value::String(format!("{gas_price:#x}")));
    }
    Value::Object(arg)
}

/// Block tag for a block reference. `None` means the latest block.
pub fn to_block_num_arg(block: Option<&BigInt>) -> String {
    let Some(block) = block else {
        return "latest".to_string();
    };
    if *block == BigInt::from(PENDING_BLOCK) {
        "pending".to_string()
    } else if *block == BigInt::from(FINALIZED_BLOCK) {
        "finalized".to_string()
    } else if *block == BigInt::from(SAFE_BLOCK) {
        "safe".to_string()
    } else {
        format!("{block:#x}")
    }
}

pub(crate) fn hex_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address))
}

pub(crate) fn hex_word(word: &B256) -> String {
    format!("0x{}", hex::encode(word))
}

pub(crate) fn decode_bytes(value: Value) -> Result<Bytes> {
    Ok(serde_json::from_value(value)?)
}

pub(crate) fn decode_quantity(value: &Value) -> Result<u64> {
    let digits = quantity_digits(value)?;
    u64::from_str_radix(digits, 16).map_err(|err| Error::Decode(format!("invalid quantity {value}: {err}")))
}

pub(crate) fn decode_u256(value: &Value) -> Result<U256> {
    let digits = quantity_digits(value)?;
    U256::from_str_radix(digits, 16).map_err(|err| Error::Decode(format!("invalid quantity {value}: {err}")))
}

fn quantity_digits(value: &Value) -> Result<&str> {
    value
        .as_str()
        .and_then(|s| s.strip_prefix("0x"))
        .filter(|digits| !digits.is_empty())
        .ok_or_else(|| Error::Decode(format!("expected hex quantity, got {value}")))
}

#[cfg(test)]
mod tests {
    use alloy_primitives::address;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_block_num_arg() {
        let cases = [
            (None, "latest"),
            (Some(BigInt::from(-1)), "pending"),
            (Some(BigInt::from(-3)), "finalized"),
            (Some(BigInt::from(-4)), "safe"),
            (Some(BigInt::from(12345)), "0x3039"),
            (Some(BigInt::from(0)), "0x0"),
        ];
        for (block, expected) in cases {
            assert_eq!(to_block_num_arg(block.as_ref()), expected);
        }
    }

    #[test]
    fn test_call_arg_skips_unset_fields() {
        let to = address!("c02aaa39b223fe8d0a0e5c4f27ead9083c756cc2");
        let msg = CallMsg::new(to, vec![0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(
            to_call_arg(&msg),
            json!({
                "to": "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2",
                "data": "0x70a08231",
            })
        );
    }

    #[test]
    fn test_call_arg_with_every_field() {
        let msg = CallMsg {
            from: Some(Address::ZERO),
            to: Some(Address::repeat_byte(0x11)),
            data: Bytes::from_static(&[0x01]),
            value: Some(U256::from(1_000u64)),
            gas: 21_000,
            gas_price: Some(U256::ZERO),
        };
        assert_eq!(
            to_call_arg(&msg),
            json!({
                "from": "0x0000000000000000000000000000000000000000",
                "to": "0x1111111111111111111111111111111111111111",
                "data": "0x01",
                "value": "0x3e8",
                "gas": "0x5208",
                "gasPrice": "0x0",
            })
        );
    }

    #[test]
    fn test_decoders() {
        assert_eq!(decode_quantity(&json!("0x10")).unwrap(), 16);
        assert_eq!(decode_u256(&json!("0xde0b6b3a7640000")).unwrap(), U256::from(10u64.pow(18)));
        assert_eq!(decode_bytes(json!("0x")).unwrap(), Bytes::new());
        assert_eq!(decode_bytes(json!("0xabcd")).unwrap(), Bytes::from_static(&[0xab, 0xcd]));
        assert!(matches!(decode_quantity(&json!("0x")), Err(Error::Decode(_))));
        assert!(matches!(decode_quantity(&json!(16)), Err(Error::Decode(_))));
    }
}
