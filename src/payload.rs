//! MessagePack payload plumbing. Non-control frames carry self-describing
//! key/value maps encoded with MessagePack; this module wraps the encode and
//! decode paths and the field probing done by the router and the RPC layer.

use crate::net::support::{ErrorType, NetworkError};
use rmpv::Value;

/// Encode a payload object to MessagePack bytes.
#[inline]
pub fn to_bytes(value: &Value) -> Result<Vec<u8>, NetworkError> {
    rmp_serde::to_vec(value).map_err(|_| NetworkError::Fatal(ErrorType::Corrupt))
}

/// Decode MessagePack bytes into a payload object.
#[inline]
pub fn from_bytes(bytes: &[u8]) -> Result<Value, NetworkError> {
    if bytes.is_empty() {
        return Ok(Value::Map(Vec::new()));
    }

    rmp_serde::from_slice(bytes).map_err(|_| NetworkError::Fatal(ErrorType::Corrupt))
}

/// Build a map value from string keys.
#[inline]
pub fn map(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(key, value)| (Value::String(key.into()), value))
            .collect(),
    )
}

/// Look up a field in a map value.
#[inline]
pub fn get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value
        .as_map()?
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

#[inline]
pub fn get_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    get(value, key).and_then(Value::as_str)
}

#[inline]
pub fn get_u64(value: &Value, key: &str) -> Option<u64> {
    get(value, key).and_then(Value::as_u64)
}

#[inline]
pub fn get_i64(value: &Value, key: &str) -> Option<i64> {
    get(value, key).and_then(Value::as_i64)
}

#[inline]
pub fn get_bool(value: &Value, key: &str) -> Option<bool> {
    get(value, key).and_then(Value::as_bool)
}

#[inline]
pub fn get_map<'a>(value: &'a Value, key: &str) -> Option<&'a Vec<(Value, Value)>> {
    get(value, key).and_then(Value::as_map)
}

/// Empty map payload used by control frames.
#[inline]
pub fn empty() -> Value {
    Value::Map(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_builder_and_lookup() {
        let value = map(vec![
            ("name", Value::String("adder".into())),
            ("count", Value::from(42u64)),
            ("live", Value::Boolean(true)),
        ]);

        assert_eq!(get_str(&value, "name"), Some("adder"));
        assert_eq!(get_u64(&value, "count"), Some(42));
        assert_eq!(get_bool(&value, "live"), Some(true));
        assert_eq!(get(&value, "missing"), None);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let value = map(vec![
            ("method", Value::String("add".into())),
            (
                "params",
                map(vec![("a", Value::from(10)), ("b", Value::from(20))]),
            ),
        ]);

        let bytes = to_bytes(&value).unwrap();
        let back = from_bytes(&bytes).unwrap();

        assert_eq!(get_str(&back, "method"), Some("add"));
        let params = get(&back, "params").unwrap();
        assert_eq!(get_i64(params, "a"), Some(10));
        assert_eq!(get_i64(params, "b"), Some(20));
    }

    #[test]
    fn test_empty_bytes_decode_to_empty_map() {
        let value = from_bytes(&[]).unwrap();
        assert_eq!(value, empty());
    }

    #[test]
    fn test_nested_map_access() {
        let value = map(vec![("info", map(vec![("version", Value::String("1.0".into()))]))]);

        let info = get(&value, "info").unwrap();
        assert_eq!(get_str(info, "version"), Some("1.0"));
        assert!(get_map(&value, "info").is_some());
    }

    #[test]
    fn test_garbage_bytes_rejected() {
        // 0xc1 is never a valid MessagePack leading byte.
        let result = from_bytes(&[0xc1, 0x00]);
        assert_eq!(result.unwrap_err(), NetworkError::Fatal(ErrorType::Corrupt));
    }
}
