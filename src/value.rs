use std::fmt;

use futures::io::Result as IoResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
pub use serde_bencode::value::Value;

use crate::decode;
use crate::error::Result;

/// Convert any serializable type into a dynamic `Value`.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    Ok(serde_bencode::from_bytes(&serde_bencode::to_bytes(&value)?)?)
}

/// Convert a dynamic `Value` into `T`.
pub fn from_value<T: DeserializeOwned>(value: &Value) -> Result<T> {
    Ok(serde_bencode::from_bytes(&serde_bencode::to_bytes(value)?)?)
}

/// One encoded bencode value, kept exactly as it appeared on the wire.
///
/// Nothing is interpreted until [`RawValue::decode`] is called with a target
/// type, so identifiers and parameters can be stored and echoed back without
/// knowing their shape.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RawValue(Vec<u8>);

impl RawValue {
    /// Bytes captured by the decoder are already known to hold one value.
    pub(crate) fn from_encoded(bytes: Vec<u8>) -> Self {
        RawValue(bytes)
    }

    /// Wrap `bytes` after checking they hold exactly one bencode value.
    pub fn from_bytes(bytes: Vec<u8>) -> IoResult<Self> {
        decode::validate(&bytes)?;
        Ok(RawValue(bytes))
    }

    /// Encode any serializable value. Dictionary keys come out sorted.
    pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(RawValue(serde_bencode::to_bytes(&value)?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn to_value(&self) -> IoResult<Value> {
        decode::from_slice(&self.0)
    }

    /// Materialize the stored value as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_bencode::from_bytes(&self.0)?)
    }
}

impl fmt::Debug for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let escaped: String = self
            .0
            .iter()
            .flat_map(|b| std::ascii::escape_default(*b))
            .map(char::from)
            .collect();
        write!(f, "RawValue(b\"{}\")", escaped)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Error;
    use serde::Deserialize;
    use serde_bytes::ByteBuf;
    use std::collections::HashMap;

    #[test]
    fn raw_keeps_bytes_verbatim() {
        let raw = RawValue::from_bytes(b"d1:bi1e1:ai2ee".to_vec()).unwrap();
        assert_eq!(raw.as_bytes(), b"d1:bi1e1:ai2ee");
        // Unsorted keys are accepted
        let mut expected = HashMap::new();
        expected.insert(b"a".to_vec(), Value::Int(2));
        expected.insert(b"b".to_vec(), Value::Int(1));
        assert_eq!(raw.to_value().unwrap(), Value::Dict(expected));
    }

    #[test]
    fn raw_rejects_garbage() {
        assert!(RawValue::from_bytes(b"i1ei2e".to_vec()).is_err());
        assert!(RawValue::from_bytes(b"l".to_vec()).is_err());
        assert!(RawValue::from_bytes(Vec::new()).is_err());
    }

    #[test]
    fn raw_decode_reports_mismatch() {
        let raw = RawValue::serialize("seven").unwrap();
        assert_eq!(raw.as_bytes(), b"5:seven");
        assert_eq!(raw.decode::<String>().unwrap(), "seven");
        match raw.decode::<u64>() {
            Err(Error::Bencode(_)) => {}
            other => panic!("expected type mismatch, got {:?}", other),
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Packet {
        zeta: i64,
        #[serde(rename = "Alpha")]
        alpha: ByteBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
    }

    #[test]
    fn structs_are_sorted_dicts() {
        let packet = Packet {
            zeta: -3,
            alpha: ByteBuf::from(vec![0, 0xff]),
            tag: None,
        };
        let raw = RawValue::serialize(&packet).unwrap();
        assert_eq!(raw.as_bytes(), b"d5:Alpha2:\x00\xff4:zetai-3ee");
        assert_eq!(raw.decode::<Packet>().unwrap(), packet);

        let value = to_value(&packet).unwrap();
        assert_eq!(from_value::<Packet>(&value).unwrap(), packet);
    }

    #[test]
    fn debug_escapes() {
        let raw = RawValue::serialize(&ByteBuf::from(vec![b'a', 0])).unwrap();
        assert_eq!(format!("{:?}", raw), "RawValue(b\"2:a\\x00\")");
    }
}
