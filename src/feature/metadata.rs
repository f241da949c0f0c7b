//! Per-feature metadata value encoding: the metadata-value byte string is
//! tag-prefixed:
//! `{bool_false=0, bool_true=1, string=2, numeric=3 (8-byte double),
//! integer=4 (8-byte signed)}`.

const TAG_BOOL_FALSE: u8 = 0;
const TAG_BOOL_TRUE: u8 = 1;
const TAG_STRING: u8 = 2;
const TAG_NUMERIC: u8 = 3;
const TAG_INTEGER: u8 = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Bool(bool),
    String(String),
    Numeric(f64),
    Integer(i64),
}

impl MetaValue {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            MetaValue::Bool(false) => vec![TAG_BOOL_FALSE],
            MetaValue::Bool(true) => vec![TAG_BOOL_TRUE],
            MetaValue::String(s) => {
                let mut buf = Vec::with_capacity(1 + s.len());
                buf.push(TAG_STRING);
                buf.extend_from_slice(s.as_bytes());
                buf
            }
            MetaValue::Numeric(v) => {
                let mut buf = Vec::with_capacity(9);
                buf.push(TAG_NUMERIC);
                buf.extend_from_slice(&v.to_le_bytes());
                buf
            }
            MetaValue::Integer(v) => {
                let mut buf = Vec::with_capacity(9);
                buf.push(TAG_INTEGER);
                buf.extend_from_slice(&v.to_le_bytes());
                buf
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<MetaValue> {
        match bytes.first().copied() {
            Some(TAG_BOOL_FALSE) => Ok(MetaValue::Bool(false)),
            Some(TAG_BOOL_TRUE) => Ok(MetaValue::Bool(true)),
            Some(TAG_STRING) => Ok(MetaValue::String(
                std::str::from_utf8(&bytes[1..])
                    .map_err(|e| anyhow::anyhow!("metadata: invalid utf8: {e}"))?
                    .to_owned(),
            )),
            Some(TAG_NUMERIC) => {
                let arr: [u8; 8] = bytes[1..9]
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("metadata: truncated numeric value"))?;
                Ok(MetaValue::Numeric(f64::from_le_bytes(arr)))
            }
            Some(TAG_INTEGER) => {
                let arr: [u8; 8] = bytes[1..9]
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("metadata: truncated integer value"))?;
                Ok(MetaValue::Integer(i64::from_le_bytes(arr)))
            }
            Some(other) => anyhow::bail!("metadata: unknown value tag {other}"),
            None => anyhow::bail!("metadata: empty value"),
        }
    }
}

/// One ordered `(key, value)` metadata pair. `value` is the already
/// tag-prefixed encoded byte string, matching the shared-metadata
/// dictionary's key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MetaPair {
    pub key: String,
    pub value: Vec<u8>,
}

impl MetaPair {
    pub fn new(key: impl Into<String>, value: &MetaValue) -> Self {
        MetaPair {
            key: key.into(),
            value: value.encode(),
        }
    }

    pub fn decode_value(&self) -> anyhow::Result<MetaValue> {
        MetaValue::decode(&self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_variants() {
        for v in [
            MetaValue::Bool(true),
            MetaValue::Bool(false),
            MetaValue::String("highway".into()),
            MetaValue::Numeric(3.14159),
            MetaValue::Integer(-42),
        ] {
            let encoded = v.encode();
            assert_eq!(MetaValue::decode(&encoded).unwrap(), v);
        }
    }
}
