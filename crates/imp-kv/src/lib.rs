//! Ordered key-value envelope.
//!
//! `Kv` is an insertion-ordered map of string keys to typed values with a
//! deterministic byte serialization. The signed header inside a token (see
//! `imp-token`) is a `Kv`, so re-encoding the same logical contents must
//! always produce the same bytes — that's what the signature covers.

use std::collections::HashMap;
use thiserror::Error;

/// A value stored in a [`Kv`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvValue {
    Str(String),
    Int64(i64),
}

/// The type tag of a [`KvValue`], used by [`Kv::get_str`]/[`Kv::get_int64`]
/// to report a [`KvError::TypeMismatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvType {
    Str,
    Int64,
}

impl KvValue {
    fn kvtype(&self) -> KvType {
        match self {
            KvValue::Str(_) => KvType::Str,
            KvValue::Int64(_) => KvType::Int64,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("key {key} has type {actual:?}, expected {expected:?}")]
    TypeMismatch {
        key: String,
        expected: KvType,
        actual: KvType,
    },
    #[error("malformed kv encoding: {0}")]
    Encoding(String),
}

const TAG_STR: u8 = 0;
const TAG_INT64: u8 = 1;

/// An insertion-ordered `(key, value)` sequence with unique keys.
///
/// Insertion order is preserved across `put`, `encode`, and `decode` so that
/// serialization is deterministic: encoding twice from the same sequence of
/// `put` calls always yields the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Kv {
    order: Vec<String>,
    values: HashMap<String, KvValue>,
}

impl Kv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite `key`. Overwriting an existing key keeps its
    /// original position in the insertion order.
    pub fn put(&mut self, key: impl Into<String>, value: KvValue) {
        let key = key.into();
        if !self.values.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.values.insert(key, value);
    }

    pub fn put_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.put(key, KvValue::Str(value.into()));
    }

    pub fn put_int64(&mut self, key: impl Into<String>, value: i64) {
        self.put(key, KvValue::Int64(value));
    }

    pub fn get(&self, key: &str) -> Result<&KvValue, KvError> {
        self.values
            .get(key)
            .ok_or_else(|| KvError::NotFound(key.to_string()))
    }

    pub fn get_str(&self, key: &str) -> Result<&str, KvError> {
        match self.get(key)? {
            KvValue::Str(s) => Ok(s),
            other => Err(KvError::TypeMismatch {
                key: key.to_string(),
                expected: KvType::Str,
                actual: other.kvtype(),
            }),
        }
    }

    pub fn get_int64(&self, key: &str) -> Result<i64, KvError> {
        match self.get(key)? {
            KvValue::Int64(v) => Ok(*v),
            other => Err(KvError::TypeMismatch {
                key: key.to_string(),
                expected: KvType::Int64,
                actual: other.kvtype(),
            }),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &KvValue)> {
        self.order
            .iter()
            .map(move |k| (k.as_str(), self.values.get(k).expect("order/values desync")))
    }

    /// Deterministic byte serialization.
    ///
    /// Format: a sequence of records, one per entry in insertion order —
    /// `key_len:u32 LE | key bytes | type_tag:u8 | value bytes`, where a
    /// string value is `len:u32 LE | bytes` and an int64 value is 8 bytes
    /// little-endian.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, value) in self.iter() {
            let key_bytes = key.as_bytes();
            out.extend_from_slice(&(key_bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(key_bytes);
            match value {
                KvValue::Str(s) => {
                    out.push(TAG_STR);
                    let bytes = s.as_bytes();
                    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                    out.extend_from_slice(bytes);
                }
                KvValue::Int64(v) => {
                    out.push(TAG_INT64);
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
        out
    }

    /// Inverse of [`Kv::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Kv, KvError> {
        let mut kv = Kv::new();
        let mut pos = 0usize;
        while pos < bytes.len() {
            let key_len = read_u32(bytes, &mut pos)? as usize;
            let key_bytes = read_slice(bytes, &mut pos, key_len)?;
            let key = String::from_utf8(key_bytes.to_vec())
                .map_err(|_| KvError::Encoding("key is not valid utf-8".into()))?;
            let tag = read_u8(bytes, &mut pos)?;
            let value = match tag {
                TAG_STR => {
                    let len = read_u32(bytes, &mut pos)? as usize;
                    let raw = read_slice(bytes, &mut pos, len)?;
                    let s = String::from_utf8(raw.to_vec())
                        .map_err(|_| KvError::Encoding("string value is not valid utf-8".into()))?;
                    KvValue::Str(s)
                }
                TAG_INT64 => {
                    let raw = read_slice(bytes, &mut pos, 8)?;
                    KvValue::Int64(i64::from_le_bytes(raw.try_into().unwrap()))
                }
                other => return Err(KvError::Encoding(format!("unknown type tag {other}"))),
            };
            kv.put(key, value);
        }
        Ok(kv)
    }

    /// Extract entries whose key is `prefix` or `prefix.N` (N a non-negative
    /// integer index) into a fresh `Kv`, stripped of the prefix. Used to pull
    /// an encoded argv or a nested sub-object out of a flat `Kv`.
    #[must_use]
    pub fn split(&self, prefix: &str) -> Kv {
        let mut sub = Kv::new();
        let dotted = format!("{prefix}.");
        for (key, value) in self.iter() {
            if key == prefix {
                sub.put(String::new(), value.clone());
            } else if let Some(rest) = key.strip_prefix(&dotted) {
                sub.put(rest.to_string(), value.clone());
            }
        }
        sub
    }

    /// Inverse of [`Kv::split`]: re-namespace `sub`'s keys under `prefix` and
    /// merge them into `self`.
    pub fn join(&mut self, sub: &Kv, prefix: &str) {
        for (key, value) in sub.iter() {
            let joined = if key.is_empty() {
                prefix.to_string()
            } else {
                format!("{prefix}.{key}")
            };
            self.put(joined, value.clone());
        }
    }

    /// Encode an argv vector as a `Kv` under keys `argv.0, argv.1, ...` plus
    /// an `argv.count` entry, so it can ride alongside other fields inside a
    /// single flat `Kv` (e.g. across the privsep channel).
    #[must_use]
    pub fn encode_argv(args: &[String]) -> Kv {
        let mut kv = Kv::new();
        kv.put_int64("argv.count", args.len() as i64);
        for (i, arg) in args.iter().enumerate() {
            kv.put_str(format!("argv.{i}"), arg.clone());
        }
        kv
    }

    /// Inverse of [`Kv::encode_argv`].
    pub fn expand_argv(&self) -> Result<Vec<String>, KvError> {
        let count = self.get_int64("argv.count")?;
        if count < 0 {
            return Err(KvError::Encoding("negative argv.count".into()));
        }
        let mut args = Vec::with_capacity(count as usize);
        for i in 0..count {
            args.push(self.get_str(&format!("argv.{i}"))?.to_string());
        }
        Ok(args)
    }
}

fn read_u8(bytes: &[u8], pos: &mut usize) -> Result<u8, KvError> {
    let b = *bytes
        .get(*pos)
        .ok_or_else(|| KvError::Encoding("unexpected end of input".into()))?;
    *pos += 1;
    Ok(b)
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32, KvError> {
    let raw = read_slice(bytes, pos, 4)?;
    Ok(u32::from_le_bytes(raw.try_into().unwrap()))
}

fn read_slice<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], KvError> {
    let end = pos
        .checked_add(len)
        .ok_or_else(|| KvError::Encoding("length overflow".into()))?;
    if end > bytes.len() {
        return Err(KvError::Encoding("unexpected end of input".into()));
    }
    let slice = &bytes[*pos..end];
    *pos = end;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_mixed_types() {
        let mut kv = Kv::new();
        kv.put_int64("version", 1);
        kv.put_str("mechanism", "none");
        kv.put_int64("userid", 1000);
        let encoded = kv.encode();
        let decoded = Kv::decode(&encoded).unwrap();
        assert_eq!(decoded.get_int64("version").unwrap(), 1);
        assert_eq!(decoded.get_str("mechanism").unwrap(), "none");
        assert_eq!(decoded.get_int64("userid").unwrap(), 1000);
    }

    #[test]
    fn deterministic_encoding() {
        let mut a = Kv::new();
        a.put_int64("version", 1);
        a.put_str("mechanism", "munge");

        let mut b = Kv::new();
        b.put_int64("version", 1);
        b.put_str("mechanism", "munge");

        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn insertion_order_preserved_on_overwrite() {
        let mut kv = Kv::new();
        kv.put_int64("a", 1);
        kv.put_int64("b", 2);
        kv.put_int64("a", 3);
        let keys: Vec<&str> = kv.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(kv.get_int64("a").unwrap(), 3);
    }

    #[test]
    fn not_found_error() {
        let kv = Kv::new();
        assert_eq!(
            kv.get_str("missing").unwrap_err(),
            KvError::NotFound("missing".to_string())
        );
    }

    #[test]
    fn type_mismatch_error() {
        let mut kv = Kv::new();
        kv.put_int64("n", 5);
        assert!(matches!(
            kv.get_str("n").unwrap_err(),
            KvError::TypeMismatch { .. }
        ));
    }

    #[test]
    fn malformed_input_fails_decode() {
        let err = Kv::decode(&[0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, KvError::Encoding(_)));
    }

    #[test]
    fn split_and_join_round_trip() {
        let mut outer = Kv::new();
        outer.put_str("J", "token");
        outer.put_str("shell_path", "/bin/sh");
        outer.put_int64("args.count", 2);
        outer.put_str("args.0", "/bin/sh");
        outer.put_str("args.1", "-c");

        let args_sub = outer.split("args");
        assert_eq!(args_sub.get_int64("count").unwrap(), 2);
        assert_eq!(args_sub.get_str("0").unwrap(), "/bin/sh");

        let mut rebuilt = Kv::new();
        rebuilt.join(&args_sub, "args");
        assert_eq!(rebuilt.get_int64("args.count").unwrap(), 2);
        assert_eq!(rebuilt.get_str("args.1").unwrap(), "-c");
    }

    #[test]
    fn argv_round_trip() {
        let args = vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()];
        let kv = Kv::encode_argv(&args);
        assert_eq!(kv.expand_argv().unwrap(), args);
    }

    #[test]
    fn argv_round_trip_through_bytes() {
        let args = vec!["job-shell".to_string(), "arg0".to_string()];
        let kv = Kv::encode_argv(&args);
        let decoded = Kv::decode(&kv.encode()).unwrap();
        assert_eq!(decoded.expand_argv().unwrap(), args);
    }
}
