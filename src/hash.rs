use std::fmt::Debug;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ast::Args;

/// 32 bytes length generic hash
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    /// Fold several byte chunks into one hash. Chunk boundaries are part of
    /// the digest, so `["ab", "c"]` and `["a", "bc"]` don't collide.
    pub fn chain<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        hasher.finalize().into()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = vec![0u8; 64];

        for (i, &byte) in self.0.iter().enumerate() {
            acc[i * 2] = HEX[(byte >> 4) as usize];
            acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
        }

        String::from_utf8(acc).unwrap()
    }

    pub fn from_hex(text: &str) -> Option<Self> {
        if text.len() != 64 {
            return None;
        }

        let mut acc = [0u8; 32];
        for (i, chunk) in text.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            acc[i] = (hi * 16 + lo) as u8;
        }

        Some(Hash32(acc))
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Hash32::from_hex(&text).ok_or_else(|| D::Error::custom("invalid hex hash"))
    }
}

/// Stable identifier of a node, derived from its key and its argument set.
/// Args live in a `BTreeMap`, so the serialization is order-independent and
/// two constructions with the same key and args always agree.
pub fn hashid(key: &str, args: &Args) -> Hash32 {
    let canonical = serde_json::to_string(args).expect("args are valid JSON");
    Hash32::chain([key.as_bytes(), canonical.as_bytes()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let hash = Hash32::hash(b"kumihimo");
        assert_eq!(Hash32::from_hex(&hash.to_hex()), Some(hash));
    }

    #[test]
    fn chain_respects_boundaries() {
        let a = Hash32::chain([b"ab".as_slice(), b"c".as_slice()]);
        let b = Hash32::chain([b"a".as_slice(), b"bc".as_slice()]);
        assert_ne!(a, b);
    }

    #[test]
    fn hashid_is_insertion_order_independent() {
        let mut one = Args::new();
        one.insert("zeta".into(), serde_json::json!(1));
        one.insert("alpha".into(), serde_json::json!("x"));

        let mut two = Args::new();
        two.insert("alpha".into(), serde_json::json!("x"));
        two.insert("zeta".into(), serde_json::json!(1));

        assert_eq!(hashid("a.txt|f1", &one), hashid("a.txt|f1", &two));
        assert_ne!(hashid("a.txt|f1", &one), hashid("a.txt|f2", &one));
    }

    #[test]
    fn hashid_changes_with_args() {
        let empty = Args::new();
        let mut args = Args::new();
        args.insert("flag".into(), serde_json::json!(true));

        assert_ne!(hashid("a.txt", &empty), hashid("a.txt", &args));
    }
}
