use std::collections::BTreeMap;

use serde_json::Value as Json;

const FNV_OFFSET: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
const FNV_PRIME: u64 = 0x100000001b3;

/// 64-bit FNV-1a over a canonical byte stream. Stable across processes, so
/// hashes can be logged and compared between replicas.
#[derive(Debug, Clone, Copy)]
pub struct Fnv64(u64);

impl Default for Fnv64 {
    fn default() -> Self { Self::new() }
}

impl Fnv64 {
    pub fn new() -> Self { Fnv64(FNV_OFFSET) }

    pub fn finish(&self) -> u64 { self.0 }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for b in bytes { self.0 ^= *b as u64; self.0 = self.0.wrapping_mul(FNV_PRIME); }
    }

    pub fn write_u64(&mut self, v: u64) { self.write_bytes(&v.to_le_bytes()); }

    /// Length-prefixed so adjacent fields cannot run into each other.
    pub fn write_str(&mut self, s: &str) {
        self.write_u64(s.len() as u64);
        self.write_bytes(s.as_bytes());
    }

    pub fn write_map(&mut self, m: &BTreeMap<String, String>) {
        self.write_u64(m.len() as u64);
        for (k, v) in m { self.write_str(k); self.write_str(v); }
    }

    /// Object keys are visited in sorted order regardless of how the map
    /// preserves insertion order.
    pub fn write_json(&mut self, v: &Json) {
        match v {
            Json::Null => self.write_bytes(&[0]),
            Json::Bool(b) => self.write_bytes(&[1, *b as u8]),
            Json::Number(n) => { self.write_bytes(&[2]); self.write_str(&n.to_string()); }
            Json::String(s) => { self.write_bytes(&[3]); self.write_str(s); }
            Json::Array(items) => {
                self.write_bytes(&[4]);
                self.write_u64(items.len() as u64);
                for item in items { self.write_json(item); }
            }
            Json::Object(map) => {
                self.write_bytes(&[5]);
                self.write_u64(map.len() as u64);
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort_unstable();
                for k in keys {
                    self.write_str(k);
                    if let Some(child) = map.get(k) { self.write_json(child); }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_json(v: &Json) -> u64 {
        let mut h = Fnv64::new();
        h.write_json(v);
        h.finish()
    }

    #[test]
    fn object_key_order_does_not_matter() {
        let mut a = serde_json::Map::new();
        a.insert("b".into(), Json::from(1));
        a.insert("a".into(), Json::from(2));
        let mut b = serde_json::Map::new();
        b.insert("a".into(), Json::from(2));
        b.insert("b".into(), Json::from(1));
        assert_eq!(hash_json(&Json::Object(a)), hash_json(&Json::Object(b)));
    }

    #[test]
    fn adjacent_strings_are_delimited() {
        let mut x = Fnv64::new();
        x.write_str("ab");
        x.write_str("c");
        let mut y = Fnv64::new();
        y.write_str("a");
        y.write_str("bc");
        assert_ne!(x.finish(), y.finish());
    }

    #[test]
    fn type_tags_separate_lookalike_values() {
        assert_ne!(hash_json(&serde_json::json!("1")), hash_json(&serde_json::json!(1)));
        assert_ne!(hash_json(&serde_json::json!([])), hash_json(&serde_json::json!({})));
    }
}
