use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Insertion-ordered set of unique URLs with a hard capacity.
///
/// Dedup is exact string match (no normalization): `http://x` and
/// `https://x` are distinct on purpose. Once the cap is reached the set is
/// frozen and further inserts are no-ops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "UrlSetWire")]
pub struct UrlSet {
    cap: usize,
    ordered: Vec<String>,
    #[serde(skip)]
    seen: BTreeSet<String>,
}

/// Wire shape for [`UrlSet`]. Deserialization replays the listed URLs
/// through [`UrlSet::insert`], so the dedup mirror and the cap hold for
/// any input, not just values this crate produced.
#[derive(Deserialize)]
struct UrlSetWire {
    cap: usize,
    #[serde(default)]
    ordered: Vec<String>,
}

impl From<UrlSetWire> for UrlSet {
    fn from(wire: UrlSetWire) -> Self {
        let mut set = UrlSet::new(wire.cap);
        for url in &wire.ordered {
            if set.is_full() {
                break;
            }
            set.insert(url);
        }
        set
    }
}

impl UrlSet {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            ordered: Vec::new(),
            seen: BTreeSet::new(),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ordered.len() >= self.cap
    }

    /// Insert a URL; returns true only if it was admitted.
    ///
    /// Duplicates and inserts past the cap return false.
    pub fn insert(&mut self, url: &str) -> bool {
        if self.is_full() || self.seen.contains(url) {
            return false;
        }
        self.seen.insert(url.to_string());
        self.ordered.push(url.to_string());
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ordered.iter().map(|s| s.as_str())
    }

    pub fn as_slice(&self) -> &[String] {
        &self.ordered
    }

    pub fn into_vec(self) -> Vec<String> {
        self.ordered
    }
}
