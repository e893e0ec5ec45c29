//! The accessibility ref model: `refId -> (role, name, nth)`.
//!
//! A `RefTable` is rebuilt on every snapshot and invalidated wholesale on
//! navigation. Ids are never reused across rebuilds within the same table
//! generation, but the `(role, name, nth)` triple they resolve to is stable
//! as long as the underlying page hasn't navigated (see `SPEC_FULL.md` §4.8
//! "Ref stability within a page").

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Short identifier such as `"e7"`, assigned per snapshot to an interactive
/// accessibility node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefId(String);

impl RefId {
    pub fn from_counter(n: u32) -> Self {
        Self(format!("e{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix('e')?;
        if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        Some(Self(raw.to_string()))
    }
}

impl std::fmt::Display for RefId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// `{role, name, nth}` — uniquely identifies a node inside the current
/// accessibility tree. `nth` is the 0-based index among prior nodes sharing
/// the same `(role, name)` in traversal order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefInfo {
    pub role: String,
    pub name: String,
    pub nth: usize,
}

/// Map of `refId -> RefInfo` built from one accessibility snapshot pass.
#[derive(Debug, Clone, Default)]
pub struct RefTable {
    entries: HashMap<RefId, RefInfo>,
    next_counter: u32,
}

impl RefTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_counter: 1,
        }
    }

    /// Discard all refs. Called atomically before rebuilding on navigation.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_counter = 1;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Assign the next ref id to `(role, name, nth)` and record it.
    pub fn assign(&mut self, role: String, name: String, nth: usize) -> RefId {
        let id = RefId::from_counter(self.next_counter);
        self.next_counter += 1;
        self.entries.insert(id.clone(), RefInfo { role, name, nth });
        id
    }

    pub fn resolve(&self, id: &RefId) -> Option<&RefInfo> {
        self.entries.get(id)
    }

    pub fn valid_range_message(&self) -> String {
        if self.entries.is_empty() {
            "no refs available; take a fresh snapshot".to_string()
        } else {
            format!(
                "valid refs are e1..e{}; take a fresh snapshot, refs do not survive navigation",
                self.next_counter.saturating_sub(1)
            )
        }
    }
}
