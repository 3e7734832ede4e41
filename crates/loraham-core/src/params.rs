//! Packet parameter set.
//!
//! Symbol parameters are `key` or `key=value` tokens in the packet preamble.
//! Keys are case-sensitive as received. A naked key (no `=`) has the value
//! `None`, which is distinct from an empty value `Some("")`.

use std::collections::BTreeMap;

/// The symbol parameters of a packet, keyed by parameter name.
///
/// Entries are kept in key order, so iteration (and therefore protocol
/// dispatch) is deterministic regardless of the order they arrived in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: BTreeMap<String, Option<String>>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a parameter.
    pub fn put(&mut self, key: impl Into<String>, value: Option<String>) {
        self.entries.insert(key.into(), value);
    }

    /// Insert or replace a naked parameter (key without value).
    pub fn put_naked(&mut self, key: impl Into<String>) {
        self.put(key, None);
    }

    /// Whether `key` is present, naked or not.
    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Look up a parameter.
    ///
    /// The outer `Option` is presence; the inner one is the value, `None`
    /// for a naked key.
    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        self.entries.get(key).map(|v| v.as_deref())
    }

    /// Parameter keys in dispatch order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the canonical comma-separated form (`key` or `key=value`).
    pub fn serialize(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| match v {
                Some(v) => format!("{k}={v}"),
                None => k.clone(),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}
