//! Subscription set for the feed connection
//!
//! Deduplicated set of symbol identifiers. The set itself is the source of
//! truth and survives reconnection; server acknowledgements only update the
//! advisory status attached to each entry.

use std::collections::HashMap;

/// Advisory acknowledgement status of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Not yet sent, or sent and waiting for confirmation
    Pending,
    /// Confirmed by the server
    Active,
    /// Server answered with `success: false`
    Failed,
}

/// Symbols the collaborators want to receive
#[derive(Debug, Default, Clone)]
pub struct SubscriptionSet {
    entries: HashMap<String, SubscriptionStatus>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a symbol. Returns `true` if it was not present before.
    pub fn insert(&mut self, symbol: &str) -> bool {
        if self.entries.contains_key(symbol) {
            return false;
        }
        self.entries
            .insert(symbol.to_owned(), SubscriptionStatus::Pending);
        true
    }

    /// Remove a symbol. Returns `true` if it was present.
    pub fn remove(&mut self, symbol: &str) -> bool {
        self.entries.remove(symbol).is_some()
    }

    #[inline]
    pub fn contains(&self, symbol: &str) -> bool {
        self.entries.contains_key(symbol)
    }

    /// Symbols to replay after a (re)connection, sorted for stable output.
    ///
    /// Every entry goes back to `Pending` since the new session has not
    /// acknowledged anything yet.
    pub fn begin_replay(&mut self) -> Vec<String> {
        for status in self.entries.values_mut() {
            *status = SubscriptionStatus::Pending;
        }
        self.symbols()
    }

    /// Record a server acknowledgement. Unknown symbols are ignored.
    pub fn acknowledge(&mut self, symbol: &str, success: bool) {
        if let Some(status) = self.entries.get_mut(symbol) {
            *status = if success {
                SubscriptionStatus::Active
            } else {
                SubscriptionStatus::Failed
            };
        }
    }

    pub fn status(&self, symbol: &str) -> Option<SubscriptionStatus> {
        self.entries.get(symbol).copied()
    }

    /// All symbols, sorted
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.entries.keys().cloned().collect();
        symbols.sort_unstable();
        symbols
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
