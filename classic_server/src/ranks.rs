//! Rank lookup.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use classic_shared::rank::Rank;

/// Color code given to ranks created on demand.
pub const DEFAULT_RANK_COLOR: char = '7';

#[derive(Debug, Default)]
pub struct RankRegistry {
    ranks: Mutex<HashMap<String, Rank>>,
}

impl RankRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Rank>> {
        self.ranks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers or replaces a rank.
    pub fn insert(&self, rank: Rank) {
        self.lock().insert(rank.name.clone(), rank);
    }

    pub fn get(&self, name: &str) -> Option<Rank> {
        self.lock().get(name).cloned()
    }

    /// Returns the named rank, creating it with permission level 0 and no
    /// operator flag if absent. The flag is true when it was created.
    pub fn ensure(&self, name: &str) -> (Rank, bool) {
        let mut ranks = self.lock();
        if let Some(rank) = ranks.get(name) {
            return (rank.clone(), false);
        }
        let rank = Rank::new(name, DEFAULT_RANK_COLOR, 0, false);
        ranks.insert(name.to_string(), rank.clone());
        (rank, true)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_creates_once() {
        let ranks = RankRegistry::new();
        let (guest, created) = ranks.ensure("guest");
        assert!(created);
        assert_eq!(guest.permission_level, 0);
        assert!(!guest.operator);

        let (_, created) = ranks.ensure("guest");
        assert!(!created);
        assert_eq!(ranks.len(), 1);
    }

    #[test]
    fn ensure_keeps_existing_rank() {
        let ranks = RankRegistry::new();
        ranks.insert(Rank::new("admin", 'c', 100, true));
        let (admin, created) = ranks.ensure("admin");
        assert!(!created);
        assert!(admin.operator);
        assert!(ranks.get("nobody").is_none());
    }
}
