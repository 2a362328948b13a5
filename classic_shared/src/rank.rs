//! Rank records.

use serde::{Deserialize, Serialize};

/// A named permission tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rank {
    pub name: String,
    /// Chat color code, `0`-`9` or `a`-`f`.
    pub color: char,
    /// Higher is more trusted.
    pub permission_level: i32,
    /// Operators pass every world permission check.
    #[serde(default)]
    pub operator: bool,
}

impl Rank {
    pub fn new(name: &str, color: char, permission_level: i32, operator: bool) -> Self {
        Rank {
            name: name.to_string(),
            color,
            permission_level,
            operator,
        }
    }

    /// Whether this rank clears a world permission threshold.
    pub fn permits(&self, threshold: i32) -> bool {
        self.operator || self.permission_level >= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_ignores_threshold() {
        let guest = Rank::new("guest", '7', 0, false);
        let op = Rank::new("op", 'c', 0, true);
        assert!(guest.permits(0));
        assert!(!guest.permits(10));
        assert!(op.permits(i32::MAX));
    }
}
