use std::collections::HashSet;

/// Hands out short, unique table aliases for one statement.
///
/// An alias is the first letter of the table name, with a numeric suffix
/// once that letter is taken: `posts` -> `p`, `profiles` -> `p1`.
#[derive(Debug, Default, Clone)]
pub struct TableRegistry {
    taken: HashSet<String>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an alias for `table`.
    pub fn alias_for(&mut self, table: &str) -> String {
        let base: String = table
            .chars()
            .find(|c| c.is_ascii_alphabetic())
            .map(|c| c.to_ascii_lowercase().to_string())
            .unwrap_or_else(|| "t".to_string());

        let mut candidate = base.clone();
        let mut n = 1;
        while self.taken.contains(&candidate) {
            candidate = format!("{}{}", base, n);
            n += 1;
        }
        self.taken.insert(candidate.clone());
        candidate
    }

    /// Mark an externally chosen alias as used.
    pub fn reserve(&mut self, alias: &str) -> bool {
        self.taken.insert(alias.to_string())
    }

    pub fn is_taken(&self, alias: &str) -> bool {
        self.taken.contains(alias)
    }
}
