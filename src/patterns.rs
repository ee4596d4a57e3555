//! Ordered `(regex, category)` tables.
//!
//! The parser and the prompt detector both classify lines by running them
//! against a list of patterns in order; the first match wins.

use regex::Regex;

pub struct PatternEntry<C> {
    pub regex: Regex,
    pub category: C,
}

pub struct PatternTable<C> {
    entries: Vec<PatternEntry<C>>,
}

impl<C: Copy> PatternTable<C> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Build a table from built-in patterns. Entries that fail to compile are
    /// skipped with a warning.
    pub fn from_static(specs: &[(&str, C)]) -> Self {
        let mut table = Self::new();
        for (pattern, category) in specs {
            if let Err(e) = table.push(pattern, *category) {
                tracing::warn!("Skipping invalid built-in pattern {:?}: {}", pattern, e);
            }
        }
        table
    }

    pub fn push(&mut self, pattern: &str, category: C) -> Result<(), regex::Error> {
        let regex = Regex::new(pattern)?;
        self.entries.push(PatternEntry { regex, category });
        Ok(())
    }

    /// First entry whose pattern matches `text`.
    pub fn first_match(&self, text: &str) -> Option<&PatternEntry<C>> {
        self.entries.iter().find(|entry| entry.regex.is_match(text))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatternEntry<C>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<C: Copy> Default for PatternTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Kind {
        Digit,
        Word,
    }

    #[test]
    fn test_first_match_respects_order() {
        let table = PatternTable::from_static(&[(r"\d", Kind::Digit), (r"\w", Kind::Word)]);
        assert_eq!(table.first_match("a1").map(|e| e.category), Some(Kind::Digit));
        assert_eq!(table.first_match("ab").map(|e| e.category), Some(Kind::Word));
        assert!(table.first_match("--").is_none());
    }

    #[test]
    fn test_invalid_patterns_are_skipped() {
        let table = PatternTable::from_static(&[(r"(", Kind::Word), (r"x", Kind::Word)]);
        assert_eq!(table.len(), 1);

        let mut table = PatternTable::new();
        assert!(table.push("[", Kind::Digit).is_err());
        assert_eq!(table.len(), 0);
    }
}
