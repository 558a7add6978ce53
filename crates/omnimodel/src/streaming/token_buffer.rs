//! Fixed-capacity ring of the most recent string tokens.

use std::collections::VecDeque;

pub struct TokenBuffer {
    tokens: VecDeque<String>,
    capacity: usize,
}

impl TokenBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { tokens: VecDeque::with_capacity(capacity), capacity }
    }

    /// Append a token, evicting exactly one oldest token once the buffer
    /// is beyond capacity.
    pub fn add(&mut self, token: impl Into<String>) {
        self.tokens.push_back(token.into());
        if self.tokens.len() > self.capacity {
            self.tokens.pop_front();
        }
    }

    /// Retained tokens concatenated in arrival order, no separator.
    pub fn text(&self) -> String {
        self.tokens.iter().map(String::as_str).collect()
    }

    /// The last `n` retained tokens, earliest-first. Fewer if the buffer
    /// holds fewer.
    pub fn last_n(&self, n: usize) -> Vec<String> {
        let start = self.tokens.len().saturating_sub(n);
        self.tokens.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_fifo_eviction() {
        let mut buf = TokenBuffer::new(5);
        for t in ["A", "B", "C", "D", "E", "F", "G"] {
            buf.add(t);
        }
        assert_eq!(buf.last_n(5), vec!["C", "D", "E", "F", "G"]);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_text_concatenates_in_arrival_order() {
        let mut buf = TokenBuffer::new(3);
        for t in ["A", "B", "C", "D"] {
            buf.add(t);
        }
        assert_eq!(buf.text(), "BCD");
    }

    #[test]
    fn test_last_n_shorter_than_requested() {
        let mut buf = TokenBuffer::new(10);
        buf.add("x");
        buf.add("y");
        assert_eq!(buf.last_n(5), vec!["x", "y"]);
    }

    #[test]
    fn test_clear_resets() {
        let mut buf = TokenBuffer::new(2);
        buf.add("a");
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.text(), "");
    }
}
