//! Replication Tokens
//!
//! A token is the cursor into one remote replica's journal: the byte offset
//! up to which this node has pulled and applied that replica's entries.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Totally ordered cursor into a remote replica's journal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token(u64);

impl Token {
    pub const fn new(offset: u64) -> Self {
        Token(offset)
    }

    /// Token for a peer nothing has been pulled from yet
    pub const fn initial() -> Self {
        Token(0)
    }

    pub const fn offset(&self) -> u64 {
        self.0
    }

    pub const fn is_initial(&self) -> bool {
        self.0 == 0
    }

    /// Bytes between this token and a journal end
    pub fn lag_to(&self, log_end: u64) -> u64 {
        log_end.saturating_sub(self.0)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Single-writer, multi-reader token cell
///
/// Only the replica thread that owns the peer writes; the checkpoint manager
/// and metrics read concurrently.
#[derive(Debug, Default)]
pub struct TokenCell(AtomicU64);

impl TokenCell {
    pub fn new(token: Token) -> Self {
        TokenCell(AtomicU64::new(token.offset()))
    }

    pub fn load(&self) -> Token {
        Token(self.0.load(Ordering::Acquire))
    }

    /// Move the cursor forward. Returns the current token unchanged as the
    /// error when `next` is behind it.
    pub fn advance(&self, next: Token) -> std::result::Result<(), Token> {
        let current = self.load();
        if next < current {
            return Err(current);
        }
        self.0.store(next.offset(), Ordering::Release);
        Ok(())
    }

    /// Overwrite unconditionally (restore and re-bootstrap paths)
    pub fn reset(&self, token: Token) {
        self.0.store(token.offset(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_order_and_lag() {
        assert!(Token::new(10) > Token::initial());
        assert_eq!(Token::new(10).lag_to(25), 15);
        assert_eq!(Token::new(30).lag_to(25), 0);
    }

    #[test]
    fn test_cell_never_regresses() {
        let cell = TokenCell::new(Token::initial());
        cell.advance(Token::new(100)).unwrap();
        cell.advance(Token::new(100)).unwrap();
        assert_eq!(cell.advance(Token::new(50)), Err(Token::new(100)));
        assert_eq!(cell.load(), Token::new(100));

        cell.reset(Token::initial());
        assert!(cell.load().is_initial());
    }
}
