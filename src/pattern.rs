//! Masked byte tokens and the patterns built from them.
//!
//! Textual grammar: whitespace-separated tokens, `?` for a wildcard byte,
//! `XX` for an exact byte and `XX&MM` for a byte compared under a mask.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;

/// Errors produced while parsing pattern text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    /// A token that is not `?`, `XX` or `XX&MM`
    #[error("malformed token {token:?} at position {position}")]
    InvalidToken {
        /// The offending token text
        token: String,
        /// Zero-based token index
        position: usize,
    },
}

/// One pattern position: wildcard, exact byte, or byte under a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatternToken {
    is_wildcard: bool,
    byte: u8,
    mask: u8,
}

impl PatternToken {
    /// A token that matches any byte
    pub const fn wildcard() -> Self {
        Self { is_wildcard: true, byte: 0, mask: 0 }
    }

    /// A token that matches exactly `byte`
    pub const fn exact(byte: u8) -> Self {
        Self { is_wildcard: false, byte, mask: 0xFF }
    }

    /// A token that compares only the bits set in `mask`.
    ///
    /// A full mask becomes [`PatternToken::exact`], an empty one
    /// [`PatternToken::wildcard`].
    pub const fn with_mask(byte: u8, mask: u8) -> Self {
        match mask {
            0xFF => Self::exact(byte),
            0 => Self::wildcard(),
            _ => Self { is_wildcard: false, byte, mask },
        }
    }

    /// Returns true if `b` is accepted by this token
    #[inline]
    pub fn matches(&self, b: u8) -> bool {
        self.is_wildcard || (self.byte & self.mask) == (b & self.mask)
    }

    /// Returns true for a wildcard token
    pub fn is_wildcard(&self) -> bool {
        self.is_wildcard
    }

    /// The reference byte (meaningless for wildcards)
    pub fn byte(&self) -> u8 {
        self.byte
    }

    /// The comparison mask (meaningless for wildcards)
    pub fn mask(&self) -> u8 {
        self.mask
    }

    fn parse_at(token: &str, position: usize) -> Result<Self, PatternError> {
        let invalid = || PatternError::InvalidToken {
            token: token.to_string(),
            position,
        };

        if token == "?" || token == "??" {
            return Ok(Self::wildcard());
        }

        let (byte, mask) = match token.split_once('&') {
            Some((byte, mask)) => (byte, Some(mask)),
            None => (token, None),
        };

        let byte = parse_hex_byte(byte).ok_or_else(invalid)?;
        match mask {
            Some(mask) => Ok(Self::with_mask(byte, parse_hex_byte(mask).ok_or_else(invalid)?)),
            None => Ok(Self::exact(byte)),
        }
    }
}

fn parse_hex_byte(s: &str) -> Option<u8> {
    if s.len() != 2 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u8::from_str_radix(s, 16).ok()
}

impl fmt::Display for PatternToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wildcard {
            write!(f, "?")
        } else if self.mask != 0xFF {
            write!(f, "{:02X}&{:02X}", self.byte, self.mask)
        } else {
            write!(f, "{:02X}", self.byte)
        }
    }
}

impl FromStr for PatternToken {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_at(s.trim(), 0)
    }
}

/// An ordered run of tokens, aligned to consecutive buffer bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Pattern(Vec<PatternToken>);

impl Pattern {
    /// Create an empty pattern
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// A pattern of exact bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.iter().copied().map(PatternToken::exact).collect())
    }

    /// The tokens left after dropping trailing wildcards
    pub fn trimmed(&self) -> &[PatternToken] {
        let end = self
            .0
            .iter()
            .rposition(|t| !t.is_wildcard())
            .map_or(0, |i| i + 1);
        &self.0[..end]
    }

    /// Canonical signature text: tokens joined by spaces, trailing wildcards stripped
    pub fn to_signature_string(&self) -> String {
        render(self.trimmed())
    }

    /// Consume the pattern, returning its tokens
    pub fn into_tokens(self) -> Vec<PatternToken> {
        self.0
    }
}

/// Render tokens separated by single spaces
pub fn render(tokens: &[PatternToken]) -> String {
    tokens
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

impl Deref for Pattern {
    type Target = Vec<PatternToken>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Pattern {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<PatternToken>> for Pattern {
    fn from(tokens: Vec<PatternToken>) -> Self {
        Self(tokens)
    }
}

impl FromIterator<PatternToken> for Pattern {
    fn from_iter<I: IntoIterator<Item = PatternToken>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render(&self.0))
    }
}

impl FromStr for Pattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split_whitespace()
            .enumerate()
            .map(|(position, token)| PatternToken::parse_at(token, position))
            .collect()
    }
}
