//! Brute-force masked pattern search over an immutable binary image.

use std::fs;
use std::path::Path;

use crate::pattern::{Pattern, PatternError, PatternToken};
use crate::{Address, SigError};

/// Outcome of a lookup that expects a single match
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Exactly one match
    Unique(Address),
    /// More than one match, in ascending order
    Ambiguous(Vec<Address>),
    /// No match at all
    NotFound,
}

impl From<Vec<Address>> for Lookup {
    fn from(mut results: Vec<Address>) -> Self {
        match results.len() {
            0 => Lookup::NotFound,
            1 => Lookup::Unique(results.remove(0)),
            _ => Lookup::Ambiguous(results),
        }
    }
}

/// Owns the binary image and maps buffer indices to logical addresses.
///
/// Index `i` lives at logical address `i + base_address`.
#[derive(Debug, Clone)]
pub struct Scanner {
    binary: Vec<u8>,
    base_address: i64,
}

impl Scanner {
    /// Wrap an in-memory image
    pub fn new(binary: Vec<u8>, base_address: i64) -> Self {
        Self { binary, base_address }
    }

    /// Read a whole file into a scanner
    pub fn open(path: impl AsRef<Path>, base_address: i64) -> Result<Self, SigError> {
        let binary = fs::read(path)?;
        Ok(Self::new(binary, base_address))
    }

    /// Image size in bytes
    pub fn len(&self) -> usize {
        self.binary.len()
    }

    /// Returns true for an empty image
    pub fn is_empty(&self) -> bool {
        self.binary.is_empty()
    }

    /// The signed base-address adjustment
    pub fn base_address(&self) -> i64 {
        self.base_address
    }

    /// Raw image bytes
    pub fn data(&self) -> &[u8] {
        &self.binary
    }

    fn address_of(&self, index: usize) -> Address {
        (index as i64).wrapping_add(self.base_address) as Address
    }

    fn index_of(&self, address: Address) -> Option<usize> {
        let index = (address as i64).checked_sub(self.base_address)?;
        usize::try_from(index).ok().filter(|&i| i < self.binary.len())
    }

    /// Up to `size` bytes starting at a logical address.
    ///
    /// Clamped to the end of the image; empty when the address is outside it.
    pub fn window(&self, address: Address, size: usize) -> &[u8] {
        match self.index_of(address) {
            Some(start) => {
                let end = start.saturating_add(size).min(self.binary.len());
                &self.binary[start..end]
            }
            None => &[],
        }
    }

    #[inline]
    fn matches_at(&self, index: usize, tokens: &[PatternToken]) -> bool {
        match self.binary.get(index..index + tokens.len()) {
            Some(window) => tokens.iter().zip(window).all(|(t, &b)| t.matches(b)),
            None => false,
        }
    }

    /// Every logical address where `tokens` matches, in ascending order.
    pub fn find(&self, tokens: &[PatternToken]) -> Vec<Address> {
        (0..self.binary.len())
            .filter(|&i| self.matches_at(i, tokens))
            .map(|i| self.address_of(i))
            .collect()
    }

    /// Parse `pattern` and scan for it
    pub fn find_str(&self, pattern: &str) -> Result<Vec<Address>, PatternError> {
        let pattern: Pattern = pattern.parse()?;
        Ok(self.find(&pattern))
    }

    /// Parse `pattern` and classify its matches
    pub fn find_one(&self, pattern: &str) -> Result<Lookup, PatternError> {
        self.find_str(pattern).map(Lookup::from)
    }

    /// Build an exact-byte pattern from `address` that matches only there.
    ///
    /// Bytes are appended one at a time until the pattern is unique. Returns
    /// `None` when `max_length` bytes (or the end of the image) are reached
    /// first.
    pub fn unique_pattern_from_address(&self, address: Address, max_length: usize) -> Option<Pattern> {
        let start = self.index_of(address)?;
        let mut pattern = Pattern::new();

        for &byte in self.binary[start..].iter().take(max_length) {
            pattern.push(PatternToken::exact(byte));
            if self.find(&pattern).len() == 1 {
                return Some(pattern);
            }
        }

        None
    }
}
