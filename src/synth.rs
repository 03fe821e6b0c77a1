//! Signature synthesis: grow a masked pattern instruction by instruction until
//! it matches exactly one location.

use std::fmt;

use crate::format::escape_field;
use crate::mask;
use crate::pattern::Pattern;
use crate::scanner::Scanner;
use crate::{Address, Decoder};

/// One symbol to synthesize a signature for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTask {
    /// Symbol name, copied into the output
    pub name: String,
    /// Logical start address of the symbol
    pub address: Address,
    /// Number of bytes available for decoding
    pub size: usize,
}

impl SearchTask {
    /// Create a new task
    pub fn new(name: impl Into<String>, address: Address, size: usize) -> Self {
        Self {
            name: name.into(),
            address,
            size,
        }
    }
}

/// A pattern that matches its symbol and nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Symbol name
    pub name: String,
    /// Address the pattern was synthesized at
    pub address: Address,
    /// Full pattern, trailing wildcards included
    pub pattern: Pattern,
}

impl fmt::Display for Signature {
    /// Renders one export line: `0xADDRESS,name,pattern`, quoting the name
    /// when it holds a comma or a quote
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:X},{},{}",
            self.address,
            escape_field(&self.name),
            self.pattern.to_signature_string()
        )
    }
}

/// Why a task produced no signature
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SearchFailure {
    /// Nothing decodable at the task address
    #[error("No instructions decoded")]
    NoInstructions,

    /// The pattern stopped matching anywhere, the symbol included
    #[error("Pattern not found after {instructions} instructions")]
    NotFound {
        /// Instructions appended when the match set emptied
        instructions: usize,
    },

    /// Decoded instructions ran out before the pattern became unique
    #[error("Pattern still matches {matches} locations after {instructions} instructions")]
    Ambiguous {
        /// Matches of the final pattern
        matches: usize,
        /// Instructions decoded
        instructions: usize,
    },
}

/// Drives decoder, mask generator and scanner for one task at a time.
///
/// Borrows everything; a single instance can be shared by every worker.
pub struct Synthesizer<'a> {
    scanner: &'a Scanner,
    decoder: &'a dyn Decoder,
}

impl<'a> Synthesizer<'a> {
    /// Create a synthesizer over a scanner and decoder
    pub fn new(scanner: &'a Scanner, decoder: &'a dyn Decoder) -> Self {
        Self { scanner, decoder }
    }

    /// Find the shortest instruction-aligned pattern that is unique in the image.
    pub fn find_signature(&self, task: &SearchTask) -> Result<Signature, SearchFailure> {
        let opcodes = self
            .decoder
            .decode_all(self.scanner.window(task.address, task.size), task.address);
        if opcodes.is_empty() {
            return Err(SearchFailure::NoInstructions);
        }

        let mut pattern = Pattern::new();
        let mut matches = 0;

        for (step, opcode) in opcodes.iter().enumerate() {
            pattern.extend(mask::safe_pattern(opcode));
            matches = self.scanner.find(&pattern).len();
            log::trace!("{}: {} -> {} matches", task.name, opcode, matches);

            match matches {
                0 => return Err(SearchFailure::NotFound { instructions: step + 1 }),
                1 => {
                    return Ok(Signature {
                        name: task.name.clone(),
                        address: task.address,
                        pattern,
                    })
                }
                _ => {}
            }
        }

        Err(SearchFailure::Ambiguous {
            matches,
            instructions: opcodes.len(),
        })
    }

    /// Match count after each appended instruction, without stopping at
    /// uniqueness.
    pub fn match_trace(&self, task: &SearchTask) -> Vec<usize> {
        let opcodes = self
            .decoder
            .decode_all(self.scanner.window(task.address, task.size), task.address);

        let mut pattern = Pattern::new();
        opcodes
            .iter()
            .map(|opcode| {
                pattern.extend(mask::safe_pattern(opcode));
                self.scanner.find(&pattern).len()
            })
            .collect()
    }
}
