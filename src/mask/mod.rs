//! Safe-pattern generation: which bytes of an instruction survive a rebuild.
//!
//! x86 masking is driven by the decoder's field segments, ARM64 masking by a
//! per-mnemonic table of encoding forms.

pub mod arm64;
pub mod x86;

use crate::pattern::PatternToken;
use crate::{ArchDetail, Opcode};

/// An all-wildcard run of `len` tokens
pub fn wildcards(len: usize) -> Vec<PatternToken> {
    vec![PatternToken::wildcard(); len]
}

/// The mask pattern for one decoded instruction.
///
/// Always exactly `opcode.bytes.len()` tokens long.
pub fn safe_pattern(opcode: &Opcode) -> Vec<PatternToken> {
    match &opcode.detail {
        ArchDetail::X86 { segments } => x86::safe_pattern(&opcode.bytes, segments),
        ArchDetail::Arm64 { .. } => arm64::safe_pattern(&opcode.bytes, &opcode.mnemonic),
    }
}
