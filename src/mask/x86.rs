//! x86 masking: wildcard displacement bytes, keep everything else.
//!
//! Immediates and relative branch offsets stay exact. They tend to survive
//! rebuilds and they make patterns much more selective.

use crate::pattern::PatternToken;
use crate::{Segment, SegmentKind};

/// Mask pattern for an x86 instruction given its field segments
pub fn safe_pattern(bytes: &[u8], segments: &[Segment]) -> Vec<PatternToken> {
    let mut pattern: Vec<PatternToken> = bytes.iter().copied().map(PatternToken::exact).collect();

    for segment in segments.iter().filter(|s| s.kind == SegmentKind::Displacement) {
        let end = segment.range().end.min(pattern.len());
        let start = segment.offset.min(end);
        for token in &mut pattern[start..end] {
            *token = PatternToken::wildcard();
        }
    }

    pattern
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::X86Decoder;
    use crate::{ArchDetail, Decoder};

    fn pattern_for(bytes: &[u8], bitness: u32) -> String {
        let opcode = X86Decoder::new(bitness).decode(bytes, 0x401000).unwrap();
        let ArchDetail::X86 { segments } = &opcode.detail else {
            panic!("expected x86 detail");
        };
        crate::pattern::render(&safe_pattern(&opcode.bytes, segments))
    }

    #[test]
    fn test_displacement_is_wildcarded() {
        // mov rax, [rip+0x12345678]
        assert_eq!(pattern_for(&[0x48, 0x8B, 0x05, 0x78, 0x56, 0x34, 0x12], 64), "48 8B 05 ? ? ? ?");
        // mov eax, [ebp-8]
        assert_eq!(pattern_for(&[0x8B, 0x45, 0xF8], 32), "8B 45 ?");
    }

    #[test]
    fn test_immediates_are_kept() {
        // mov eax, 0x10
        assert_eq!(pattern_for(&[0xB8, 0x10, 0x00, 0x00, 0x00], 32), "B8 10 00 00 00");
        // call rel32
        assert_eq!(pattern_for(&[0xE8, 0x10, 0x20, 0x30, 0x00], 64), "E8 10 20 30 00");
    }

    #[test]
    fn test_displacement_and_immediate() {
        // mov dword ptr [rbp-0x10], 0x2a
        assert_eq!(
            pattern_for(&[0xC7, 0x45, 0xF0, 0x2A, 0x00, 0x00, 0x00], 64),
            "C7 45 ? 2A 00 00 00"
        );
    }

    #[test]
    fn test_segments_out_of_range_are_clamped() {
        let segments = [Segment::new(2, 8, SegmentKind::Displacement)];
        let pattern = safe_pattern(&[0x8B, 0x45, 0xF8], &segments);
        assert_eq!(pattern.len(), 3);
        assert!(pattern[2].is_wildcard());
    }
}
