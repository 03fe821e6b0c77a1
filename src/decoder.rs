//! Instruction decoders: iced-x86 for the x86 family, Capstone for ARM64.

use std::fmt;

use capstone::arch::arm64::ArchMode as Arm64Mode;
use capstone::prelude::BuildsCapstone;
use capstone::Capstone;
use iced_x86::{ConstantOffsets, DecoderOptions, Formatter, IntelFormatter, Mnemonic};

use crate::{Address, ArchDetail, Architecture, Decoder, Opcode, Segment, SegmentKind, MAX_INSTRUCTION_SIZE};

/// Errors that can occur while building a decoder
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    /// Capstone error
    #[error("Capstone error: {0}")]
    CapstoneError(#[from] capstone::Error),
}

thread_local! {
    // One Capstone handle per worker thread; handles are not shareable.
    static ARM64_ENGINE: Option<Capstone> = match Arm64Decoder::build() {
        Ok(cs) => Some(cs),
        Err(e) => {
            log::error!("Failed to initialize capstone: {}", e);
            None
        }
    };
}

/// Create the decoder for `arch`.
///
/// ARM32 is accepted but never decodes anything.
pub fn for_architecture(arch: Architecture) -> Box<dyn Decoder> {
    match arch {
        Architecture::X86 => Box::new(X86Decoder::new(32)),
        Architecture::X86_64 => Box::new(X86Decoder::new(64)),
        Architecture::AArch64 => Box::new(Arm64Decoder),
        Architecture::Arm32 => Box::new(NullDecoder),
    }
}

/// iced-x86 decoder for 32- or 64-bit code.
#[derive(Debug, Clone, Copy)]
pub struct X86Decoder {
    bitness: u32,
}

impl X86Decoder {
    /// Create a decoder for the given bitness (32 or 64)
    pub fn new(bitness: u32) -> Self {
        Self { bitness }
    }

    /// Decoder bitness
    pub fn bitness(&self) -> u32 {
        self.bitness
    }
}

/// Split an instruction of `length` bytes into tagged field segments.
fn segments_from_offsets(offsets: &ConstantOffsets, length: usize) -> Vec<Segment> {
    let mut fields = Vec::new();
    if offsets.has_displacement() {
        fields.push(Segment::new(
            offsets.displacement_offset(),
            offsets.displacement_size(),
            SegmentKind::Displacement,
        ));
    }
    if offsets.has_immediate() {
        fields.push(Segment::new(
            offsets.immediate_offset(),
            offsets.immediate_size(),
            SegmentKind::Immediate,
        ));
    }
    if offsets.has_immediate2() {
        fields.push(Segment::new(
            offsets.immediate_offset2(),
            offsets.immediate_size2(),
            SegmentKind::Immediate,
        ));
    }
    fields.sort_by_key(|s| s.offset);

    // Fill the gaps between fields with `Other` so the segments cover every byte
    let mut segments = Vec::with_capacity(fields.len() * 2 + 1);
    let mut at = 0;
    for field in fields {
        if field.offset > at {
            segments.push(Segment::new(at, field.offset - at, SegmentKind::Other));
        }
        at = field.offset + field.size;
        segments.push(field);
    }
    if at < length {
        segments.push(Segment::new(at, length - at, SegmentKind::Other));
    }
    segments
}

impl Decoder for X86Decoder {
    fn decode(&self, bytes: &[u8], address: Address) -> Option<Opcode> {
        let window = &bytes[..bytes.len().min(MAX_INSTRUCTION_SIZE)];
        let mut decoder = iced_x86::Decoder::with_ip(self.bitness, window, address, DecoderOptions::NONE);
        if !decoder.can_decode() {
            return None;
        }

        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return None;
        }

        let length = instruction.len();
        let offsets = decoder.get_constant_offsets(&instruction);

        let mut text = String::new();
        IntelFormatter::new().format(&instruction, &mut text);

        Some(Opcode {
            address,
            length: length as u8,
            bytes: window[..length].to_vec(),
            mnemonic: format!("{:?}", instruction.mnemonic()).to_lowercase(),
            text,
            detail: ArchDetail::X86 {
                segments: segments_from_offsets(&offsets, length),
            },
        })
    }

    fn decode_all(&self, bytes: &[u8], address: Address) -> Vec<Opcode> {
        let mut decoder = iced_x86::Decoder::with_ip(self.bitness, bytes, address, DecoderOptions::NONE);
        let mut formatter = IntelFormatter::new();
        let mut opcodes = Vec::new();

        while decoder.can_decode() {
            let start = decoder.position();
            let instruction = decoder.decode();
            if instruction.is_invalid() {
                log::debug!("Undecodable bytes at 0x{:x}", instruction.ip());
                break;
            }
            if instruction.mnemonic() == Mnemonic::Int3 && instruction.len() == 1 {
                break;
            }

            let length = instruction.len();
            let offsets = decoder.get_constant_offsets(&instruction);

            let mut text = String::new();
            formatter.format(&instruction, &mut text);

            opcodes.push(Opcode {
                address: instruction.ip(),
                length: length as u8,
                bytes: bytes[start..start + length].to_vec(),
                mnemonic: format!("{:?}", instruction.mnemonic()).to_lowercase(),
                text,
                detail: ArchDetail::X86 {
                    segments: segments_from_offsets(&offsets, length),
                },
            });
        }

        opcodes
    }
}

/// Capstone-based AArch64 decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct Arm64Decoder;

impl Arm64Decoder {
    /// Build an AArch64 Capstone handle
    pub fn build() -> Result<Capstone, DecoderError> {
        Ok(Capstone::new()
            .arm64()
            .mode(Arm64Mode::Arm)
            .detail(false)
            .build()?)
    }

    fn disassemble(bytes: &[u8], address: Address, count: Option<usize>) -> Vec<Opcode> {
        ARM64_ENGINE.with(|engine| {
            let Some(cs) = engine.as_ref() else {
                return Vec::new();
            };

            let result = match count {
                Some(count) => cs.disasm_count(bytes, address, count),
                None => cs.disasm_all(bytes, address),
            };
            let insns = match result {
                Ok(insns) => insns,
                Err(e) => {
                    log::debug!("Capstone failed at 0x{:x}: {}", address, e);
                    return Vec::new();
                }
            };

            insns
                .iter()
                .map(|i| {
                    let mnemonic = i.mnemonic().unwrap_or("").to_string();
                    let operands = i.op_str().unwrap_or("").to_string();
                    let text = if operands.is_empty() {
                        mnemonic.clone()
                    } else {
                        format!("{} {}", mnemonic, operands)
                    };
                    Opcode {
                        address: i.address(),
                        length: i.bytes().len() as u8,
                        bytes: i.bytes().to_vec(),
                        mnemonic,
                        text,
                        detail: ArchDetail::Arm64 { operands },
                    }
                })
                .collect()
        })
    }
}

impl Decoder for Arm64Decoder {
    fn decode(&self, bytes: &[u8], address: Address) -> Option<Opcode> {
        let window = &bytes[..bytes.len().min(4)];
        Self::disassemble(window, address, Some(1)).into_iter().next()
    }

    /// Disassembles the whole range in one Capstone call; Capstone stops at
    /// the first invalid encoding.
    fn decode_all(&self, bytes: &[u8], address: Address) -> Vec<Opcode> {
        Self::disassemble(bytes, address, None)
    }
}

/// Decoder for architectures that are accepted but not supported.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDecoder;

impl Decoder for NullDecoder {
    fn decode(&self, _bytes: &[u8], _address: Address) -> Option<Opcode> {
        None
    }
}

impl fmt::Display for X86Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X86Decoder({}-bit)", self.bitness)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(opcode: &Opcode) -> Vec<(usize, usize, SegmentKind)> {
        match &opcode.detail {
            ArchDetail::X86 { segments } => segments.iter().map(|s| (s.offset, s.size, s.kind)).collect(),
            other => panic!("expected x86 detail, got {:?}", other),
        }
    }

    #[test]
    fn test_x86_decode() {
        // mov eax, 1
        let bytes = [0xb8, 0x01, 0x00, 0x00, 0x00];
        let decoder = X86Decoder::new(32);

        let opcode = decoder.decode(&bytes, 0x1000).unwrap();
        assert_eq!(opcode.mnemonic, "mov");
        assert_eq!(opcode.length, 5);
        assert_eq!(opcode.bytes, bytes);
        assert_eq!(
            kinds(&opcode),
            vec![(0, 1, SegmentKind::Other), (1, 4, SegmentKind::Immediate)]
        );
    }

    #[test]
    fn test_x86_64_displacement_segment() {
        // mov rax, [rip+0x12345678]
        let bytes = [0x48, 0x8B, 0x05, 0x78, 0x56, 0x34, 0x12];
        let opcode = X86Decoder::new(64).decode(&bytes, 0x140001000).unwrap();
        assert_eq!(opcode.length, 7);
        assert_eq!(
            kinds(&opcode),
            vec![(0, 3, SegmentKind::Other), (3, 4, SegmentKind::Displacement)]
        );
    }

    #[test]
    fn test_x86_breakpoint_truncation() {
        // push rbp; mov rbp, rsp; nop; int3; ret
        let bytes = [0x55, 0x48, 0x89, 0xE5, 0x90, 0xCC, 0xC3];
        let opcodes = X86Decoder::new(64).decode_all(&bytes, 0x400);
        assert_eq!(opcodes.len(), 3);
        assert!(opcodes.iter().all(|o| !o.is_breakpoint()));
        assert_eq!(opcodes[2].address, 0x404);
    }

    #[test]
    fn test_x86_truncates_on_partial_instruction() {
        // nop; then the first two bytes of a 5-byte call
        let bytes = [0x90, 0xE8, 0x00];
        let opcodes = X86Decoder::new(64).decode_all(&bytes, 0);
        assert_eq!(opcodes.len(), 1);
    }

    #[test]
    fn test_default_decode_all_matches_batch() {
        let bytes = [0x55, 0x48, 0x89, 0xE5, 0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00, 0xCC];
        let decoder = X86Decoder::new(64);
        let batch = decoder.decode_all(&bytes, 0x10);

        let mut single = Vec::new();
        let mut at = 0;
        while let Some(op) = decoder.decode(&bytes[at..], 0x10 + at as Address) {
            if op.is_breakpoint() {
                break;
            }
            at += op.length as usize;
            single.push(op);
        }
        assert_eq!(batch, single);
    }

    #[test]
    fn test_arm64_decode() {
        // stp x29, x30, [sp, #-0x10]!; mov x29, sp; ret
        let bytes = [0xFD, 0x7B, 0xBF, 0xA9, 0xFD, 0x03, 0x00, 0x91, 0xC0, 0x03, 0x5F, 0xD6];
        let opcodes = Arm64Decoder.decode_all(&bytes, 0x1000);
        assert_eq!(opcodes.len(), 3);
        assert_eq!(opcodes[0].mnemonic, "stp");
        assert_eq!(opcodes[1].mnemonic, "mov");
        assert_eq!(opcodes[2].mnemonic, "ret");
        assert_eq!(opcodes[2].address, 0x1008);
        assert!(opcodes.iter().all(|o| o.length == 4));
    }

    #[test]
    fn test_arm64_single_decode() {
        let opcode = Arm64Decoder.decode(&[0xC0, 0x03, 0x5F, 0xD6, 0x00], 0x20).unwrap();
        assert_eq!(opcode.mnemonic, "ret");
        assert_eq!(opcode.word(), Some(0xD65F03C0));
    }

    #[test]
    fn test_arm32_decodes_nothing() {
        let decoder = for_architecture(Architecture::Arm32);
        assert!(decoder.decode_all(&[0x1E, 0xFF, 0x2F, 0xE1], 0).is_empty());
    }
}
