//! Core IR, traits, and dispatch for the sigport signature engine.
//!
//! sigport derives short masked byte patterns that uniquely identify known
//! functions inside a raw binary, and later re-locates those patterns in an
//! updated build of the same binary. Instructions are decoded with iced-x86
//! (x86, x86-64) or Capstone (ARM64), and every byte that is likely to change
//! between builds is masked out before the pattern is scanned.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use sigport::{
//!     decoder,
//!     scanner::Scanner,
//!     synth::{SearchTask, Synthesizer},
//!     Architecture,
//! };
//!
//! // Load the binary; index 0 of the file lives at logical address 0x1000
//! let scanner = Scanner::open("path/to/binary", 0x1000).unwrap();
//!
//! // Create a decoder for the target architecture
//! let decoder = decoder::for_architecture(Architecture::X86_64);
//!
//! // Synthesize a signature for one known function
//! let synth = Synthesizer::new(&scanner, decoder.as_ref());
//! let task = SearchTask::new("main", 0x1400, 0x80);
//! if let Ok(signature) = synth.find_signature(&task) {
//!     println!("{}", signature);
//! }
//! ```

pub mod pattern;
pub mod scanner;
pub mod decoder;
pub mod mask;
pub mod synth;
pub mod dispatch;
pub mod format;
pub mod export;
pub mod import;

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use crate::pattern::PatternError;

/// Represents a logical (runtime) address
pub type Address = u64;

/// Maximum instruction size in bytes
pub const MAX_INSTRUCTION_SIZE: usize = 15;

/// Kind of field a byte range of an x86 instruction encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    /// Memory displacement (relocation dependent)
    Displacement,
    /// Immediate operand, including relative branch offsets
    Immediate,
    /// Prefixes, opcode, ModRM/SIB
    Other,
}

/// A byte range inside an x86 instruction tagged with the field it encodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Offset of the first byte within the instruction
    pub offset: usize,
    /// Number of bytes in the field
    pub size: usize,
    /// Field kind
    pub kind: SegmentKind,
}

impl Segment {
    /// Create a new segment
    pub fn new(offset: usize, size: usize, kind: SegmentKind) -> Self {
        Self { offset, size, kind }
    }

    /// Byte range covered by this segment
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.size
    }
}

/// Decoder-specific metadata carried by an [`Opcode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchDetail {
    /// x86-family field layout
    X86 {
        /// Byte ranges covering the whole instruction
        segments: Vec<Segment>,
    },
    /// ARM64: the 4-byte encoding lives in `Opcode::bytes`
    Arm64 {
        /// Operand text as printed by the decoder
        operands: String,
    },
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opcode {
    /// Address of the instruction
    pub address: Address,
    /// Size of the instruction in bytes
    pub length: u8,
    /// Raw bytes of the instruction
    pub bytes: Vec<u8>,
    /// Instruction mnemonic (e.g., "mov", "ldp")
    pub mnemonic: String,
    /// Full instruction text
    pub text: String,
    /// Architecture metadata used by the mask generator
    pub detail: ArchDetail,
}

impl Opcode {
    /// Returns true for a single-byte breakpoint trap (`int3`).
    ///
    /// Compilers pad between functions with these, so decoding stops there.
    pub fn is_breakpoint(&self) -> bool {
        self.length == 1 && self.mnemonic.eq_ignore_ascii_case("int3")
    }

    /// The little-endian encoding word of a 4-byte instruction
    pub fn word(&self) -> Option<u32> {
        let raw: [u8; 4] = self.bytes.as_slice().try_into().ok()?;
        Some(u32::from_le_bytes(raw))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}: {}", self.address, self.text)
    }
}

/// Decoder trait: architecture-specific disassembler.
pub trait Decoder: Send + Sync {
    /// Decode a single instruction at the start of `bytes`.
    ///
    /// # Arguments
    /// * `bytes` - Code bytes, starting at the instruction
    /// * `address` - Logical address of `bytes[0]`
    ///
    /// # Returns
    /// Some(Opcode) if an instruction was successfully decoded, None otherwise
    fn decode(&self, bytes: &[u8], address: Address) -> Option<Opcode>;

    /// Decode forward over the whole of `bytes`.
    ///
    /// Stops at the first undecodable instruction or at a breakpoint trap,
    /// neither of which is included. A short result is not an error.
    fn decode_all(&self, bytes: &[u8], address: Address) -> Vec<Opcode> {
        let mut opcodes = Vec::new();
        let mut offset = 0usize;

        while offset < bytes.len() {
            let Some(opcode) = self.decode(&bytes[offset..], address + offset as Address) else {
                break;
            };
            if opcode.is_breakpoint() || opcode.length == 0 {
                break;
            }
            offset += opcode.length as usize;
            opcodes.push(opcode);
        }

        opcodes
    }
}

/// Supported architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    /// 32-bit x86
    X86,
    /// 64-bit x86
    X86_64,
    /// ARM (32-bit), accepted but never decoded
    Arm32,
    /// AArch64 (ARM 64-bit)
    AArch64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86 => write!(f, "x86"),
            Architecture::X86_64 => write!(f, "x86-64"),
            Architecture::Arm32 => write!(f, "ARM"),
            Architecture::AArch64 => write!(f, "AArch64"),
        }
    }
}

impl FromStr for Architecture {
    type Err = SigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "x32" | "x86" => Ok(Architecture::X86),
            "x64" | "x86_64" | "x86-64" => Ok(Architecture::X86_64),
            "armv7" | "arm32" => Ok(Architecture::Arm32),
            "armv8" | "arm64" | "aarch64" => Ok(Architecture::AArch64),
            _ => Err(SigError::UnknownArchitecture(s.to_string())),
        }
    }
}

/// Parse a hexadecimal number with an optional sign and `0x` prefix.
///
/// Used for base addresses such as `0xC00` or `-0x10`.
pub fn parse_hex_i64(s: &str) -> Result<i64, SigError> {
    let trimmed = s.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);

    let value = i64::from_str_radix(digits, 16)
        .map_err(|_| SigError::InvalidNumber(s.to_string()))?;
    Ok(if negative { -value } else { value })
}

/// Parse an unsigned number written either in decimal or with a `0x` prefix.
pub fn parse_number(s: &str) -> Result<u64, SigError> {
    let trimmed = s.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse::<u64>(),
    };
    parsed.map_err(|_| SigError::InvalidNumber(s.to_string()))
}

/// Error type for setup-level failures
#[derive(Debug, thiserror::Error)]
pub enum SigError {
    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    /// Malformed pattern text
    #[error("Invalid pattern: {0}")]
    PatternError(#[from] PatternError),

    /// Unknown architecture name
    #[error("Invalid architecture: {0}")]
    UnknownArchitecture(String),

    /// Number that could not be parsed
    #[error("Invalid number: {0}")]
    InvalidNumber(String),

    /// Malformed bindings row
    #[error("Invalid line {line} in bindings file: {reason}")]
    InvalidBinding {
        /// 1-based line number in the bindings file
        line: u64,
        /// What was wrong with it
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x86_opcode(bytes: &[u8], mnemonic: &str) -> Opcode {
        Opcode {
            address: 0x1000,
            length: bytes.len() as u8,
            bytes: bytes.to_vec(),
            mnemonic: mnemonic.to_string(),
            text: mnemonic.to_string(),
            detail: ArchDetail::X86 {
                segments: vec![Segment::new(0, bytes.len(), SegmentKind::Other)],
            },
        }
    }

    struct ScriptedDecoder;

    impl Decoder for ScriptedDecoder {
        fn decode(&self, bytes: &[u8], address: Address) -> Option<Opcode> {
            match bytes.first()? {
                0xCC => Some(Opcode { address, ..x86_opcode(&[0xCC], "int3") }),
                0xFF => None,
                b => Some(Opcode { address, ..x86_opcode(&[*b], "nop") }),
            }
        }
    }

    #[test]
    fn test_breakpoint_detection() {
        assert!(x86_opcode(&[0xCC], "int3").is_breakpoint());
        assert!(!x86_opcode(&[0xCD, 0x03], "int").is_breakpoint());
        assert!(!x86_opcode(&[0x90], "nop").is_breakpoint());
    }

    #[test]
    fn test_decode_all_stops_at_breakpoint() {
        let opcodes = ScriptedDecoder.decode_all(&[0x90, 0x90, 0x90, 0xCC, 0x90], 0x400);
        assert_eq!(opcodes.len(), 3);
        assert_eq!(opcodes[2].address, 0x402);
    }

    #[test]
    fn test_decode_all_truncates_on_failure() {
        let opcodes = ScriptedDecoder.decode_all(&[0x90, 0xFF, 0x90], 0);
        assert_eq!(opcodes.len(), 1);
    }

    #[test]
    fn test_opcode_word() {
        let mut op = x86_opcode(&[0xC0, 0x03, 0x5F, 0xD6], "ret");
        assert_eq!(op.word(), Some(0xD65F03C0));
        op.bytes.pop();
        assert_eq!(op.word(), None);
    }

    #[test]
    fn test_architecture_names() {
        assert_eq!("x32".parse::<Architecture>().unwrap(), Architecture::X86);
        assert_eq!("x86".parse::<Architecture>().unwrap(), Architecture::X86);
        assert_eq!("x64".parse::<Architecture>().unwrap(), Architecture::X86_64);
        assert_eq!("x86_64".parse::<Architecture>().unwrap(), Architecture::X86_64);
        assert_eq!("armv7".parse::<Architecture>().unwrap(), Architecture::Arm32);
        assert_eq!("arm64".parse::<Architecture>().unwrap(), Architecture::AArch64);
        assert!(matches!(
            "mips".parse::<Architecture>(),
            Err(SigError::UnknownArchitecture(_))
        ));
    }

    #[test]
    fn test_parse_hex_i64() {
        assert_eq!(parse_hex_i64("-0xC00").unwrap(), -0xC00);
        assert_eq!(parse_hex_i64("0x1000").unwrap(), 0x1000);
        assert_eq!(parse_hex_i64("c00").unwrap(), 0xC00);
        assert_eq!(parse_hex_i64("+10").unwrap(), 0x10);
        assert!(parse_hex_i64("0xZZ").is_err());
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("4096").unwrap(), 4096);
        assert_eq!(parse_number("0x1000").unwrap(), 0x1000);
        assert!(parse_number("12ab").is_err());
    }
}
