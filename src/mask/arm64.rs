//! ARM64 masking table.
//!
//! Every mnemonic maps to one or more encoding forms. A form is recognised by
//! its fixed opcode bits (`mask`/`value`) and says which bits stay the same
//! for every operand choice (`keep`): register numbers, immediates, shift
//! amounts and PC-relative offsets are never kept. Encodings are
//! little-endian, so bit 0 lives in the first byte.
//!
//! Forms of one mnemonic must be disjoint, otherwise a sample could be masked
//! with the keep bits of a form it does not belong to.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use super::wildcards;
use crate::pattern::PatternToken;

/// One encoding form of a mnemonic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingForm {
    /// Human-readable form name
    pub name: &'static str,
    /// Bits that identify the form
    pub mask: u32,
    /// Required value of the identifying bits
    pub value: u32,
    /// Bits that are invariant across operands within this form
    pub keep: u32,
}

impl EncodingForm {
    const fn new(name: &'static str, mask: u32, value: u32, keep: u32) -> Self {
        Self { name, mask, value, keep }
    }

    /// Returns true if `word` is an encoding of this form
    pub fn accepts(&self, word: u32) -> bool {
        word & self.mask == self.value
    }

    /// Mask tokens for `word`, lowest byte first
    pub fn tokens(&self, word: u32) -> Vec<PatternToken> {
        word.to_le_bytes()
            .iter()
            .zip(self.keep.to_le_bytes())
            .map(|(&byte, mask)| PatternToken::with_mask(byte, mask))
            .collect()
    }
}

const ADD: &[EncodingForm] = &[
    EncodingForm::new("immediate", 0x7F80_0000, 0x1100_0000, 0xFF80_0000),
    EncodingForm::new("shifted register", 0x7F20_0000, 0x0B00_0000, 0xFF20_0000),
    EncodingForm::new("extended register", 0x7FE0_0000, 0x0B20_0000, 0xFFE0_0000),
];

const SUB: &[EncodingForm] = &[
    EncodingForm::new("immediate", 0x7F80_0000, 0x5100_0000, 0xFF80_0000),
    EncodingForm::new("shifted register", 0x7F20_0000, 0x4B00_0000, 0xFF20_0000),
    EncodingForm::new("extended register", 0x7FE0_0000, 0x4B20_0000, 0xFFE0_0000),
];

// SUBS with the zero register as destination
const CMP: &[EncodingForm] = &[
    EncodingForm::new("immediate", 0x7F80_001F, 0x7100_001F, 0xFF80_001F),
    EncodingForm::new("shifted register", 0x7F20_001F, 0x6B00_001F, 0xFF20_001F),
    EncodingForm::new("extended register", 0x7FE0_001F, 0x6B20_001F, 0xFFE0_001F),
];

const MOV: &[EncodingForm] = &[
    // ORR (shifted register) from the zero register, no shift
    EncodingForm::new("register", 0x7FE0_FFE0, 0x2A00_03E0, 0xFFE0_FFE0),
    // ADD (immediate) of zero, to or from SP
    EncodingForm::new("to/from sp", 0x7FFF_FC00, 0x1100_0000, 0xFFFF_FC00),
    // MOVZ
    EncodingForm::new("wide immediate", 0x7F80_0000, 0x5280_0000, 0xFF80_0000),
    // MOVN
    EncodingForm::new("inverted wide immediate", 0x7F80_0000, 0x1280_0000, 0xFF80_0000),
];

// Capstone prints ORR (immediate) as `orr` even when the source is the zero
// register, so the bitmask immediate lives here and not under `mov`.
const ORR: &[EncodingForm] = &[
    EncodingForm::new("bitmask immediate", 0x7F80_0000, 0x3200_0000, 0xFF80_0000),
    EncodingForm::new("shifted register", 0x7F20_0000, 0x2A00_0000, 0xFF20_0000),
];

const MOVK: &[EncodingForm] = &[EncodingForm::new("wide immediate", 0x7F80_0000, 0x7280_0000, 0xFF80_0000)];

const ADRP: &[EncodingForm] = &[EncodingForm::new("page", 0x9F00_0000, 0x9000_0000, 0x9F00_0000)];
const ADR: &[EncodingForm] = &[EncodingForm::new("pc-relative", 0x9F00_0000, 0x1000_0000, 0x9F00_0000)];

const B: &[EncodingForm] = &[EncodingForm::new("immediate", 0xFC00_0000, 0x1400_0000, 0xFC00_0000)];
const BL: &[EncodingForm] = &[EncodingForm::new("immediate", 0xFC00_0000, 0x9400_0000, 0xFC00_0000)];

const BR: &[EncodingForm] = &[EncodingForm::new("register", 0xFFFF_FC1F, 0xD61F_0000, 0xFFFF_FC1F)];
const BLR: &[EncodingForm] = &[EncodingForm::new("register", 0xFFFF_FC1F, 0xD63F_0000, 0xFFFF_FC1F)];
const RET: &[EncodingForm] = &[EncodingForm::new("register", 0xFFFF_FC1F, 0xD65F_0000, 0xFFFF_FC1F)];

const CBZ: &[EncodingForm] = &[EncodingForm::new("immediate", 0x7F00_0000, 0x3400_0000, 0xFF00_0000)];
const CBNZ: &[EncodingForm] = &[EncodingForm::new("immediate", 0x7F00_0000, 0x3500_0000, 0xFF00_0000)];

// The tested bit number is split across bit 31 and bits 23..19
const TBZ: &[EncodingForm] = &[EncodingForm::new("immediate", 0x7F00_0000, 0x3600_0000, 0x7F00_0000)];
const TBNZ: &[EncodingForm] = &[EncodingForm::new("immediate", 0x7F00_0000, 0x3700_0000, 0x7F00_0000)];

const LDR: &[EncodingForm] = &[
    EncodingForm::new("unsigned offset", 0x3B40_0000, 0x3940_0000, 0xFFC0_0000),
    EncodingForm::new("pre/post-index", 0x3B60_0400, 0x3840_0400, 0xFFE0_0C00),
    EncodingForm::new("register offset", 0x3B60_0C00, 0x3860_0800, 0xFFE0_0C00),
    EncodingForm::new("literal", 0x3B00_0000, 0x1800_0000, 0xFF00_0000),
];

const LDRB: &[EncodingForm] = &[
    EncodingForm::new("unsigned offset", 0x3B40_0000, 0x3940_0000, 0xFFC0_0000),
    EncodingForm::new("pre/post-index", 0x3B60_0400, 0x3840_0400, 0xFFE0_0C00),
    EncodingForm::new("register offset", 0x3B60_0C00, 0x3860_0800, 0xFFE0_0C00),
];

const STR: &[EncodingForm] = &[
    EncodingForm::new("unsigned offset", 0x3B40_0000, 0x3900_0000, 0xFFC0_0000),
    EncodingForm::new("pre/post-index", 0x3B60_0400, 0x3800_0400, 0xFFE0_0C00),
    EncodingForm::new("register offset", 0x3B60_0C00, 0x3820_0800, 0xFFE0_0C00),
];

const LDUR: &[EncodingForm] = &[EncodingForm::new("unscaled", 0x3B60_0C00, 0x3840_0000, 0xFFE0_0C00)];
const STUR: &[EncodingForm] = &[EncodingForm::new("unscaled", 0x3B60_0C00, 0x3800_0000, 0xFFE0_0C00)];

// Pre-index, post-index and signed offset share the layout; the index mode is kept
const LDP: &[EncodingForm] = &[EncodingForm::new("pair", 0x3A40_0000, 0x2840_0000, 0xFFC0_0000)];
const STP: &[EncodingForm] = &[EncodingForm::new("pair", 0x3A40_0000, 0x2800_0000, 0xFFC0_0000)];

const NOP: &[EncodingForm] = &[EncodingForm::new("hint", 0xFFFF_FFFF, 0xD503_201F, 0xFFFF_FFFF)];

/// `b.<cond>` mnemonics as Capstone prints them, with their condition codes
pub const CONDITIONS: &[(&str, u32)] = &[
    ("b.eq", 0x0),
    ("b.ne", 0x1),
    ("b.hs", 0x2),
    ("b.lo", 0x3),
    ("b.mi", 0x4),
    ("b.pl", 0x5),
    ("b.vs", 0x6),
    ("b.vc", 0x7),
    ("b.hi", 0x8),
    ("b.ls", 0x9),
    ("b.ge", 0xA),
    ("b.lt", 0xB),
    ("b.gt", 0xC),
    ("b.le", 0xD),
    ("b.al", 0xE),
    ("b.nv", 0xF),
];

static TABLE: Lazy<HashMap<&'static str, Vec<EncodingForm>>> = Lazy::new(|| {
    let fixed: &[(&'static str, &[EncodingForm])] = &[
        ("add", ADD),
        ("sub", SUB),
        ("cmp", CMP),
        ("mov", MOV),
        ("orr", ORR),
        ("movk", MOVK),
        ("adrp", ADRP),
        ("adr", ADR),
        ("b", B),
        ("bl", BL),
        ("br", BR),
        ("blr", BLR),
        ("ret", RET),
        ("cbz", CBZ),
        ("cbnz", CBNZ),
        ("tbz", TBZ),
        ("tbnz", TBNZ),
        ("ldr", LDR),
        ("ldrb", LDRB),
        ("str", STR),
        ("strb", STR),
        ("ldur", LDUR),
        ("stur", STUR),
        ("ldp", LDP),
        ("stp", STP),
        ("nop", NOP),
    ];

    let mut table: HashMap<&'static str, Vec<EncodingForm>> =
        fixed.iter().map(|(name, forms)| (*name, forms.to_vec())).collect();

    for &(name, cond) in CONDITIONS {
        table.insert(
            name,
            vec![EncodingForm::new("conditional", 0xFF00_001F, 0x5400_0000 | cond, 0xFF00_001F)],
        );
    }

    table
});

/// Every mnemonic the table knows about
pub fn mnemonics() -> impl Iterator<Item = &'static str> {
    TABLE.keys().copied()
}

/// All forms registered for a mnemonic
pub fn forms(mnemonic: &str) -> &'static [EncodingForm] {
    TABLE.get(mnemonic).map(Vec::as_slice).unwrap_or(&[])
}

/// The form of `mnemonic` that `word` is encoded in
pub fn lookup(mnemonic: &str, word: u32) -> Option<&'static EncodingForm> {
    forms(mnemonic).iter().find(|form| form.accepts(word))
}

/// Mask pattern for one ARM64 instruction.
///
/// Anything the table cannot place (unknown mnemonic, unexpected encoding,
/// length other than 4) becomes wildcards of the instruction's length.
pub fn safe_pattern(bytes: &[u8], mnemonic: &str) -> Vec<PatternToken> {
    let Ok(raw) = <[u8; 4]>::try_from(bytes) else {
        return wildcards(bytes.len());
    };
    let word = u32::from_le_bytes(raw);

    match lookup(&mnemonic.to_ascii_lowercase(), word) {
        Some(form) => form.tokens(word),
        None => {
            log::trace!("No mask form for {} ({:08x})", mnemonic, word);
            wildcards(bytes.len())
        }
    }
}
