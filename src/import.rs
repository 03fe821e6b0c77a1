//! Signature import: re-locate exported patterns in a newer build.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::format::{escape_field, read_patterns, PatternRow};
use crate::pattern::{Pattern, PatternError};
use crate::scanner::Scanner;
use crate::{Address, SigError};

/// Default limit on how far a symbol may move between builds
pub const MAX_DISTANCE: u64 = 0x50000;

/// Everything an import run needs
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Updated binary image
    pub binary: PathBuf,
    /// Export output (`offset,name,pattern`)
    pub patterns: PathBuf,
    /// Destination for relocation lines
    pub output: PathBuf,
    /// Maps file offsets to logical addresses
    pub base_address: i64,
    /// Largest accepted distance from the old address
    pub max_distance: u64,
}

/// Why a pattern could not be re-located
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelocateError {
    /// The pattern text does not parse
    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] PatternError),

    /// No match anywhere in the image
    #[error("Pattern not found")]
    NotFound,

    /// Matches exist, but none close enough to the old address
    #[error("Pattern not found within range ({0} matches further away)")]
    OutOfRange(usize),

    /// More than one match within range
    #[error("Multiple results found")]
    Ambiguous(Vec<Address>),
}

/// A symbol's address in the old and in the new build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// Symbol name, as read from the pattern row
    pub name: String,
    /// Address in the build the pattern was made from
    pub offset: Address,
    /// Address of the unique nearby match in the new build
    pub address: Address,
}

impl fmt::Display for Relocation {
    /// Renders one import line: `OFFSET,name,NEWADDRESS`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X},{},{:X}", self.offset, escape_field(&self.name), self.address)
    }
}

/// Keep the candidates within `max_distance` of `offset`, in either direction.
pub fn filter_nearby(offset: Address, mut candidates: Vec<Address>, max_distance: u64) -> Vec<Address> {
    candidates.retain(|&candidate| candidate.abs_diff(offset) <= max_distance);
    candidates
}

/// Scan for one row's pattern and pick its unique nearby match
pub fn relocate(scanner: &Scanner, row: &PatternRow, max_distance: u64) -> Result<Relocation, RelocateError> {
    let pattern: Pattern = row.pattern.parse()?;
    let matches = scanner.find(&pattern);
    if matches.is_empty() {
        return Err(RelocateError::NotFound);
    }

    let total = matches.len();
    let mut nearby = filter_nearby(row.offset, matches, max_distance);
    match nearby.len() {
        0 => Err(RelocateError::OutOfRange(total)),
        1 => Ok(Relocation {
            name: row.name.clone(),
            offset: row.offset,
            address: nearby.remove(0),
        }),
        _ => Err(RelocateError::Ambiguous(nearby)),
    }
}

/// Relocate every row in parallel; results keep the input order
pub fn relocate_all(
    scanner: &Scanner,
    rows: &[PatternRow],
    max_distance: u64,
) -> Vec<Result<Relocation, RelocateError>> {
    rows.par_iter()
        .map(|row| relocate(scanner, row, max_distance))
        .collect()
}

/// Outcome of an import run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    /// Rows with exactly one match in range
    pub relocated: usize,
    /// Rows without a single match in range
    pub failed: usize,
    /// Rows read from the pattern file
    pub total: usize,
    /// Wall time of the scan, file I/O excluded
    pub elapsed: Duration,
}

impl fmt::Display for ImportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Relocated {}/{} signatures ({} failed)",
            self.relocated, self.total, self.failed
        )?;
        write!(f, "Time taken: {}ms", self.elapsed.as_millis())
    }
}

/// Load inputs, relocate every pattern and write the output file.
pub fn run(options: &ImportOptions) -> Result<ImportSummary, SigError> {
    let scanner = Scanner::open(&options.binary, options.base_address)?;
    log::info!(
        "Loaded {} bytes from {} (base {:#x})",
        scanner.len(),
        options.binary.display(),
        options.base_address
    );

    let rows = read_patterns(BufReader::new(File::open(&options.patterns)?));
    let mut output = BufWriter::new(File::create(&options.output)?);
    log::info!("Relocating {} patterns", rows.len());

    let start = Instant::now();
    let results = relocate_all(&scanner, &rows, options.max_distance);
    let elapsed = start.elapsed();

    let mut relocated = 0;
    for (row, result) in rows.iter().zip(results) {
        match result {
            Ok(relocation) => {
                writeln!(output, "{}", relocation)?;
                log::info!("Found: {:X} {} at {:X}", relocation.offset, relocation.name, relocation.address);
                relocated += 1;
            }
            Err(RelocateError::Ambiguous(candidates)) => {
                log::warn!(
                    "Multiple results found: {:X} {} ({} candidates)",
                    row.offset,
                    row.name,
                    candidates.len()
                );
            }
            Err(e) => log::warn!("{}: {:X} {}", e, row.offset, row.name),
        }
    }
    output.flush()?;

    Ok(ImportSummary {
        relocated,
        failed: rows.len() - relocated,
        total: rows.len(),
        elapsed,
    })
}
