//! sigport - portable function signatures for raw binaries
//!
//! Usage:
//!   sigport export <binary> <bindings> <output> <base>   Synthesize signatures
//!   sigport import <binary> <patterns> <output> <base>   Re-locate signatures
//!   sigport probe <binary> <address> <base>              Exact-byte unique pattern

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sigport::export::{self, ExportOptions};
use sigport::import::{self, ImportOptions};
use sigport::scanner::Scanner;
use sigport::{parse_hex_i64, Address, Architecture};

#[derive(Parser)]
#[command(name = "sigport")]
#[command(about = "Synthesize and re-locate masked function signatures", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesize a unique signature for every symbol in a bindings list
    Export {
        /// Binary image to scan
        binary: PathBuf,
        /// CSV with a header line, then `name,address,size` rows
        bindings: PathBuf,
        /// Output file for `0xADDRESS,name,pattern` lines
        output: PathBuf,
        /// Base address in hex, added to file offsets, e.g. 0xC00
        #[arg(allow_hyphen_values = true, value_parser = parse_base)]
        base: i64,
        /// Instruction set: x32, x64, armv7 or armv8
        #[arg(short, long, default_value = "x64", value_parser = parse_arch)]
        arch: Architecture,
        /// Worker threads (0 = one per CPU)
        #[arg(short, long, default_value = "0")]
        threads: usize,
    },
    /// Re-locate exported signatures in an updated binary
    Import {
        /// Updated binary image
        binary: PathBuf,
        /// Signature lines written by `export`
        patterns: PathBuf,
        /// Output file for `OFFSET,name,NEWADDRESS` lines
        output: PathBuf,
        /// Base address in hex, added to file offsets, e.g. 0xC00
        #[arg(allow_hyphen_values = true, value_parser = parse_base)]
        base: i64,
        /// Largest accepted move between builds, in hex
        #[arg(long, default_value = "0x50000", value_parser = parse_hex)]
        max_distance: u64,
    },
    /// Print the shortest exact-byte pattern that is unique at an address
    Probe {
        /// Binary image to scan
        binary: PathBuf,
        /// Logical address in hex
        #[arg(value_parser = parse_hex)]
        address: Address,
        /// Base address in hex, added to file offsets, e.g. 0xC00
        #[arg(allow_hyphen_values = true, value_parser = parse_base)]
        base: i64,
        /// Give up after this many bytes
        #[arg(short, long, default_value = "64")]
        max_length: usize,
    },
}

fn parse_base(s: &str) -> Result<i64, String> {
    parse_hex_i64(s).map_err(|e| e.to_string())
}

fn parse_hex(s: &str) -> Result<u64, String> {
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| e.to_string())
}

fn parse_arch(s: &str) -> Result<Architecture, String> {
    s.parse().map_err(|e: sigport::SigError| e.to_string())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Export {
            binary,
            bindings,
            output,
            base,
            arch,
            threads,
        } => {
            let options = ExportOptions {
                binary,
                bindings,
                output,
                base_address: base,
                architecture: arch,
                threads,
            };
            let summary = export::run(&options).with_context(|| {
                format!(
                    "Export failed for {} with bindings {}",
                    options.binary.display(),
                    options.bindings.display()
                )
            })?;
            println!("{}", summary);
        }
        Commands::Import {
            binary,
            patterns,
            output,
            base,
            max_distance,
        } => {
            let options = ImportOptions {
                binary,
                patterns,
                output,
                base_address: base,
                max_distance,
            };
            let summary = import::run(&options).with_context(|| {
                format!(
                    "Import failed for {} with patterns {}",
                    options.binary.display(),
                    options.patterns.display()
                )
            })?;
            println!("{}", summary);
        }
        Commands::Probe {
            binary,
            address,
            base,
            max_length,
        } => {
            let scanner = Scanner::open(&binary, base)
                .with_context(|| format!("Failed to read binary: {}", binary.display()))?;
            match scanner.unique_pattern_from_address(address, max_length) {
                Some(pattern) => println!("0x{:X},{}", address, pattern),
                None => bail!("No unique pattern within {} bytes of 0x{:X}", max_length, address),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_base_is_added_to_offsets() {
        let cli = Cli::try_parse_from(["sigport", "export", "a.bin", "b.csv", "out.csv", "0xC00"]).unwrap();
        let Commands::Export { base, .. } = cli.command else {
            panic!("expected export");
        };
        assert_eq!(base, 0xC00);

        // A negative base is still accepted as a value, not as a flag
        let cli = Cli::try_parse_from(["sigport", "import", "a.bin", "p.csv", "out.csv", "-0x10"]).unwrap();
        let Commands::Import { base, max_distance, .. } = cli.command else {
            panic!("expected import");
        };
        assert_eq!(base, -0x10);
        assert_eq!(max_distance, 0x50000);
    }
}
