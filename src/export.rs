//! Signature export: synthesize a signature for every bound symbol.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::decoder;
use crate::dispatch::{ResultSink, RunStats, WorkerPool};
use crate::format::read_bindings;
use crate::scanner::Scanner;
use crate::synth::{SearchTask, Synthesizer};
use crate::{Architecture, SigError};

/// Everything an export run needs
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Binary image to scan
    pub binary: PathBuf,
    /// Bindings CSV (`name,address,size`)
    pub bindings: PathBuf,
    /// Destination for signature lines
    pub output: PathBuf,
    /// Maps file offsets to logical addresses
    pub base_address: i64,
    /// Instruction set of the binary
    pub architecture: Architecture,
    /// Worker count; 0 picks one per CPU
    pub threads: usize,
}

/// Counters and wall time of a finished run
#[derive(Debug)]
pub struct ExportSummary {
    /// Per-task outcome counters
    pub stats: RunStats,
    /// Wall time of synthesis, file I/O excluded
    pub elapsed: Duration,
}

impl fmt::Display for ExportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.stats)?;
        write!(f, "Time taken: {}ms", self.elapsed.as_millis())
    }
}

/// Run every task through `synth` on `pool`, writing each signature to `sink`.
///
/// Failures are logged and counted, never fatal.
pub fn synthesize_all<W: Write + Send>(
    synth: &Synthesizer<'_>,
    tasks: Vec<SearchTask>,
    pool: &WorkerPool,
    sink: &ResultSink<W>,
) -> RunStats {
    let stats = RunStats::default();

    pool.run(tasks, |task| match synth.find_signature(&task) {
        Ok(signature) => match sink.write_line(&signature.to_string()) {
            Ok(()) => stats.record_found(),
            Err(e) => {
                log::error!("Failed to write signature for {}: {}", task.name, e);
                stats.record_failed();
            }
        },
        Err(e) => {
            log::debug!("{}: {} (size: {})", task.name, e, task.size);
            stats.record_failed();
        }
    });

    stats
}

/// Load inputs, synthesize all signatures and write the output file.
pub fn run(options: &ExportOptions) -> Result<ExportSummary, SigError> {
    let scanner = Scanner::open(&options.binary, options.base_address)?;
    log::info!(
        "Loaded {} bytes from {} (base {:#x})",
        scanner.len(),
        options.binary.display(),
        options.base_address
    );

    let tasks = read_bindings(BufReader::new(File::open(&options.bindings)?))?;
    let sink = ResultSink::new(BufWriter::new(File::create(&options.output)?));

    let decoder = decoder::for_architecture(options.architecture);
    let synth = Synthesizer::new(&scanner, decoder.as_ref());
    let pool = match options.threads {
        0 => WorkerPool::default(),
        n => WorkerPool::new(n),
    };
    log::info!(
        "Synthesizing {} signatures for {} on {} threads",
        tasks.len(),
        options.architecture,
        pool.threads()
    );

    let start = Instant::now();
    let stats = synthesize_all(&synth, tasks, &pool, &sink);
    let elapsed = start.elapsed();

    sink.into_inner()?;
    Ok(ExportSummary { stats, elapsed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::X86Decoder;

    #[test]
    fn test_synthesize_all_counts_and_writes() {
        // f1: push rbp; mov rbp, rsp; mov eax, 1; ret
        // f2: push rbp; mov rbp, rsp; mov eax, 2; ret
        let mut binary = vec![0xCC; 0x40];
        binary[0x00..0x0A].copy_from_slice(&[0x55, 0x48, 0x89, 0xE5, 0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3]);
        binary[0x10..0x1A].copy_from_slice(&[0x55, 0x48, 0x89, 0xE5, 0xB8, 0x02, 0x00, 0x00, 0x00, 0xC3]);
        let scanner = Scanner::new(binary, 0x400);
        let decoder = X86Decoder::new(64);
        let synth = Synthesizer::new(&scanner, &decoder);

        let tasks = vec![
            SearchTask::new("f1", 0x400, 0x10),
            SearchTask::new("f2", 0x410, 0x10),
            SearchTask::new("pad", 0x420, 0x10),
        ];
        let sink = ResultSink::new(Vec::new());
        let stats = synthesize_all(&synth, tasks, &WorkerPool::new(2), &sink);

        assert_eq!(stats.to_string(), "Found 2/3 signatures (1 failed)");
        let text = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        let mut lines: Vec<&str> = text.lines().collect();
        lines.sort_unstable();
        assert_eq!(
            lines,
            vec![
                "0x400,f1,55 48 89 E5 B8 01 00 00 00",
                "0x410,f2,55 48 89 E5 B8 02 00 00 00",
            ]
        );
    }

    #[test]
    fn test_summary_display() {
        let summary = ExportSummary {
            stats: RunStats::default(),
            elapsed: Duration::from_millis(42),
        };
        assert_eq!(summary.to_string(), "Found 0/0 signatures (0 failed)\nTime taken: 42ms");
    }
}
