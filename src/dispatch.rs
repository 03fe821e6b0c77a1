//! Fixed-size worker pool, run counters and a shared line sink.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;

/// A pool of scoped worker threads draining one shared task stack.
///
/// Workers pop the most recently pushed task first. Order is not part of the
/// contract; callers only rely on every item being processed exactly once.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    threads: usize,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}

impl WorkerPool {
    /// Create a pool of `threads` workers (at least one)
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    /// Number of workers
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run `work` on every item and return once all workers have finished.
    ///
    /// Items are never cancelled; a worker only exits when the stack is empty.
    pub fn run<T, F>(&self, items: Vec<T>, work: F)
    where
        T: Send,
        F: Fn(T) + Sync,
    {
        let workers = self.threads.min(items.len());
        let stack = Mutex::new(items);
        log::debug!("Starting {} workers", workers);

        thread::scope(|scope| {
            for id in 0..workers {
                let stack = &stack;
                let work = &work;
                scope.spawn(move || {
                    let mut done = 0usize;
                    loop {
                        let Some(item) = stack.lock().pop() else {
                            break;
                        };
                        work(item);
                        done += 1;
                    }
                    log::trace!("Worker {} finished {} tasks", id, done);
                });
            }
        });
    }
}

/// Counters updated by workers and read once the run has joined.
///
/// `total` counts finished tasks, so it always equals `found + failed`.
#[derive(Debug, Default)]
pub struct RunStats {
    found: AtomicUsize,
    failed: AtomicUsize,
    total: AtomicUsize,
}

impl RunStats {
    /// Count a task that produced a signature
    pub fn record_found(&self) {
        self.found.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a task that ended without one
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Tasks that produced a signature so far
    pub fn found(&self) -> usize {
        self.found.load(Ordering::Relaxed)
    }

    /// Tasks that failed so far
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    /// Tasks finished so far, either way
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Found {}/{} signatures ({} failed)",
            self.found(),
            self.total(),
            self.failed()
        )
    }
}

/// A writer shared between workers; each line is written under one lock.
#[derive(Debug)]
pub struct ResultSink<W: Write> {
    inner: Mutex<W>,
}

impl<W: Write> ResultSink<W> {
    /// Wrap `writer` for use from several workers
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    /// Write `line` followed by a newline
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut writer = self.inner.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")
    }

    /// Flush and hand back the writer
    pub fn into_inner(self) -> io::Result<W> {
        let mut writer = self.inner.into_inner();
        writer.flush()?;
        Ok(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 0)]
    #[case(1, 50)]
    #[case(4, 3)]
    #[case(8, 500)]
    fn test_every_item_runs_once(#[case] threads: usize, #[case] count: usize) {
        let seen = Mutex::new(Vec::new());
        WorkerPool::new(threads).run((0..count).collect(), |i| seen.lock().push(i));

        let mut seen = seen.into_inner();
        seen.sort_unstable();
        assert_eq!(seen, (0..count).collect::<Vec<_>>());
    }

    #[test]
    fn test_single_worker_is_lifo() {
        let seen = Mutex::new(Vec::new());
        WorkerPool::new(1).run(vec![1, 2, 3], |i| seen.lock().push(i));
        assert_eq!(seen.into_inner(), vec![3, 2, 1]);
    }

    #[test]
    fn test_zero_threads_still_runs() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.threads(), 1);
        let count = AtomicUsize::new(0);
        pool.run(vec![(); 10], |_| {
            count.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(count.into_inner(), 10);
    }

    #[test]
    fn test_run_stats_summary() {
        let stats = RunStats::default();
        assert_eq!(stats.to_string(), "Found 0/0 signatures (0 failed)");

        WorkerPool::new(3).run((0..5).collect(), |i: i32| {
            if i % 2 == 0 {
                stats.record_found();
            } else {
                stats.record_failed();
            }
        });
        assert_eq!(stats.to_string(), "Found 3/5 signatures (2 failed)");
    }

    #[test]
    fn test_run_stats_total_tracks_finished_tasks() {
        let stats = RunStats::default();
        stats.record_found();
        assert_eq!((stats.found(), stats.failed(), stats.total()), (1, 0, 1));
        stats.record_failed();
        stats.record_failed();
        assert_eq!((stats.found(), stats.failed(), stats.total()), (1, 2, 3));
    }

    #[test]
    fn test_sink_lines_are_not_interleaved() {
        let sink = ResultSink::new(Vec::new());
        WorkerPool::new(4).run((0..200).collect(), |i: usize| {
            sink.write_line(&format!("line-{:03},{}", i, "x".repeat(64))).unwrap();
        });

        let text = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        let mut lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 200);
        lines.sort_unstable();
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(*line, format!("line-{:03},{}", i, "x".repeat(64)));
        }
    }
}
