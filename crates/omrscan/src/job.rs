//! Queue boundary: job records in, result records out.
//!
//! Jobs arrive as JSON lines; each produces exactly one result line. The
//! transport (stdin, a message queue consumer, ...) is up to the caller.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use crate::pipeline::Scanner;
use crate::result::{DetectionResult, ErrorEntry};

/// One scan request.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScanJob {
    pub scan_id: String,
    pub image_path: PathBuf,
    #[serde(alias = "template")]
    pub template_id: String,
}

/// Read the job's image and scan it. Never fails; problems become result errors.
pub fn run_job(scanner: &Scanner, job: &ScanJob) -> DetectionResult {
    tracing::info!(scan_id = %job.scan_id, path = %job.image_path.display(), "job received");
    match std::fs::read(&job.image_path) {
        Ok(bytes) => scanner.scan_bytes(&job.scan_id, &job.template_id, &bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(scan_id = %job.scan_id, "image not found");
            DetectionResult::failure(
                &job.scan_id,
                &job.template_id,
                ErrorEntry::new(
                    "IMAGE_NOT_FOUND",
                    format!("Image not found: {}", job.image_path.display()),
                    None,
                ),
            )
        }
        Err(e) => {
            tracing::error!(scan_id = %job.scan_id, error = %e, "image unreadable");
            DetectionResult::failure(
                &job.scan_id,
                &job.template_id,
                ErrorEntry::new(
                    "PIPELINE_ERROR",
                    format!("Failed to read {}: {e}", job.image_path.display()),
                    None,
                ),
            )
        }
    }
}

/// Counters reported when a job stream ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: usize,
    pub failed: usize,
}

fn invalid_record(message: String) -> DetectionResult {
    tracing::warn!(%message, "invalid job record");
    DetectionResult::failure("", "", ErrorEntry::new("PIPELINE_ERROR", message, None))
}

/// Parse one raw job line. `None` for blank lines; malformed records
/// (bad UTF-8 or JSON) become `PIPELINE_ERROR` results.
fn handle_record(scanner: &Scanner, raw: &[u8]) -> Option<DetectionResult> {
    let line = match std::str::from_utf8(raw) {
        Ok(line) => line.trim(),
        Err(e) => return Some(invalid_record(format!("Job record is not valid UTF-8: {e}"))),
    };
    if line.is_empty() {
        return None;
    }
    Some(match serde_json::from_str::<ScanJob>(line) {
        Ok(job) => run_job(scanner, &job),
        Err(e) => invalid_record(format!("Invalid job record: {e}")),
    })
}

/// Process JSON-lines jobs from `input` with `threads` workers sharing
/// `scanner`, writing one JSON result per line to `output`.
///
/// Results are written in completion order. Blank lines are skipped; a
/// malformed line yields an error record and the stream continues. Only
/// I/O failures on `input` or `output` end the run early.
pub fn run_worker<R, W>(
    scanner: &Scanner,
    input: R,
    output: W,
    threads: usize,
) -> std::io::Result<WorkerStats>
where
    R: BufRead + Send,
    W: Write + Send,
{
    let input = Mutex::new(input.split(b'\n'));
    let output = Mutex::new(output);
    let stats = Mutex::new(WorkerStats::default());

    std::thread::scope(|scope| -> std::io::Result<()> {
        let workers: Vec<_> = (0..threads.max(1))
            .map(|worker| {
                let (input, output, stats) = (&input, &output, &stats);
                scope.spawn(move || -> std::io::Result<()> {
                    loop {
                        let next = input.lock().unwrap_or_else(PoisonError::into_inner).next();
                        let raw = match next {
                            None => return Ok(()),
                            Some(raw) => raw?,
                        };
                        let Some(result) = handle_record(scanner, &raw) else {
                            continue;
                        };
                        tracing::debug!(worker, scan_id = %result.scan_id, "job done");
                        {
                            let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
                            s.processed += 1;
                            if !result.errors.is_empty() {
                                s.failed += 1;
                            }
                        }
                        let json = serde_json::to_string(&result)?;
                        let mut out = output.lock().unwrap_or_else(PoisonError::into_inner);
                        writeln!(out, "{json}")?;
                        out.flush()?;
                    }
                })
            })
            .collect();
        for w in workers {
            w.join()
                .map_err(|_| std::io::Error::other("worker thread panicked"))??;
        }
        Ok(())
    })?;

    let stats = stats.into_inner().unwrap_or_else(PoisonError::into_inner);
    tracing::info!(processed = stats.processed, failed = stats.failed, "job stream finished");
    Ok(stats)
}
