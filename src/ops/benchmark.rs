//! Sequential vs. pipelined transfer timing
//!
//! Uploads the same file twice through the coordinator, first with one
//! chunk in flight and then with the configured pipeline depth, and
//! downloads it after each upload. Only wall-clock time is measured.

use crate::client::{Client, UploadParams};
use crate::common::{format_bytes, Error, Result};
use std::path::Path;
use std::time::{Duration, Instant};

/// Timing of one upload followed by one download
#[derive(Debug, Clone, Copy)]
pub struct TransferTiming {
    pub upload: Duration,
    pub download: Duration,
}

impl TransferTiming {
    pub fn total(&self) -> Duration {
        self.upload + self.download
    }
}

#[derive(Debug, Clone)]
pub struct BenchmarkReport {
    pub filename: String,
    pub bytes: u64,
    pub chunks: usize,
    pub sequential: TransferTiming,
    pub distributed: TransferTiming,
}

impl BenchmarkReport {
    pub fn sequential_secs(&self) -> f64 {
        self.sequential.total().as_secs_f64()
    }

    pub fn distributed_secs(&self) -> f64 {
        self.distributed.total().as_secs_f64()
    }

    /// Sequential time over distributed time; above 1.0 means pipelining helped
    pub fn speedup(&self) -> f64 {
        let distributed = self.distributed_secs();
        if distributed > 0.0 {
            self.sequential_secs() / distributed
        } else {
            0.0
        }
    }

    /// CSV rows in the order `mode,upload_s,download_s,total_s`
    pub fn to_csv(&self) -> String {
        let row = |mode: &str, t: &TransferTiming| {
            format!(
                "{},{:.3},{:.3},{:.3}\n",
                mode,
                t.upload.as_secs_f64(),
                t.download.as_secs_f64(),
                t.total().as_secs_f64()
            )
        };
        let mut out = String::from("mode,upload_s,download_s,total_s\n");
        out.push_str(&row("sequential", &self.sequential));
        out.push_str(&row("distributed", &self.distributed));
        out
    }
}

async fn timed_round(
    client: &Client,
    filename: &str,
    path: &Path,
    params: UploadParams,
    expected_bytes: u64,
) -> Result<(TransferTiming, usize)> {
    let started = Instant::now();
    let summary = client.upload_file(filename, path, params).await?;
    let upload = started.elapsed();

    let started = Instant::now();
    let report = client.download_to(filename, &mut tokio::io::sink()).await?;
    let download = started.elapsed();

    if report.bytes != expected_bytes {
        return Err(Error::Internal(format!(
            "downloaded {} bytes, expected {}",
            report.bytes, expected_bytes
        )));
    }
    Ok((TransferTiming { upload, download }, summary.chunk_count))
}

/// Time a sequential and a pipelined round trip of the file at `path`,
/// stored under `filename`.
pub async fn run_benchmark(client: &Client, path: &Path, filename: &str) -> Result<BenchmarkReport> {
    let bytes = tokio::fs::metadata(path).await?.len();
    tracing::info!(filename, size = %format_bytes(bytes), "starting benchmark");

    let (sequential, _) =
        timed_round(client, filename, path, UploadParams::sequential(), bytes).await?;
    tracing::info!(secs = sequential.total().as_secs_f64(), "sequential round done");

    let (distributed, chunks) =
        timed_round(client, filename, path, UploadParams::default(), bytes).await?;
    tracing::info!(secs = distributed.total().as_secs_f64(), "distributed round done");

    Ok(BenchmarkReport {
        filename: filename.to_string(),
        bytes,
        chunks,
        sequential,
        distributed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(seq_ms: u64, dist_ms: u64) -> BenchmarkReport {
        BenchmarkReport {
            filename: "f".into(),
            bytes: 10,
            chunks: 1,
            sequential: TransferTiming {
                upload: Duration::from_millis(seq_ms),
                download: Duration::ZERO,
            },
            distributed: TransferTiming {
                upload: Duration::from_millis(dist_ms),
                download: Duration::ZERO,
            },
        }
    }

    #[test]
    fn test_speedup() {
        assert!((report(2000, 1000).speedup() - 2.0).abs() < 1e-9);
        assert_eq!(report(2000, 0).speedup(), 0.0);
    }

    #[test]
    fn test_csv_layout() {
        let csv = report(1500, 500).to_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "mode,upload_s,download_s,total_s");
        assert_eq!(lines[1], "sequential,1.500,0.000,1.500");
        assert_eq!(lines[2], "distributed,0.500,0.000,0.500");
    }
}
