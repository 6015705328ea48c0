pub mod driver;
pub mod function;
pub mod report;
pub mod soc;
pub mod trace_line;

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::driver::{DriverConfig, TraceSummary};
use crate::report::CpuWeights;

#[derive(Debug)]
pub struct Analysis {
    pub summary: TraceSummary,
    pub sched_stats: PathBuf,
    pub freq_stats: PathBuf,
}

/// Rewrites the trace at `input` into `output` and writes both reports next
/// to it, using `output` as the file name prefix.
pub fn analyze(
    input: &Path,
    output: &Path,
    weights: Option<CpuWeights>,
    config: DriverConfig,
) -> Result<Analysis> {
    let outcome = driver::run_trace(input, output, config)?;
    let reports = report::write_reports(output, &outcome.soc, weights)?;
    Ok(Analysis {
        summary: outcome.summary,
        sched_stats: reports.sched_stats,
        freq_stats: reports.freq_stats,
    })
}
