use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;

use schedtrace::driver::DriverConfig;
use schedtrace::report::CpuWeights;

/// Rewrites a systrace so every task has a start and end edge, and reports
/// per task cpu time and cycles plus per cpu frequency residency.
#[derive(Parser, Debug)]
#[command(about)]
struct Opts {
    /// Input trace, optionally gzipped or wrapped in html.
    input: PathBuf,

    /// Rewritten trace, also the prefix of the csv reports.
    #[arg(default_value = "schedtrace")]
    output: PathBuf,

    /// Comma separated per cpu weights, eg. "1,1,1,1,2.5,2.5,2.5,2.5".
    #[arg(short, long)]
    weights: Option<CpuWeights>,

    /// Stop reading the input after this many lines.
    #[arg(long)]
    max_lines: Option<u64>,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    info!("Input trace {}", opts.input.display());
    info!("Output trace {}", opts.output.display());
    if let Some(weights) = &opts.weights {
        info!("Cpu weights {:?}", weights);
    }

    let config = DriverConfig {
        max_lines: opts.max_lines,
        ..DriverConfig::for_path(&opts.input)
    };
    let analysis = schedtrace::analyze(&opts.input, &opts.output, opts.weights, config)?;

    info!("Wrote {}", analysis.sched_stats.display());
    info!("Wrote {}", analysis.freq_stats.display());
    Ok(())
}
