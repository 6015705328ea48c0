use anyhow::{Context, Result, bail};
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::soc::{Soc, Task};

// Slack for the error accumulated adding up millions of slices
const PERCENT_TOLERANCE: f64 = 1e-6;

/// Per-cpu multipliers, so heterogeneous cores can be compared.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuWeights(Vec<f64>);

impl CpuWeights {
    pub fn uniform(num_cpus: usize) -> Self {
        CpuWeights(vec![1.0; num_cpus])
    }

    /// Uniform weights sized to the trace unless `weights` were given, which
    /// must then cover every cpu seen.
    pub fn resolve(weights: Option<CpuWeights>, soc: &Soc) -> Result<CpuWeights> {
        let num_cpus = soc.num_cpus();
        match weights {
            None => Ok(CpuWeights::uniform(num_cpus)),
            Some(weights) if weights.len() < num_cpus => bail!(
                "{} cpu weights given but the trace has {} cpus",
                weights.len(),
                num_cpus
            ),
            Some(weights) => Ok(weights),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, cpu: usize) -> f64 {
        self.0.get(cpu).copied().unwrap_or(0.0)
    }

    fn wsum(&self, values: &[f64]) -> f64 {
        values.iter().zip(&self.0).map(|(v, w)| v * w).sum()
    }
}

impl FromStr for CpuWeights {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let weights = s
            .split(',')
            .map(|w| {
                let w = w.trim();
                match w.parse::<f64>() {
                    Ok(weight) if weight.is_finite() && weight >= 0.0 => Ok(weight),
                    _ => Err(format!("invalid cpu weight {:?}", w)),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CpuWeights(weights))
    }
}

/// All the tasks sharing a comm, folded into one report row.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedTask {
    pub comm: String,
    pub tgid_name: String,
    pub npids: u32,
    pub seconds: Vec<f64>,
    pub cycles: Vec<f64>,
}

fn display_comm(task: &Task) -> String {
    // One idle task per cpu, called swapper/0 for cpu 0, etc
    match task.comm.strip_prefix("swapper/") {
        Some(cpu) if task.pid == 0 => format!("IDLE CPU {}", cpu),
        _ => task.comm.clone(),
    }
}

fn display_tgid(task: &Task) -> String {
    match (task.tgid, &task.tgid_name) {
        (Some(tgid), _) if tgid == task.pid => String::new(),
        (_, Some(name)) => name.clone(),
        (Some(0), None) | (None, None) => String::new(),
        (Some(tgid), None) => tgid.to_string(),
    }
}

pub fn group_tasks(soc: &Soc, num_cpus: usize) -> Vec<GroupedTask> {
    let mut groups: BTreeMap<&str, GroupedTask> = BTreeMap::new();
    for task in soc.tasks() {
        let tgid_name = display_tgid(task);
        let group = groups
            .entry(task.comm.as_str())
            .or_insert_with(|| GroupedTask {
                comm: display_comm(task),
                tgid_name: tgid_name.clone(),
                npids: 0,
                seconds: vec![0.0; num_cpus],
                cycles: vec![0.0; num_cpus],
            });

        // Tasks of this name live in different thread groups
        if group.tgid_name != tgid_name {
            group.tgid_name.clear();
        }
        for (&cpu, &seconds) in task.seconds() {
            if let Some(total) = group.seconds.get_mut(cpu as usize) {
                *total += seconds;
            }
        }
        for (&cpu, &cycles) in task.cycles() {
            if let Some(total) = group.cycles.get_mut(cpu as usize) {
                *total += cycles;
            }
        }
        group.npids += 1;
    }
    groups.into_values().collect()
}

fn percent(part: f64, whole: f64) -> Result<f64> {
    if whole <= 0.0 {
        return Ok(0.0);
    }
    let pct = part * 100.0 / whole;
    if !(-PERCENT_TOLERANCE..=100.0 + PERCENT_TOLERANCE).contains(&pct) {
        bail!("{} out of {} is {}%", part, whole, pct);
    }
    Ok(pct)
}

/// Per task schedule statistics, one row per comm.
pub fn write_sched_stats<W: Write>(
    out: &mut W,
    soc: &Soc,
    groups: &[GroupedTask],
    weights: &CpuWeights,
) -> Result<()> {
    let num_cpus = weights.len();

    // Sort by cycles first, seconds second in case cycles are 0 because no
    // frequency changes were seen in the trace
    let mut rows: Vec<&GroupedTask> = groups.iter().collect();
    rows.sort_by(|a, b| {
        weights
            .wsum(&b.cycles)
            .total_cmp(&weights.wsum(&a.cycles))
            .then_with(|| weights.wsum(&b.seconds).total_cmp(&weights.wsum(&a.seconds)))
            .then_with(|| a.comm.cmp(&b.comm))
    });

    write!(
        out,
        "{:>16}, {:>16}, {:>4}, {:>8}, {:>12}, {:>5}, {:>5}, {:>5}, {:>5}",
        "process", "parent", "pids", "seconds", "cycles", "sec%", "cyc%", "nsec%", "ncyc%"
    )?;
    for cpu in 0..num_cpus {
        write!(
            out,
            ", CPU {} {:>5}, {:>5}, {:>5}, {:>5}",
            cpu, "sec%", "cyc%", "nsec%", "ncyc%"
        )?;
    }
    writeln!(out)?;

    // Total cycles are zero if no frequency changes were observed
    let total_seconds: f64 = rows.iter().map(|t| t.seconds.iter().sum::<f64>()).sum();
    let total_cycles: f64 = rows.iter().map(|t| t.cycles.iter().sum::<f64>()).sum();
    let weighted_seconds: f64 = rows.iter().map(|t| weights.wsum(&t.seconds)).sum();
    let weighted_cycles: f64 = rows.iter().map(|t| weights.wsum(&t.cycles)).sum();

    for t in rows {
        let seconds: f64 = t.seconds.iter().sum();
        let cycles: f64 = t.cycles.iter().sum();
        let row = || -> Result<String> {
            let mut row = format!(
                "{:>16}, {:>16}, {:>4}, {:>8.4}, {:>12.2}, {:>5.2}, {:>5.2}, {:>5.2}, {:>5.2}, ",
                t.comm,
                t.tgid_name,
                t.npids,
                seconds,
                cycles,
                percent(seconds, total_seconds)?,
                percent(cycles, total_cycles)?,
                percent(weights.wsum(&t.seconds), weighted_seconds)?,
                percent(weights.wsum(&t.cycles), weighted_cycles)?,
            );

            // Per cpu columns use that cpu's totals as baseline, a cpu that
            // never showed up counts as zero
            for cpu in 0..num_cpus {
                let (cpu_seconds, cpu_cycles) = soc
                    .cpu(cpu as u32)
                    .map_or((0.0, 0.0), |c| (c.seconds(), c.cycles()));
                let weight = weights.get(cpu);
                row.push_str(&format!(
                    "      {:>5.2}, {:>5.2}, {:>5.2}, {:>5.2}, ",
                    percent(t.seconds[cpu], cpu_seconds)?,
                    percent(t.cycles[cpu], cpu_cycles)?,
                    percent(t.seconds[cpu] * weight, cpu_seconds * weight)?,
                    percent(t.cycles[cpu] * weight, cpu_cycles * weight)?,
                ));
            }
            Ok(row)
        };
        let row = row().with_context(|| format!("Percentage out of range for {}", t.comm))?;
        writeln!(out, "{}", row)?;
    }
    Ok(())
}

/// Percentage of each cpu's tracked time spent at each frequency.
pub fn write_freq_stats<W: Write>(out: &mut W, soc: &Soc, num_cpus: usize) -> Result<()> {
    let frequencies: BTreeSet<u64> = soc
        .cpus()
        .flat_map(|cpu| cpu.seconds_per_frequency().keys().copied())
        .collect();

    write!(out, "{:>9}", "frequency")?;
    for cpu in 0..num_cpus {
        write!(out, ", CPU {:>2}", cpu)?;
    }
    writeln!(out)?;

    // Cycles at the unknown frequency are unknown, so this is time only
    for freq in frequencies {
        if freq == 0 {
            write!(out, "{:>9}", "unknown")?;
        } else {
            write!(out, "{:>9}", freq)?;
        }
        for cpu in 0..num_cpus {
            let pct = match soc.cpu(cpu as u32) {
                Some(cpu) => {
                    let histogram = cpu.seconds_per_frequency();
                    let total: f64 = histogram.values().sum();
                    let at_freq = histogram.get(&freq).copied().unwrap_or(0.0);
                    percent(at_freq, total)
                        .with_context(|| format!("Percentage out of range for {}", freq))?
                }
                None => 0.0,
            };
            write!(out, ", {:>6.2}", pct)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut path = OsString::from(prefix.as_os_str());
    path.push(suffix);
    PathBuf::from(path)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportPaths {
    pub sched_stats: PathBuf,
    pub freq_stats: PathBuf,
}

/// Writes `<prefix>_schedstats.csv` and `<prefix>_freqstats.csv`. Both are
/// rendered before either file is created.
pub fn write_reports(prefix: &Path, soc: &Soc, weights: Option<CpuWeights>) -> Result<ReportPaths> {
    let weights = CpuWeights::resolve(weights, soc)?;
    let groups = group_tasks(soc, weights.len());

    let mut sched_stats = Vec::new();
    write_sched_stats(&mut sched_stats, soc, &groups, &weights)?;
    let mut freq_stats = Vec::new();
    write_freq_stats(&mut freq_stats, soc, weights.len())?;

    let paths = ReportPaths {
        sched_stats: with_suffix(prefix, "_schedstats.csv"),
        freq_stats: with_suffix(prefix, "_freqstats.csv"),
    };
    fs::write(&paths.sched_stats, sched_stats)
        .with_context(|| format!("Failed to write {}", paths.sched_stats.display()))?;
    fs::write(&paths.freq_stats, freq_stats)
        .with_context(|| format!("Failed to write {}", paths.freq_stats.display()))?;
    Ok(paths)
}
