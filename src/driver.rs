use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::mem;
use std::path::Path;

use crate::function::Function;
use crate::soc::Soc;
use crate::trace_line::{
    Event, IDLE_LINE_NAME, NAME_CACHE_MISS, ParseError, TraceLine, idle_comm,
};

/// Lines every default driver checks its grammars against on construction.
pub const SELF_CHECK_LINES: &[&str] = &[
    "# entries-in-buffer/entries-written: 144290/144290   #P:4",
    "Tracking1-4961  ( 4364) [003] d.s2  2081.420093: cpufreq_interactive_target: cpu=0 load=99 cur=652800 actual=652800 targ=960000",
    "<idle>-0     [002] dn.2 328325.679110: cpu_idle: state=4294967295 cpu_id=2",
    "<...>-3290  [002] d..4 677007.189558: sched_wakeup: comm=adbd pid=26452 prio=120 success=1 target_cpu=001",
    "cfinteractive-313   [001] d..3 134626.984532: sched_switch: prev_comm=cfinteractive prev_pid=313 prev_prio=0 prev_state=D ==> next_comm=swapper/1 next_pid=0 next_prio=120",
    "<idle>-0     (-----) [002] d..2 134626.984600: cpu_frequency: state=2150400 cpu_id=2",
];

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Input is an html document embedding the trace, lines outside the
    /// grammar are markup.
    pub html: bool,
    /// Stop after reading this many lines.
    pub max_lines: Option<u64>,
    pub self_check: Vec<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            html: false,
            max_lines: None,
            self_check: SELF_CHECK_LINES.iter().map(|l| l.to_string()).collect(),
        }
    }
}

impl DriverConfig {
    pub fn for_path(path: &Path) -> Self {
        let name = path.to_string_lossy().to_lowercase();
        DriverConfig {
            html: name.ends_with(".html") || name.ends_with(".html.gz"),
            ..DriverConfig::default()
        }
    }

    fn check(&self) -> Result<()> {
        for sample in &self.self_check {
            let line: TraceLine = sample
                .parse()
                .with_context(|| format!("self check failed for {:?}", sample))?;
            if let TraceLine::Event(event) = line {
                event
                    .decode()
                    .with_context(|| format!("self check failed for {:?}", sample))?;
            }
        }
        Ok(())
    }
}

/// Opens a trace, decompressing it if it ends in `.gz`.
pub fn open_trace(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open input trace {}", path.display()))?;
    let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
    let reader: Box<dyn Read> = if name.ends_with(".gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::with_capacity(256 * 1024, reader)))
}

#[derive(Debug)]
enum State {
    Streaming,
    // The most recent line failed to parse, fine only if nothing follows
    TrailingCorrupt {
        line_number: u64,
        line: String,
        error: ParseError,
    },
    Done,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TraceSummary {
    pub lines: u64,
    pub events: u64,
    pub synthesized_switches: u64,
    pub closing_switches: u64,
    pub untranslated_tasks: u64,
    pub pid_aliases: u64,
    pub corrupted_line: Option<(u64, String)>,
    pub first_timestamp: Option<f64>,
    pub last_timestamp: Option<f64>,
}

#[derive(Debug)]
pub struct TraceOutcome {
    pub soc: Soc,
    pub summary: TraceSummary,
}

pub struct TraceDriver<W: Write> {
    config: DriverConfig,
    soc: Soc,
    out: W,
    state: State,
    summary: TraceSummary,
}

impl<W: Write> TraceDriver<W> {
    pub fn new(config: DriverConfig, out: W) -> Result<Self> {
        config.check()?;
        Ok(TraceDriver {
            config,
            soc: Soc::new(),
            out,
            state: State::Streaming,
            summary: TraceSummary::default(),
        })
    }

    /// Feeds every line of `reader`, honoring `max_lines`.
    pub fn process<R: BufRead>(&mut self, mut reader: R) -> Result<()> {
        let mut buf = Vec::new();
        loop {
            if let Some(max_lines) = self.config.max_lines {
                if self.summary.lines >= max_lines {
                    info!("Stopping after {} lines", max_lines);
                    break;
                }
            }
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .with_context(|| format!("Failed to read line {}", self.summary.lines + 1))?;
            if read == 0 {
                break;
            }
            // The trailing line may be cut in the middle of a character
            let line = String::from_utf8_lossy(&buf);
            self.process_line(&line)?;
        }
        Ok(())
    }

    pub fn process_line(&mut self, raw: &str) -> Result<()> {
        self.summary.lines += 1;
        let line_number = self.summary.lines;
        let line = raw.trim_end_matches(['\r', '\n']);

        if line.trim().is_empty() {
            if !self.config.html {
                writeln!(self.out, "{}", line)?;
            }
            return Ok(());
        }

        match &self.state {
            State::Streaming => {}
            State::TrailingCorrupt {
                line_number: corrupt_number,
                line: corrupt_line,
                error,
            } => {
                bail!(
                    "Corrupted line {} {:?} ({}) is not the last line, line {} follows: {:?}",
                    corrupt_number,
                    corrupt_line,
                    error,
                    line_number,
                    line
                );
            }
            State::Done => bail!("Line {} fed to a finished trace", line_number),
        }

        let parsed = line.parse::<TraceLine>().and_then(|parsed| match parsed {
            TraceLine::Event(event) => {
                let function = event.decode()?;
                Ok(Some((event, function)))
            }
            TraceLine::Comment(_) => Ok(None),
        });

        match parsed {
            Ok(Some((event, function))) => self.handle_event(line_number, line, event, function),
            Ok(None) => {
                writeln!(self.out, "{}", line.trim())?;
                Ok(())
            }
            Err(ParseError::InvalidFormat(_)) if self.config.html => Ok(()),
            Err(error) => {
                debug!("Line {} failed to parse: {}", line_number, error);
                self.state = State::TrailingCorrupt {
                    line_number,
                    line: line.to_string(),
                    error,
                };
                Ok(())
            }
        }
    }

    fn handle_event(
        &mut self,
        line_number: u64,
        line: &str,
        mut event: Event,
        function: Function,
    ) -> Result<()> {
        // Some very old kernels wouldn't synchronize cpu buffers well
        if let Some(last) = self.summary.last_timestamp {
            if event.timestamp < last {
                bail!(
                    "Line {}: timestamp {:.6} is less than previous timestamp {:.6}: {:?}",
                    line_number,
                    event.timestamp,
                    last,
                    line
                );
            }
        }
        self.summary.events += 1;
        self.summary.first_timestamp.get_or_insert(event.timestamp);
        self.summary.last_timestamp = Some(event.timestamp);

        let is_switch = matches!(function, Function::SchedSwitch(_));
        if !is_switch && self.soc.running_task(event.cpu).is_none() {
            self.switch_in_from_idle(&event)?;
        }

        // The kernel's comm cache prints "<...>" on a miss, the task has to be
        // current on some cpu for it to emit this line
        if event.task == NAME_CACHE_MISS {
            match self.soc.running_comm(event.pid, NAME_CACHE_MISS) {
                Some(comm) => {
                    debug!("Translating {}-{} to {}", event.task, event.pid, comm);
                    event.task = comm.to_string();
                }
                None => {
                    warn!("Unable to translate task {}-{}", event.task, event.pid);
                    self.summary.untranslated_tasks += 1;
                }
            }
        }

        match &function {
            Function::CpuFrequency(freq) => {
                self.soc
                    .change_frequency(event.timestamp, freq.cpu_id, freq.frequency);
            }
            Function::SchedSwitch(switch) => {
                self.soc.context_switch(
                    event.timestamp,
                    event.cpu,
                    &switch.prev_comm,
                    switch.prev_pid,
                    event.tgid.map(|tgid| tgid.id()),
                    &switch.next_comm,
                    switch.next_pid,
                );
            }
            Function::KgslOther(name) => debug!("Unhandled {} at line {}: {:?}", name, line_number, line),
            _ => {
                for counter in function.counters() {
                    writeln!(self.out, "{}", event.counter_line(&counter))?;
                }
            }
        }

        writeln!(self.out, "{}", event)?;
        Ok(())
    }

    /// Gives a cpu with no switch seen yet a start edge for the task on it.
    fn switch_in_from_idle(&mut self, event: &Event) -> Result<()> {
        // Idle shows up as <idle> in line headers but swapper/N in switches
        let next_comm = if event.task == IDLE_LINE_NAME {
            idle_comm(event.cpu)
        } else {
            event.task.clone()
        };
        info!(
            "Generating initial sched_switch for comm {} ({}) on cpu {}",
            next_comm, event.task, event.cpu
        );

        self.soc.context_switch(
            event.timestamp,
            event.cpu,
            &idle_comm(event.cpu),
            0,
            Some(0),
            &next_comm,
            event.pid,
        );
        let switch = Event::idle_switch_in(event.cpu, event.timestamp, &next_comm, event.pid);
        writeln!(self.out, "{}", switch)?;
        self.summary.synthesized_switches += 1;
        Ok(())
    }

    /// Closes the open slices and returns the model with the output stream.
    pub fn finish(mut self) -> Result<(TraceOutcome, W)> {
        if let State::TrailingCorrupt {
            line_number,
            line,
            error,
        } = mem::replace(&mut self.state, State::Done)
        {
            warn!(
                "Dropping corrupted last line {} {:?}: {}",
                line_number, line, error
            );
            self.summary.corrupted_line = Some((line_number, line));
        }
        info!("Total lines {}", self.summary.lines);

        if let Some(last) = self.summary.last_timestamp {
            self.soc.sync(last);
            self.close_slices(last)?;
        }

        if let (Some(first), Some(last)) = (self.summary.first_timestamp, self.summary.last_timestamp) {
            if last > first {
                let accounted: f64 = self.soc.tasks().map(|task| task.total_seconds()).sum();
                info!(
                    "Calculated total seconds/trace seconds is {:.4}",
                    accounted / (last - first)
                );
            }
        }

        for (a, b) in self.soc.pid_aliases() {
            warn!("PID {} for task {} matches PID {} for task {}", a.pid, a, b.pid, b);
            self.summary.pid_aliases += 1;
        }

        self.out.flush()?;
        Ok((
            TraceOutcome {
                soc: self.soc,
                summary: self.summary,
            },
            self.out,
        ))
    }

    // Switch every running task out to idle so each rendered slice is closed
    fn close_slices(&mut self, timestamp: f64) -> Result<()> {
        let running: Vec<(u32, String, u32, u32)> = self
            .soc
            .cpus()
            .filter_map(|cpu| {
                self.soc
                    .running_task(cpu.index)
                    .map(|task| (cpu.index, task.comm.clone(), task.pid, task.tgid.unwrap_or(0)))
            })
            .collect();

        for (cpu, comm, pid, tgid) in running {
            let event = Event::idle_switch_out(cpu, timestamp, &comm, pid, tgid);
            self.soc.context_switch(
                timestamp,
                cpu,
                &comm,
                pid,
                Some(tgid),
                &idle_comm(cpu),
                0,
            );
            writeln!(self.out, "{}", event)?;
            self.summary.closing_switches += 1;
        }
        Ok(())
    }
}

/// Streams `input` into the rewritten trace at `output`.
pub fn run_trace(input: &Path, output: &Path, config: DriverConfig) -> Result<TraceOutcome> {
    let reader = open_trace(input)?;
    let file = File::create(output)
        .with_context(|| format!("Failed to create output trace {}", output.display()))?;

    let mut driver = TraceDriver::new(config, BufWriter::new(file))?;
    driver
        .process(reader)
        .with_context(|| format!("Failed to process {}", input.display()))?;
    let (outcome, _) = driver.finish()?;
    Ok(outcome)
}
