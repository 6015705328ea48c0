use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::error::Error;
use std::fmt;
use std::str::FromStr;

use crate::function::{Counter, Function, SchedSwitch};

/// Name the kernel prints when its comm cache misses.
pub const NAME_CACHE_MISS: &str = "<...>";
/// Line task name of the per-cpu idle thread.
pub const IDLE_LINE_NAME: &str = "<idle>";
/// Placeholder tgid for tasks without an owning thread group.
pub const NO_GROUP: &str = "-----";

const SYNTHETIC_FLAGS: &str = "d..3";
const DEFAULT_PRIO: i32 = 120;

// Note comm names are free form, they can include spaces, dashes, slashes, etc
static LINE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:#(?P<comment>.*)|(?P<task>.*)-(?P<pid>\d+)\s+(?:\((?P<tgid>[^)]*)\)\s+)?\[(?P<cpu>\d+)\] (?P<flags>\S+)\s+(?P<timestamp>\d+\.\d+): (?P<function>[^:]+): (?P<rest>.*))$",
    )
    .expect("failed to compile regex")
});

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    InvalidFormat(String),
    InvalidField { field: &'static str, value: String },
    InvalidPayload { function: String, rest: String },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::InvalidFormat(line) => {
                write!(f, "line does not match the trace grammar: {:?}", line)
            }
            ParseError::InvalidField { field, value } => {
                write!(f, "invalid {} field: {:?}", field, value)
            }
            ParseError::InvalidPayload { function, rest } => {
                write!(f, "invalid {} payload: {:?}", function, rest)
            }
        }
    }
}

impl Error for ParseError {}

/// Owning thread group as printed between parentheses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tgid {
    NoGroup,
    Id(u32),
}

impl Tgid {
    /// Numeric group id, `NoGroup` being group 0.
    pub fn id(&self) -> u32 {
        match self {
            Tgid::NoGroup => 0,
            Tgid::Id(id) => *id,
        }
    }
}

impl fmt::Display for Tgid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tgid::NoGroup => f.pad(NO_GROUP),
            Tgid::Id(id) => f.pad(&id.to_string()),
        }
    }
}

impl FromStr for Tgid {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == NO_GROUP {
            return Ok(Tgid::NoGroup);
        }
        s.parse().map(Tgid::Id).map_err(|_| ParseError::InvalidField {
            field: "tgid",
            value: s.to_string(),
        })
    }
}

/// One scheduler/function event line.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub task: String,
    pub pid: u32,
    pub tgid: Option<Tgid>,
    pub cpu: u32,
    pub flags: String,
    pub timestamp: f64,
    pub function: String,
    pub rest: String,
}

impl Event {
    pub fn decode(&self) -> Result<Function, ParseError> {
        Function::decode(&self.function, &self.rest)
    }

    /// Same header, different payload.
    pub fn with_payload(&self, function: &str, rest: String) -> Event {
        Event {
            function: function.to_string(),
            rest,
            ..self.clone()
        }
    }

    pub fn counter_line(&self, counter: &Counter) -> Event {
        self.with_payload("tracing_mark_write", counter.to_string())
    }

    /// Switch from the cpu's idle task to `next_comm`, as emitted when a cpu
    /// shows up without any sched_switch seen on it yet.
    pub fn idle_switch_in(cpu: u32, timestamp: f64, next_comm: &str, next_pid: u32) -> Event {
        let switch = SchedSwitch {
            prev_comm: idle_comm(cpu),
            prev_pid: 0,
            prev_prio: DEFAULT_PRIO,
            prev_state: "R".to_string(),
            next_comm: next_comm.to_string(),
            next_pid,
            next_prio: DEFAULT_PRIO,
        };
        Event {
            task: IDLE_LINE_NAME.to_string(),
            pid: 0,
            tgid: Some(Tgid::Id(0)),
            cpu,
            flags: SYNTHETIC_FLAGS.to_string(),
            timestamp,
            function: "sched_switch".to_string(),
            rest: switch.to_string(),
        }
    }

    /// Switch from `prev_comm` back to the cpu's idle task.
    pub fn idle_switch_out(
        cpu: u32,
        timestamp: f64,
        prev_comm: &str,
        prev_pid: u32,
        prev_tgid: u32,
    ) -> Event {
        let switch = SchedSwitch {
            prev_comm: prev_comm.to_string(),
            prev_pid,
            prev_prio: DEFAULT_PRIO,
            prev_state: "R".to_string(),
            next_comm: idle_comm(cpu),
            next_pid: 0,
            next_prio: DEFAULT_PRIO,
        };
        Event {
            task: prev_comm.to_string(),
            pid: prev_pid,
            tgid: Some(Tgid::Id(prev_tgid)),
            cpu,
            flags: SYNTHETIC_FLAGS.to_string(),
            timestamp,
            function: "sched_switch".to_string(),
            rest: switch.to_string(),
        }
    }
}

/// Comm of the idle task of `cpu` as it appears in sched_switch payloads.
pub fn idle_comm(cpu: u32) -> String {
    format!("swapper/{}", cpu)
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>16}-{:<5} ", self.task, self.pid)?;
        if let Some(tgid) = &self.tgid {
            write!(f, "({:>5}) ", tgid)?;
        }
        write!(
            f,
            "[{:03}] {:>4} {:.6}: {}: {}",
            self.cpu, self.flags, self.timestamp, self.function, self.rest
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraceLine {
    Comment(String),
    Event(Event),
}

impl fmt::Display for TraceLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceLine::Comment(comment) => write!(f, "#{}", comment),
            TraceLine::Event(event) => event.fmt(f),
        }
    }
}

fn capture<'a>(caps: &'a Captures, name: &'static str) -> Result<&'a str, ParseError> {
    caps.name(name)
        .map(|m| m.as_str())
        .ok_or_else(|| ParseError::InvalidField {
            field: name,
            value: String::new(),
        })
}

fn number<T: FromStr>(caps: &Captures, name: &'static str) -> Result<T, ParseError> {
    let value = capture(caps, name)?;
    value.parse().map_err(|_| ParseError::InvalidField {
        field: name,
        value: value.to_string(),
    })
}

impl FromStr for TraceLine {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim_end_matches(['\r', '\n']);
        let caps = LINE_PATTERN
            .captures(line)
            .ok_or_else(|| ParseError::InvalidFormat(line.to_string()))?;

        if let Some(comment) = caps.name("comment") {
            return Ok(TraceLine::Comment(comment.as_str().to_string()));
        }

        let tgid = match caps.name("tgid") {
            Some(tgid) => Some(tgid.as_str().parse()?),
            None => None,
        };

        Ok(TraceLine::Event(Event {
            task: capture(&caps, "task")?.trim().to_string(),
            pid: number(&caps, "pid")?,
            tgid,
            cpu: number(&caps, "cpu")?,
            flags: capture(&caps, "flags")?.to_string(),
            timestamp: number(&caps, "timestamp")?,
            function: capture(&caps, "function")?.to_string(),
            rest: capture(&caps, "rest")?.to_string(),
        }))
    }
}
