use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::fmt;
use std::str::FromStr;

use crate::trace_line::ParseError;

/// Pseudo pid the network counters are rendered under.
pub const NET_COUNTER_PID: u32 = 8888;
/// Pseudo pid the GPU counters are rendered under.
pub const GPU_COUNTER_PID: u32 = 8887;

// cpu_frequency: state=2150400 cpu_id=2
static FREQUENCY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^state=(?P<frequency>\d+) cpu_id=(?P<cpu_id>\d+)")
        .expect("failed to compile regex")
});

// sched_switch: prev_comm=cfinteractive prev_pid=313 prev_prio=0 prev_state=D ==> next_comm=swapper/1 next_pid=0 next_prio=120
static SCHED_SWITCH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^prev_comm=(?P<prev_comm>.*) prev_pid=(?P<prev_pid>\d+) prev_prio=(?P<prev_prio>-?\d+) prev_state=(?P<prev_state>\S+) ==> next_comm=(?P<next_comm>.*) next_pid=(?P<next_pid>\d+) next_prio=(?P<next_prio>-?\d+)",
    )
    .expect("failed to compile regex")
});

// net_dev_xmit: dev=wlan0 skbaddr=ffffffc041327200 len=66 rc=0
// netif_receive_skb: dev=wlan0 skbaddr=ffffffc028d95900 len=1470
static NET_DEV_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^dev=(?P<dev>\S+) skbaddr=\S+ len=(?P<len>\d+)").expect("failed to compile regex")
});

// kgsl_pwrstats: d_name=kgsl-3d0 total=12427 busy=8139 ram_time=1159316 ram_wait=301723
static KGSL_PWRSTATS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^d_name=\S+ total=(?P<total>\d+) busy=(?P<busy>\d+) ram_time=(?P<ram_time>\d+) ram_wait=(?P<ram_wait>\d+)",
    )
    .expect("failed to compile regex")
});

// kgsl_clk: d_name=kgsl-3d0 flag=on active_freq=257000000
static KGSL_CLK_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^d_name=\S+ flag=(?P<flag>\S+) active_freq=(?P<active_freq>\d+)")
        .expect("failed to compile regex")
});

// kgsl_gpubusy: d_name=kgsl-3d0 busy=1032838 elapsed=1032834
static KGSL_GPUBUSY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^d_name=\S+ busy=(?P<busy>\d+) elapsed=(?P<elapsed>\d+)")
        .expect("failed to compile regex")
});

// kgsl_buslevel: d_name=kgsl-3d0 pwrlevel=4 bus=6
static KGSL_BUSLEVEL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^d_name=\S+ pwrlevel=(?P<pwrlevel>\d+) bus=(?P<bus>\d+)")
        .expect("failed to compile regex")
});

// kgsl_pwrlevel: d_name=kgsl-3d0 pwrlevel=5 freq=214000000 prev_pwrlevel=0 prev_freq=624000000
static KGSL_PWRLEVEL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^d_name=\S+ pwrlevel=(?P<pwrlevel>\d+) freq=(?P<freq>\d+) prev_pwrlevel=(?P<prev_pwrlevel>\d+) prev_freq=(?P<prev_freq>\d+)",
    )
    .expect("failed to compile regex")
});

#[derive(Debug, Clone, PartialEq)]
pub struct CpuFrequency {
    pub frequency: u64,
    pub cpu_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedSwitch {
    pub prev_comm: String,
    pub prev_pid: u32,
    pub prev_prio: i32,
    pub prev_state: String,
    pub next_comm: String,
    pub next_pid: u32,
    pub next_prio: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetDev {
    pub dev: String,
    pub len: u64,
    pub direction: Direction,
}

/// Decoded payload of the functions the driver understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Function {
    CpuFrequency(CpuFrequency),
    SchedSwitch(SchedSwitch),
    NetDev(NetDev),
    KgslPwrStats {
        total: u64,
        busy: u64,
        ram_time: u64,
        ram_wait: u64,
    },
    KgslClk {
        active_freq: u64,
    },
    KgslGpuBusy {
        busy: u64,
        elapsed: u64,
    },
    KgslBusLevel {
        pwrlevel: u64,
        bus: u64,
    },
    KgslPwrLevel {
        pwrlevel: u64,
        freq: u64,
    },
    /// Any other kgsl function, kept in the trace but not rendered as counters.
    KgslOther(String),
    /// Unrecognized, passed through unchanged.
    Other,
}

/// Android trace marker counter, `C|pid|name|value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    pub pid: u32,
    pub name: String,
    pub value: u64,
}

impl Counter {
    fn new(pid: u32, name: impl Into<String>, value: u64) -> Self {
        Counter {
            pid,
            name: name.into(),
            value,
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C|{}|{}|{}", self.pid, self.name, self.value)
    }
}

impl fmt::Display for SchedSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prev_comm={} prev_pid={} prev_prio={} prev_state={} ==> next_comm={} next_pid={} next_prio={}",
            self.prev_comm,
            self.prev_pid,
            self.prev_prio,
            self.prev_state,
            self.next_comm,
            self.next_pid,
            self.next_prio
        )
    }
}

fn payload<'a>(pattern: &Regex, function: &str, rest: &'a str) -> Result<Captures<'a>, ParseError> {
    pattern.captures(rest).ok_or_else(|| ParseError::InvalidPayload {
        function: function.to_string(),
        rest: rest.to_string(),
    })
}

fn field<T: FromStr>(caps: &Captures, name: &'static str) -> Result<T, ParseError> {
    let value = caps.name(name).map(|m| m.as_str()).ok_or(ParseError::InvalidField {
        field: name,
        value: String::new(),
    })?;
    value.parse().map_err(|_| ParseError::InvalidField {
        field: name,
        value: value.to_string(),
    })
}

fn percent(part: u64, whole: u64) -> u64 {
    if whole == 0 {
        0
    } else {
        (part as f64 / whole as f64 * 100.0) as u64
    }
}

impl Function {
    pub fn decode(function: &str, rest: &str) -> Result<Function, ParseError> {
        let decoded = match function {
            "cpu_frequency" => {
                let caps = payload(&FREQUENCY_PATTERN, function, rest)?;
                Function::CpuFrequency(CpuFrequency {
                    frequency: field(&caps, "frequency")?,
                    cpu_id: field(&caps, "cpu_id")?,
                })
            }
            "sched_switch" => {
                let caps = payload(&SCHED_SWITCH_PATTERN, function, rest)?;
                Function::SchedSwitch(SchedSwitch {
                    prev_comm: field(&caps, "prev_comm")?,
                    prev_pid: field(&caps, "prev_pid")?,
                    prev_prio: field(&caps, "prev_prio")?,
                    prev_state: field(&caps, "prev_state")?,
                    next_comm: field(&caps, "next_comm")?,
                    next_pid: field(&caps, "next_pid")?,
                    next_prio: field(&caps, "next_prio")?,
                })
            }
            "net_dev_xmit" | "netif_receive_skb" => {
                let caps = payload(&NET_DEV_PATTERN, function, rest)?;
                Function::NetDev(NetDev {
                    dev: field(&caps, "dev")?,
                    len: field(&caps, "len")?,
                    direction: if function == "net_dev_xmit" {
                        Direction::Tx
                    } else {
                        Direction::Rx
                    },
                })
            }
            "kgsl_pwrstats" => {
                let caps = payload(&KGSL_PWRSTATS_PATTERN, function, rest)?;
                Function::KgslPwrStats {
                    total: field(&caps, "total")?,
                    busy: field(&caps, "busy")?,
                    ram_time: field(&caps, "ram_time")?,
                    ram_wait: field(&caps, "ram_wait")?,
                }
            }
            "kgsl_clk" => {
                let caps = payload(&KGSL_CLK_PATTERN, function, rest)?;
                Function::KgslClk {
                    active_freq: field(&caps, "active_freq")?,
                }
            }
            "kgsl_gpubusy" => {
                let caps = payload(&KGSL_GPUBUSY_PATTERN, function, rest)?;
                Function::KgslGpuBusy {
                    busy: field(&caps, "busy")?,
                    elapsed: field(&caps, "elapsed")?,
                }
            }
            "kgsl_buslevel" => {
                let caps = payload(&KGSL_BUSLEVEL_PATTERN, function, rest)?;
                Function::KgslBusLevel {
                    pwrlevel: field(&caps, "pwrlevel")?,
                    bus: field(&caps, "bus")?,
                }
            }
            "kgsl_pwrlevel" => {
                let caps = payload(&KGSL_PWRLEVEL_PATTERN, function, rest)?;
                Function::KgslPwrLevel {
                    pwrlevel: field(&caps, "pwrlevel")?,
                    freq: field(&caps, "freq")?,
                }
            }
            other if other.contains("kgsl") => Function::KgslOther(other.to_string()),
            _ => Function::Other,
        };
        Ok(decoded)
    }

    /// Counter lines rendered next to the event, in output order.
    pub fn counters(&self) -> Vec<Counter> {
        match self {
            Function::NetDev(net) => {
                let name = match net.direction {
                    Direction::Tx => format!("{} tx", net.dev),
                    Direction::Rx => format!("{} rx", net.dev),
                };
                // Only the completion is traced, drop back to zero so it renders
                // as a zero-length block.
                vec![
                    Counter::new(NET_COUNTER_PID, name.clone(), net.len),
                    Counter::new(NET_COUNTER_PID, name, 0),
                ]
            }
            Function::KgslPwrStats {
                total,
                busy,
                ram_time,
                ram_wait,
            } => vec![
                Counter::new(GPU_COUNTER_PID, "kgsl_pwrstats_busy", percent(*busy, *total)),
                Counter::new(
                    GPU_COUNTER_PID,
                    "kgsl_pwrstats_ramwait",
                    percent(*ram_wait, *ram_time),
                ),
            ],
            Function::KgslClk { active_freq } => {
                vec![Counter::new(GPU_COUNTER_PID, "kgsl_clk", *active_freq)]
            }
            Function::KgslGpuBusy { busy, elapsed } => vec![Counter::new(
                GPU_COUNTER_PID,
                "kgsl_gpubusy",
                percent(*busy, *elapsed),
            )],
            Function::KgslBusLevel { pwrlevel, bus } => vec![
                Counter::new(GPU_COUNTER_PID, "kgsl_buslevel_bus", *bus),
                Counter::new(GPU_COUNTER_PID, "kgsl_buslevel_pwr", *pwrlevel),
            ],
            Function::KgslPwrLevel { freq, .. } => {
                vec![Counter::new(GPU_COUNTER_PID, "kgsl_pwrlevel_freq", *freq)]
            }
            Function::CpuFrequency(_)
            | Function::SchedSwitch(_)
            | Function::KgslOther(_)
            | Function::Other => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_cpu_frequency() {
        assert_eq!(
            Function::decode("cpu_frequency", "state=2150400 cpu_id=2").unwrap(),
            Function::CpuFrequency(CpuFrequency {
                frequency: 2150400,
                cpu_id: 2
            })
        );
    }

    #[test]
    fn decodes_sched_switch() {
        let rest = "prev_comm=cfinteractive prev_pid=313 prev_prio=0 prev_state=D ==> next_comm=swapper/1 next_pid=0 next_prio=120";
        let Function::SchedSwitch(switch) = Function::decode("sched_switch", rest).unwrap() else {
            panic!("not a sched_switch");
        };
        assert_eq!(switch.prev_comm, "cfinteractive");
        assert_eq!(switch.prev_pid, 313);
        assert_eq!(switch.prev_prio, 0);
        assert_eq!(switch.prev_state, "D");
        assert_eq!(switch.next_comm, "swapper/1");
        assert_eq!(switch.next_pid, 0);
        assert_eq!(switch.next_prio, 120);
        assert_eq!(switch.to_string(), rest);
    }

    #[test]
    fn sched_switch_comm_with_spaces() {
        let rest = "prev_comm=Binder thread prev_pid=9 prev_prio=-1 prev_state=R+ ==> next_comm=Render Thread next_pid=10 next_prio=110";
        let Function::SchedSwitch(switch) = Function::decode("sched_switch", rest).unwrap() else {
            panic!("not a sched_switch");
        };
        assert_eq!(switch.prev_comm, "Binder thread");
        assert_eq!(switch.prev_prio, -1);
        assert_eq!(switch.next_comm, "Render Thread");
    }

    #[test]
    fn truncated_payload_is_an_error() {
        assert!(matches!(
            Function::decode("sched_switch", "prev_comm=A prev_pid=1"),
            Err(ParseError::InvalidPayload { .. })
        ));
        assert!(Function::decode("cpu_frequency", "state=").is_err());
        assert!(Function::decode("kgsl_clk", "d_name=kgsl-3d0 flag=on").is_err());
    }

    #[test]
    fn net_counters_drop_back_to_zero() {
        let f = Function::decode(
            "net_dev_xmit",
            "dev=wlan0 skbaddr=ffffffc041327200 len=66 rc=0",
        )
        .unwrap();
        let counters: Vec<String> = f.counters().iter().map(|c| c.to_string()).collect();
        assert_eq!(counters, vec!["C|8888|wlan0 tx|66", "C|8888|wlan0 tx|0"]);

        let f = Function::decode("netif_receive_skb", "dev=rmnet0 skbaddr=ffff len=1470").unwrap();
        assert_eq!(f.counters()[0].to_string(), "C|8888|rmnet0 rx|1470");
    }

    #[test]
    fn gpu_counters() {
        let counters = |function: &str, rest: &str| -> Vec<String> {
            Function::decode(function, rest)
                .unwrap()
                .counters()
                .iter()
                .map(|c| c.to_string())
                .collect()
        };
        assert_eq!(
            counters(
                "kgsl_pwrstats",
                "d_name=kgsl-3d0 total=12427 busy=8139 ram_time=1159316 ram_wait=301723"
            ),
            vec!["C|8887|kgsl_pwrstats_busy|65", "C|8887|kgsl_pwrstats_ramwait|26"]
        );
        assert_eq!(
            counters("kgsl_clk", "d_name=kgsl-3d0 flag=on active_freq=257000000"),
            vec!["C|8887|kgsl_clk|257000000"]
        );
        assert_eq!(
            counters("kgsl_gpubusy", "d_name=kgsl-3d0 busy=500 elapsed=1000"),
            vec!["C|8887|kgsl_gpubusy|50"]
        );
        assert_eq!(
            counters("kgsl_gpubusy", "d_name=kgsl-3d0 busy=500 elapsed=0"),
            vec!["C|8887|kgsl_gpubusy|0"]
        );
        assert_eq!(
            counters("kgsl_buslevel", "d_name=kgsl-3d0 pwrlevel=4 bus=6"),
            vec!["C|8887|kgsl_buslevel_bus|6", "C|8887|kgsl_buslevel_pwr|4"]
        );
        assert_eq!(
            counters(
                "kgsl_pwrlevel",
                "d_name=kgsl-3d0 pwrlevel=5 freq=214000000 prev_pwrlevel=0 prev_freq=624000000"
            ),
            vec!["C|8887|kgsl_pwrlevel_freq|214000000"]
        );
    }

    #[test]
    fn unknown_functions() {
        assert_eq!(
            Function::decode("kgsl_fire_event", "ctx=0 ts=2412008 type=retired").unwrap(),
            Function::KgslOther("kgsl_fire_event".into())
        );
        assert_eq!(
            Function::decode("sched_wakeup", "comm=adbd pid=26452").unwrap(),
            Function::Other
        );
        assert!(Function::Other.counters().is_empty());
    }
}
