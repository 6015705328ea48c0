use log::{debug, warn};
use std::collections::BTreeMap;
use std::fmt;

/// Index into the task arena, stable across renames.
pub type TaskId = usize;

/// Linux is aggressive recycling pids, tasks are identified by comm and pid.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskKey {
    pub comm: String,
    pub pid: u32,
}

impl TaskKey {
    pub fn new(comm: &str, pid: u32) -> Self {
        TaskKey {
            comm: comm.to_string(),
            pid,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.comm, self.pid)
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub comm: String,
    pub pid: u32,
    pub tgid: Option<u32>,
    pub tgid_name: Option<String>,
    // Aggregated data, per cpu
    cycles: BTreeMap<u32, f64>,
    seconds: BTreeMap<u32, f64>,
}

impl Task {
    fn new(comm: &str, pid: u32) -> Self {
        Task {
            comm: comm.to_string(),
            pid,
            tgid: None,
            tgid_name: None,
            cycles: BTreeMap::new(),
            seconds: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(&self.comm, self.pid)
    }

    fn add_cycles_seconds(&mut self, cpu: u32, cycles: f64, seconds: f64) {
        *self.cycles.entry(cpu).or_insert(0.0) += cycles;
        *self.seconds.entry(cpu).or_insert(0.0) += seconds;
    }

    fn absorb(&mut self, other: Task) {
        for (cpu, cycles) in other.cycles {
            *self.cycles.entry(cpu).or_insert(0.0) += cycles;
        }
        for (cpu, seconds) in other.seconds {
            *self.seconds.entry(cpu).or_insert(0.0) += seconds;
        }
        if self.tgid.is_none() {
            self.tgid = other.tgid;
        }
        if self.tgid_name.is_none() {
            self.tgid_name = other.tgid_name;
        }
    }

    pub fn cycles_on(&self, cpu: u32) -> f64 {
        self.cycles.get(&cpu).copied().unwrap_or(0.0)
    }

    pub fn seconds_on(&self, cpu: u32) -> f64 {
        self.seconds.get(&cpu).copied().unwrap_or(0.0)
    }

    /// Per cpu seconds, only for cpus this task ran on.
    pub fn seconds(&self) -> &BTreeMap<u32, f64> {
        &self.seconds
    }

    pub fn cycles(&self) -> &BTreeMap<u32, f64> {
        &self.cycles
    }

    pub fn total_seconds(&self) -> f64 {
        self.seconds.values().sum()
    }

    pub fn total_cycles(&self) -> f64 {
        self.cycles.values().sum()
    }
}

#[derive(Debug, Clone)]
pub struct Cpu {
    pub index: u32,
    frequency: u64,
    cycles: f64,
    seconds: f64,
    seconds_per_frequency: BTreeMap<u64, f64>,
    current_task: Option<TaskId>,
    // Last timestamp the scheduler dealt with this cpu
    last_timestamp: Option<f64>,
}

impl Cpu {
    fn new(index: u32) -> Self {
        Cpu {
            index,
            frequency: 0,
            cycles: 0.0,
            seconds: 0.0,
            seconds_per_frequency: BTreeMap::new(),
            current_task: None,
            last_timestamp: None,
        }
    }

    /// Accounts `seconds` at the current frequency, returns the cycles done.
    fn add_seconds(&mut self, seconds: f64) -> f64 {
        let cycles = self.frequency as f64 * seconds;
        self.cycles += cycles;
        self.seconds += seconds;
        *self
            .seconds_per_frequency
            .entry(self.frequency)
            .or_insert(0.0) += seconds;
        cycles
    }

    /// Current frequency, 0 if no cpu_frequency event was seen yet.
    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    pub fn cycles(&self) -> f64 {
        self.cycles
    }

    pub fn seconds(&self) -> f64 {
        self.seconds
    }

    pub fn seconds_per_frequency(&self) -> &BTreeMap<u64, f64> {
        &self.seconds_per_frequency
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.last_timestamp
    }
}

/// Simulated cpus and the tasks scheduled on them.
#[derive(Debug, Default)]
pub struct Soc {
    // Note there may be gaps in the cpu indices
    cpus: BTreeMap<u32, Cpu>,
    tasks: Vec<Task>,
    index: BTreeMap<TaskKey, TaskId>,
}

impl Soc {
    pub fn new() -> Self {
        Soc::default()
    }

    fn task_id(&mut self, comm: &str, pid: u32) -> TaskId {
        let Soc { tasks, index, .. } = self;
        *index.entry(TaskKey::new(comm, pid)).or_insert_with(|| {
            tasks.push(Task::new(comm, pid));
            tasks.len() - 1
        })
    }

    fn resolve_tgid(&mut self, id: TaskId, tgid: Option<u32>) {
        if self.tasks[id].tgid_name.is_some() {
            return;
        }
        let Some(tgid) = tgid else {
            return;
        };
        self.tasks[id].tgid = Some(tgid);
        // Group 0 means no owning group, don't resolve it to the idle tasks
        if tgid == 0 {
            return;
        }
        self.tasks[id].tgid_name = self
            .index
            .iter()
            .find(|(key, _)| key.pid == tgid)
            .map(|(key, _)| key.comm.clone());
    }

    /// Charges the slice since the cpu's last timestamp to its current task.
    fn account(&mut self, cpu_id: u32, timestamp: f64) {
        let Some(cpu) = self.cpus.get_mut(&cpu_id) else {
            return;
        };
        let Some(task) = cpu.current_task else {
            return;
        };
        let seconds = timestamp - cpu.last_timestamp.unwrap_or(timestamp);
        let cycles = cpu.add_seconds(seconds);
        self.tasks[task].add_cycles_seconds(cpu_id, cycles, seconds);
    }

    pub fn change_frequency(&mut self, timestamp: f64, cpu_id: u32, frequency: u64) {
        self.cpus
            .entry(cpu_id)
            .or_insert_with(|| Cpu::new(cpu_id));

        // Cycles done so far were done at the old frequency
        self.account(cpu_id, timestamp);

        if let Some(cpu) = self.cpus.get_mut(&cpu_id) {
            cpu.frequency = frequency;
            cpu.last_timestamp = Some(timestamp);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn context_switch(
        &mut self,
        timestamp: f64,
        cpu_id: u32,
        prev_comm: &str,
        prev_pid: u32,
        prev_tgid: Option<u32>,
        next_comm: &str,
        next_pid: u32,
    ) {
        let mut prev = self.task_id(prev_comm, prev_pid);
        self.resolve_tgid(prev, prev_tgid);
        let mut next = self.task_id(next_comm, next_pid);

        let cpu = self.cpus.entry(cpu_id).or_insert_with(|| {
            let mut cpu = Cpu::new(cpu_id);
            cpu.last_timestamp = Some(timestamp);
            cpu.current_task = Some(prev);
            cpu
        });

        // TODO: tasks placed on a cpu by a wakeup or migration before any
        // sched_switch get a zero length first slice, check against real traces
        if cpu.last_timestamp.is_none() {
            debug!(
                "Task {} was scheduled on cpu {} before any switch",
                self.tasks[prev].key(),
                cpu_id
            );
            cpu.last_timestamp = Some(timestamp);
        }

        // A current task that mismatches prev changed name while on the cpu
        // (eg. exec after fork), keep accounting on a single identity
        let current = cpu.current_task;
        if let Some(current) = current.filter(|&current| current != prev) {
            if self.tasks[current].pid == prev_pid {
                if next == prev {
                    next = current;
                }
                prev = self.rename(current, prev);
            } else {
                warn!(
                    "Cpu {} switched out {} but {} was running on it",
                    cpu_id,
                    self.tasks[prev].key(),
                    self.tasks[current].key()
                );
            }
        }

        self.account_to(cpu_id, prev, timestamp);

        if let Some(cpu) = self.cpus.get_mut(&cpu_id) {
            cpu.current_task = Some(next);
            cpu.last_timestamp = Some(timestamp);
        }
    }

    fn account_to(&mut self, cpu_id: u32, task: TaskId, timestamp: f64) {
        if let Some(cpu) = self.cpus.get_mut(&cpu_id) {
            cpu.current_task = Some(task);
        }
        self.account(cpu_id, timestamp);
    }

    /// Gives `running` the identity of `renamed`, folding in whatever
    /// accounting `renamed` already had.
    fn rename(&mut self, running: TaskId, renamed: TaskId) -> TaskId {
        let old_key = self.tasks[running].key();
        let new_key = self.tasks[renamed].key();
        debug!("Task {} changed name to {}", old_key, new_key);

        self.index.remove(&old_key);
        let absorbed = std::mem::replace(&mut self.tasks[renamed], Task::new(&new_key.comm, new_key.pid));
        let task = &mut self.tasks[running];
        task.comm = new_key.comm.clone();
        task.absorb(absorbed);
        self.index.insert(new_key, running);

        for cpu in self.cpus.values_mut() {
            if cpu.current_task == Some(renamed) {
                cpu.current_task = Some(running);
            }
        }
        running
    }

    /// Accounts the last open slice of every cpu.
    pub fn sync(&mut self, timestamp: f64) {
        let cpus: Vec<(u32, u64)> = self
            .cpus
            .values()
            .map(|cpu| (cpu.index, cpu.frequency))
            .collect();
        for (cpu_id, frequency) in cpus {
            self.change_frequency(timestamp, cpu_id, frequency);
        }
    }

    pub fn has_cpu(&self, cpu_id: u32) -> bool {
        self.cpus.contains_key(&cpu_id)
    }

    pub fn cpu(&self, cpu_id: u32) -> Option<&Cpu> {
        self.cpus.get(&cpu_id)
    }

    pub fn cpus(&self) -> impl Iterator<Item = &Cpu> {
        self.cpus.values()
    }

    /// Highest cpu index seen plus one.
    pub fn num_cpus(&self) -> usize {
        self.cpus
            .keys()
            .next_back()
            .map_or(0, |&index| index as usize + 1)
    }

    /// Live tasks, ordered by comm and pid.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.index.values().map(|&id| &self.tasks[id])
    }

    pub fn task(&self, key: &TaskKey) -> Option<&Task> {
        self.index.get(key).map(|&id| &self.tasks[id])
    }

    pub fn running_task(&self, cpu_id: u32) -> Option<&Task> {
        self.cpus
            .get(&cpu_id)
            .and_then(|cpu| cpu.current_task)
            .map(|id| &self.tasks[id])
    }

    /// Comm of a task with `pid` currently on some cpu, skipping `placeholder`.
    pub fn running_comm(&self, pid: u32, placeholder: &str) -> Option<&str> {
        self.cpus
            .keys()
            .filter_map(|&cpu_id| self.running_task(cpu_id))
            .filter(|task| task.pid == pid && task.comm != placeholder)
            .map(|task| task.comm.as_str())
            .last()
    }

    /// Pairs of distinct identities sharing a nonzero pid.
    pub fn pid_aliases(&self) -> Vec<(TaskKey, TaskKey)> {
        let mut by_pid: BTreeMap<u32, Vec<&TaskKey>> = BTreeMap::new();
        for key in self.index.keys().filter(|key| key.pid != 0) {
            by_pid.entry(key.pid).or_default().push(key);
        }

        let mut aliases = Vec::new();
        for keys in by_pid.values() {
            for (i, a) in keys.iter().enumerate() {
                for b in &keys[i + 1..] {
                    aliases.push(((*a).clone(), (*b).clone()));
                }
            }
        }
        aliases
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < EPSILON, "{} != {}", a, b);
    }

    fn task<'a>(soc: &'a Soc, comm: &str, pid: u32) -> &'a Task {
        soc.task(&TaskKey::new(comm, pid))
            .unwrap_or_else(|| panic!("no task {}-{}", comm, pid))
    }

    fn assert_cycle_identity(soc: &Soc) {
        for cpu in soc.cpus() {
            let expected: f64 = cpu
                .seconds_per_frequency()
                .iter()
                .map(|(&f, &s)| f as f64 * s)
                .sum();
            assert!((cpu.cycles() - expected).abs() <= 1e-6 * expected.max(1.0));
        }
    }

    #[test]
    fn two_switches_without_frequency() {
        let mut soc = Soc::new();
        soc.context_switch(1.0, 0, "swapper/0", 0, None, "A", 100);
        soc.context_switch(3.0, 0, "A", 100, None, "swapper/0", 0);
        soc.sync(3.0);

        let a = task(&soc, "A", 100);
        assert_close(a.seconds_on(0), 2.0);
        assert_close(a.cycles_on(0), 0.0);
        assert_close(soc.cpu(0).unwrap().seconds(), 2.0);
        assert_eq!(soc.cpu(0).unwrap().cycles(), 0.0);
    }

    #[test]
    fn frequency_change_mid_slice() {
        let mut soc = Soc::new();
        soc.change_frequency(0.0, 0, 1000);
        soc.context_switch(0.0, 0, "swapper/0", 0, None, "A", 100);
        soc.change_frequency(5.0, 0, 2000);
        assert_cycle_identity(&soc);
        soc.sync(7.0);
        assert_cycle_identity(&soc);

        let a = task(&soc, "A", 100);
        assert_close(a.cycles_on(0), 9000.0);
        assert_close(a.seconds_on(0), 7.0);

        let cpu = soc.cpu(0).unwrap();
        assert_close(cpu.seconds_per_frequency()[&1000], 5.0);
        assert_close(cpu.seconds_per_frequency()[&2000], 2.0);
        assert_close(cpu.cycles(), 9000.0);
    }

    #[test]
    fn frequency_on_idle_cpu_is_not_accounted() {
        let mut soc = Soc::new();
        soc.change_frequency(1.0, 3, 500);
        soc.change_frequency(2.0, 3, 700);
        let cpu = soc.cpu(3).unwrap();
        assert_eq!(cpu.seconds(), 0.0);
        assert_eq!(cpu.frequency(), 700);
        assert_eq!(soc.num_cpus(), 4);
        assert!(!soc.has_cpu(0));
    }

    #[test]
    fn seconds_add_up_to_elapsed_time() {
        let mut soc = Soc::new();
        soc.context_switch(10.0, 1, "swapper/1", 0, None, "A", 1);
        soc.change_frequency(10.5, 1, 300);
        soc.context_switch(11.0, 1, "A", 1, Some(1), "B", 2);
        soc.change_frequency(11.25, 1, 600);
        soc.context_switch(12.0, 1, "B", 2, Some(1), "A", 1);
        soc.context_switch(12.5, 1, "A", 1, Some(1), "C", 3);
        soc.sync(14.0);
        assert_cycle_identity(&soc);

        let per_task: f64 = soc.tasks().map(|t| t.seconds_on(1)).sum();
        assert_close(per_task, 4.0);
        assert_close(soc.cpu(1).unwrap().seconds(), 4.0);
        assert_close(task(&soc, "A", 1).seconds_on(1), 1.5);
        assert_close(task(&soc, "B", 2).seconds_on(1), 1.0);
        assert_close(task(&soc, "C", 3).seconds_on(1), 1.5);
        assert_close(task(&soc, "A", 1).cycles_on(1), 0.5 * 300.0 + 0.5 * 600.0);
    }

    #[test]
    fn resolves_owning_group_name() {
        let mut soc = Soc::new();
        soc.context_switch(1.0, 0, "swapper/0", 0, None, "app", 500);
        soc.context_switch(2.0, 0, "app", 500, Some(500), "RenderThread", 501);
        soc.context_switch(3.0, 0, "RenderThread", 501, Some(500), "swapper/0", 0);
        soc.context_switch(4.0, 0, "swapper/0", 0, Some(0), "orphan", 700);
        soc.context_switch(5.0, 0, "orphan", 700, Some(650), "swapper/0", 0);

        let render = task(&soc, "RenderThread", 501);
        assert_eq!(render.tgid, Some(500));
        assert_eq!(render.tgid_name.as_deref(), Some("app"));
        let orphan = task(&soc, "orphan", 700);
        assert_eq!(orphan.tgid, Some(650));
        assert_eq!(orphan.tgid_name, None);
        let idle = task(&soc, "swapper/0", 0);
        assert_eq!(idle.tgid, Some(0));
        assert_eq!(idle.tgid_name, None);
    }

    #[test]
    fn rename_keeps_one_identity() {
        let mut soc = Soc::new();
        soc.context_switch(1.0, 0, "swapper/0", 0, None, "adbd", 42);
        // adbd forks and execs a shell while on the cpu
        soc.context_switch(4.0, 0, "sh", 42, None, "swapper/0", 0);

        assert!(soc.task(&TaskKey::new("adbd", 42)).is_none());
        let sh = task(&soc, "sh", 42);
        assert_close(sh.seconds_on(0), 3.0);
        assert_eq!(soc.tasks().filter(|t| t.pid == 42).count(), 1);
        assert!(soc.pid_aliases().is_empty());
    }

    #[test]
    fn rename_merges_existing_accounting() {
        let mut soc = Soc::new();
        soc.context_switch(0.0, 1, "swapper/1", 0, None, "sh", 42);
        soc.context_switch(2.0, 1, "sh", 42, None, "swapper/1", 0);
        soc.context_switch(2.0, 0, "swapper/0", 0, None, "adbd", 42);
        soc.context_switch(5.0, 0, "sh", 42, None, "swapper/0", 0);

        let sh = task(&soc, "sh", 42);
        assert_close(sh.seconds_on(1), 2.0);
        assert_close(sh.seconds_on(0), 3.0);
        assert_eq!(soc.tasks().filter(|t| t.pid == 42).count(), 1);
    }

    #[test]
    fn mismatched_pid_is_not_a_rename() {
        let mut soc = Soc::new();
        soc.context_switch(1.0, 0, "swapper/0", 0, None, "A", 1);
        soc.context_switch(2.0, 0, "B", 2, None, "swapper/0", 0);
        assert!(soc.task(&TaskKey::new("A", 1)).is_some());
        assert_close(task(&soc, "B", 2).seconds_on(0), 1.0);
        assert_close(task(&soc, "A", 1).seconds_on(0), 0.0);
    }

    #[test]
    fn finds_running_comm_by_pid() {
        let mut soc = Soc::new();
        soc.context_switch(1.0, 0, "swapper/0", 0, None, "adbd", 42);
        soc.context_switch(1.0, 2, "swapper/2", 0, None, "<...>", 43);
        assert_eq!(soc.running_comm(42, "<...>"), Some("adbd"));
        assert_eq!(soc.running_comm(43, "<...>"), None);
        assert_eq!(soc.running_comm(7, "<...>"), None);
    }

    #[test]
    fn reports_pid_aliases() {
        let mut soc = Soc::new();
        soc.context_switch(1.0, 0, "swapper/0", 0, None, "A", 9);
        soc.context_switch(2.0, 0, "A", 9, None, "swapper/0", 0);
        soc.context_switch(3.0, 1, "swapper/1", 0, None, "B", 9);
        assert_eq!(
            soc.pid_aliases(),
            vec![(TaskKey::new("A", 9), TaskKey::new("B", 9))]
        );
    }
}
