//! Worker supervisor (component F).
//!
//! Grounded on
//! `original_source/shmrpc/service_managers/multi_process_manager/MultiProcessManager.py::__monitor_process_loop`:
//! reap zombies, enforce the process-count floor, sample load, then scale
//! up or down based on average CPU usage over two distinct windows.
//! **Open Question resolved:** all CPU comparisons here are fractions of
//! one core (0.0-1.0), not percentages -- the inconsistency between the
//! original's two comparison sites (one against `new_proc_cpu_pc`, the
//! other against `new_proc_cpu_pc * 100.0`) is resolved in favor of
//! fractions throughout, with `sysinfo`'s percentage-of-one-core reading
//! divided by 100 right where it's sampled.

use std::process::Child;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use sysinfo::{Pid as SysPid, System};

use crate::error::SupervisorError;

/// Matches `MONITOR_PROCESS_EVERY_SECS` in the original.
pub const MONITOR_PERIOD: Duration = Duration::from_secs(5);

const MAX_SECS_TO_WAIT_AFTER_SIGINT: u64 = 100;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub min_procs: usize,
    pub max_procs: usize,
    pub max_mem_bytes: Option<u64>,
    /// Fraction of one CPU core (0.0-1.0 exclusive), above which a new
    /// worker is spawned and below which one is culled.
    pub scale_up_threshold: f64,
    pub scale_up_window: Duration,
    pub scale_down_window: Duration,
}

struct WorkerRecord {
    pid: i32,
}

struct Sample {
    at: Instant,
    cpu_fraction_total: f64,
    mem_bytes_total: u64,
    num_processes: usize,
}

/// Owns one service's worker pool and runs its control loop.
pub struct Supervisor {
    name: String,
    config: SupervisorConfig,
    spawn: Box<dyn Fn() -> std::io::Result<Child> + Send>,
    workers: Vec<WorkerRecord>,
    samples: Vec<Sample>,
    last_op_time: Instant,
    system: System,
}

impl Supervisor {
    pub fn new(
        name: impl Into<String>,
        config: SupervisorConfig,
        spawn: impl Fn() -> std::io::Result<Child> + Send + 'static,
    ) -> Self {
        assert!(
            config.scale_up_threshold > 0.0 && config.scale_up_threshold < 1.0,
            "scale_up_threshold must be strictly between 0 and 1"
        );
        Self {
            name: name.into(),
            config,
            spawn: Box::new(spawn),
            workers: Vec::new(),
            samples: Vec::new(),
            last_op_time: Instant::now() - Duration::from_secs(3600),
            system: System::new_all(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_pids(&self) -> Vec<i32> {
        self.workers.iter().map(|w| w.pid).collect()
    }

    /// Run one iteration of the seven-step control loop. Callers drive
    /// this from a loop spaced `MONITOR_PERIOD` apart.
    pub fn tick(&mut self) -> Result<(), SupervisorError> {
        self.reap_zombies();
        self.enforce_floor()?;
        self.sample_load();

        if self.trim_for_memory()? {
            return Ok(());
        }

        let since_last_op = self.last_op_time.elapsed();

        if since_last_op > self.config.scale_up_window
            && self.workers.len() < self.config.max_procs
            && let Some(per_process) = self.average_cpu_per_process(self.config.scale_up_window)
            && per_process > self.config.scale_up_threshold
        {
            log::info!(
                "{}: adding worker, CPU usage {:.1}% over {:?}",
                self.name,
                per_process * 100.0,
                self.config.scale_up_window
            );
            self.spawn_worker()?;
            return Ok(());
        }

        if since_last_op > self.config.scale_down_window
            && self.workers.len() > self.config.min_procs
            && let Some(per_process) = self.average_cpu_per_process(self.config.scale_down_window)
            && per_process < self.config.scale_up_threshold
        {
            log::info!(
                "{}: removing worker, CPU usage {:.1}% over {:?}",
                self.name,
                per_process * 100.0,
                self.config.scale_down_window
            );
            self.remove_newest_worker();
        }

        Ok(())
    }

    fn trim_for_memory(&mut self) -> Result<bool, SupervisorError> {
        let Some(cap) = self.config.max_mem_bytes else {
            return Ok(false);
        };
        let Some(latest) = self.samples.last() else {
            return Ok(false);
        };
        if latest.mem_bytes_total > cap {
            log::info!(
                "{}: removing worker, memory usage {} exceeds cap {cap}",
                self.name,
                latest.mem_bytes_total
            );
            self.remove_newest_worker();
            return Ok(true);
        }
        Ok(false)
    }

    fn reap_zombies(&mut self) {
        self.system.refresh_all();
        let mut gone = Vec::new();
        for worker in &self.workers {
            if unsafe { libc::kill(worker.pid, 0) } != 0 {
                gone.push(worker.pid);
                continue;
            }
            if let Some(proc) = self.system.process(SysPid::from_u32(worker.pid as u32))
                && proc.status() == sysinfo::ProcessStatus::Zombie
            {
                let _ = waitpid(Pid::from_raw(worker.pid), Some(WaitPidFlag::WNOHANG));
                gone.push(worker.pid);
            }
        }
        for pid in gone {
            log::warn!("{}: worker pid={pid} is gone, removing from pool", self.name);
            self.workers.retain(|w| w.pid != pid);
        }
    }

    fn enforce_floor(&mut self) -> Result<(), SupervisorError> {
        while self.workers.len() < self.config.min_procs {
            self.spawn_worker()?;
        }
        Ok(())
    }

    fn sample_load(&mut self) {
        self.system.refresh_all();
        let mut cpu_total = 0.0;
        let mut mem_total = 0u64;
        for worker in &self.workers {
            if let Some(proc) = self.system.process(SysPid::from_u32(worker.pid as u32)) {
                cpu_total += proc.cpu_usage() as f64 / 100.0;
                mem_total += proc.memory();
            }
        }

        self.samples.push(Sample {
            at: Instant::now(),
            cpu_fraction_total: cpu_total,
            mem_bytes_total: mem_total,
            num_processes: self.workers.len().max(1),
        });

        let horizon = self.config.scale_up_window.max(self.config.scale_down_window);
        let cutoff = Instant::now().checked_sub(horizon);
        if let Some(cutoff) = cutoff {
            self.samples.retain(|s| s.at >= cutoff);
        }
    }

    /// Average per-process CPU fraction over samples taken within
    /// `window`, or `None` if no samples fall in that window yet --
    /// matching the original's `if not DNewProcAvg: continue`.
    fn average_cpu_per_process(&self, window: Duration) -> Option<f64> {
        let cutoff = Instant::now().checked_sub(window)?;
        let in_window: Vec<&Sample> = self.samples.iter().filter(|s| s.at >= cutoff).collect();
        if in_window.is_empty() {
            return None;
        }
        let n = in_window.len() as f64;
        let avg_total: f64 = in_window.iter().map(|s| s.cpu_fraction_total).sum::<f64>() / n;
        let avg_procs: f64 =
            in_window.iter().map(|s| s.num_processes as f64).sum::<f64>() / n;
        Some(avg_total / avg_procs.max(1.0))
    }

    fn spawn_worker(&mut self) -> Result<(), SupervisorError> {
        let child = (self.spawn)()?;
        let pid = child.id() as i32;
        self.workers.push(WorkerRecord { pid });
        self.last_op_time = Instant::now();
        log::info!("{}: spawned worker pid={pid}", self.name);
        Ok(())
    }

    fn remove_newest_worker(&mut self) {
        let Some(worker) = self.workers.pop() else {
            return;
        };
        self.last_op_time = Instant::now();
        self.kill_gracefully(worker.pid);
    }

    /// `SIGINT` -> wait up to 100s for a graceful exit -> `SIGTERM` ->
    /// `waitpid`. Mirrors `remove_child_process` in the original.
    fn kill_gracefully(&self, pid: i32) {
        if unsafe { libc::kill(pid, 0) } != 0 {
            return;
        }
        let _ = signal::kill(Pid::from_raw(pid), Signal::SIGINT);

        let deadline = Instant::now() + Duration::from_secs(MAX_SECS_TO_WAIT_AFTER_SIGINT);
        while Instant::now() < deadline {
            if unsafe { libc::kill(pid, 0) } != 0 {
                break;
            }
            if let Ok(WaitStatus::Exited(_, _) | WaitStatus::Signaled(_, _, _)) =
                waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG))
            {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        if unsafe { libc::kill(pid, 0) } == 0 {
            log::warn!(
                "{}: worker pid={pid} did not exit after SIGINT, sending SIGTERM",
                self.name
            );
            let _ = signal::kill(Pid::from_raw(pid), Signal::SIGTERM);
        }

        let _ = waitpid(Pid::from_raw(pid), None);
    }

    /// Immediately signal and reap every worker, skipping the graceful
    /// wait. Used for whole-registry shutdown, not routine scale-down.
    pub fn shutdown_all(&mut self) {
        for worker in self.workers.drain(..) {
            let _ = signal::kill(Pid::from_raw(worker.pid), Signal::SIGINT);
        }
        std::thread::sleep(Duration::from_secs(2));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> SupervisorConfig {
        SupervisorConfig {
            min_procs: 1,
            max_procs: 4,
            max_mem_bytes: None,
            scale_up_threshold: 0.5,
            scale_up_window: Duration::from_secs(20),
            scale_down_window: Duration::from_secs(60),
        }
    }

    #[test]
    fn enforce_floor_spawns_up_to_min_procs() {
        let mut supervisor = Supervisor::new("test", test_config(), || {
            std::process::Command::new("sleep").arg("60").spawn()
        });
        supervisor.enforce_floor().unwrap();
        assert_eq!(supervisor.worker_count(), 1);
        supervisor.shutdown_all();
    }

    #[test]
    fn reap_zombies_removes_dead_pids() {
        let mut supervisor = Supervisor::new("test", test_config(), || {
            std::process::Command::new("true").spawn()
        });
        supervisor.spawn_worker().unwrap();
        std::thread::sleep(Duration::from_millis(200));
        supervisor.reap_zombies();
        assert_eq!(supervisor.worker_count(), 0);
    }

    #[test]
    fn average_cpu_per_process_is_none_without_samples() {
        let supervisor = Supervisor::new("test", test_config(), || {
            std::process::Command::new("true").spawn()
        });
        assert!(supervisor
            .average_cpu_per_process(Duration::from_secs(20))
            .is_none());
    }
}
