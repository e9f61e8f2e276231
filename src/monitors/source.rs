//! Operating system readings consumed by the monitors

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use sysinfo::{Disks, Networks, Pid, ProcessesToUpdate, System};
use tokio::time::Instant;
use tracing::trace;

use crate::error::{ScalingError, ScalingResult};

/// One raw reading of the host
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemReadings {
    /// Global CPU usage in percent
    pub cpu_percent: f64,
    pub memory_total: u64,
    pub memory_available: u64,
    /// Resident memory of this process
    pub process_memory: u64,
    pub disk_total: u64,
    pub disk_available: u64,
    pub network_bytes_per_sec: f64,
}

impl SystemReadings {
    pub fn memory_percent(&self) -> f64 {
        if self.memory_total == 0 {
            return 0.0;
        }
        (1.0 - self.memory_available as f64 / self.memory_total as f64) * 100.0
    }

    pub fn disk_percent(&self) -> f64 {
        if self.disk_total == 0 {
            return 0.0;
        }
        (1.0 - self.disk_available as f64 / self.disk_total as f64) * 100.0
    }

    /// Synthetic reading on a 16 GiB host with a 1 TiB disk
    pub fn with_usage(cpu_percent: f64, memory_percent: f64) -> Self {
        const MEMORY: u64 = 16 * 1024 * 1024 * 1024;
        const DISK: u64 = 1024 * 1024 * 1024 * 1024;
        let used = (MEMORY as f64 * memory_percent.clamp(0.0, 100.0) / 100.0) as u64;
        Self {
            cpu_percent,
            memory_total: MEMORY,
            memory_available: MEMORY - used,
            process_memory: 256 * 1024 * 1024,
            disk_total: DISK,
            disk_available: DISK / 2,
            network_bytes_per_sec: 0.0,
        }
    }
}

/// Source of host readings
pub trait MetricsSource: Send {
    fn read(&mut self) -> ScalingResult<SystemReadings>;
}

impl std::fmt::Debug for dyn MetricsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MetricsSource")
    }
}

/// Source shared between the resource monitor and the memory manager
pub type SharedMetricsSource = Arc<Mutex<Box<dyn MetricsSource>>>;

pub fn shared(source: impl MetricsSource + 'static) -> SharedMetricsSource {
    Arc::new(Mutex::new(Box::new(source)))
}

/// Read from a shared source, treating a poisoned lock as a failed sample
pub fn read_shared(source: &SharedMetricsSource) -> ScalingResult<SystemReadings> {
    let mut guard = source
        .lock()
        .map_err(|_| ScalingError::MonitoringSample("metrics source lock poisoned".to_string()))?;
    guard.read()
}

/// Readings of the local host via `sysinfo`
pub struct SystemMetricsSource {
    system: System,
    disks: Disks,
    networks: Networks,
    pid: Option<Pid>,
    last_network_refresh: Instant,
}

impl SystemMetricsSource {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();

        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            pid: sysinfo::get_current_pid().ok(),
            last_network_refresh: Instant::now(),
        }
    }

    fn primary_disk(&self) -> Option<(u64, u64)> {
        let disks = self.disks.list();
        let root = disks
            .iter()
            .find(|disk| disk.mount_point() == std::path::Path::new("/"));
        root.or_else(|| disks.iter().max_by_key(|disk| disk.total_space()))
            .map(|disk| (disk.total_space(), disk.available_space()))
    }
}

impl Default for SystemMetricsSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SystemMetricsSource {
    fn read(&mut self) -> ScalingResult<SystemReadings> {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.disks.refresh(true);
        self.networks.refresh(true);

        let memory_total = self.system.total_memory();
        if memory_total == 0 {
            return Err(ScalingError::MonitoringSample(
                "memory information unavailable".to_string(),
            ));
        }

        let process_memory = match self.pid {
            Some(pid) => {
                self.system
                    .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                self.system.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            None => 0,
        };

        let (disk_total, disk_available) = self.primary_disk().unwrap_or((0, 0));

        let elapsed = self.last_network_refresh.elapsed().as_secs_f64();
        self.last_network_refresh = Instant::now();
        let transferred: u64 = self
            .networks
            .list()
            .values()
            .map(|data| data.received() + data.transmitted())
            .sum();
        let network_bytes_per_sec = if elapsed > 0.0 {
            transferred as f64 / elapsed
        } else {
            0.0
        };

        let readings = SystemReadings {
            cpu_percent: self.system.global_cpu_usage() as f64,
            memory_total,
            memory_available: self.system.available_memory(),
            process_memory,
            disk_total,
            disk_available,
            network_bytes_per_sec,
        };
        trace!("system readings: {readings:?}");
        Ok(readings)
    }
}

/// Replays queued readings; repeats the last successful one once drained
///
/// Clones share the same queue so a test can keep feeding a source that was
/// handed to a monitor.
#[derive(Clone, Default)]
pub struct ScriptedMetricsSource {
    inner: Arc<Mutex<ScriptedState>>,
}

#[derive(Default)]
struct ScriptedState {
    queue: VecDeque<Option<SystemReadings>>,
    last: Option<SystemReadings>,
}

impl ScriptedMetricsSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steady(readings: SystemReadings) -> Self {
        let source = Self::new();
        source.set(readings);
        source
    }

    /// Queue one reading
    pub fn push(&self, readings: SystemReadings) {
        if let Ok(mut state) = self.inner.lock() {
            state.queue.push_back(Some(readings));
        }
    }

    /// Queue one failed sample
    pub fn push_failure(&self) {
        if let Ok(mut state) = self.inner.lock() {
            state.queue.push_back(None);
        }
    }

    /// Replace the queue with a reading that repeats indefinitely
    pub fn set(&self, readings: SystemReadings) {
        if let Ok(mut state) = self.inner.lock() {
            state.queue.clear();
            state.last = Some(readings);
        }
    }
}

impl MetricsSource for ScriptedMetricsSource {
    fn read(&mut self) -> ScalingResult<SystemReadings> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| ScalingError::MonitoringSample("scripted source poisoned".to_string()))?;

        match state.queue.pop_front() {
            Some(Some(readings)) => {
                state.last = Some(readings);
                Ok(readings)
            }
            Some(None) => Err(ScalingError::MonitoringSample(
                "scripted failure".to_string(),
            )),
            None => state.last.ok_or_else(|| {
                ScalingError::MonitoringSample("no scripted readings".to_string())
            }),
        }
    }
}
