//! Resource usage of a VM's QEMU process: CPU, resident memory and disk
//! I/O since the previous sample.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use sysinfo::{Pid, System};

const MIB: f64 = 1024.0 * 1024.0;

/// Gap between the two refreshes of a first sample; sysinfo derives CPU
/// usage from the delta.
const CPU_SETTLE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmMetrics {
    pub vm_id: String,
    pub pid: u32,
    /// Percent of one core, so above 100 for busy multi-vCPU guests.
    pub cpu_percent: f32,
    pub memory_mb: f64,
    /// Resident memory against the configured guest memory.
    pub memory_percent: f64,
    /// MiB read and written since the previous sample of the same process.
    pub io_read_mb: f64,
    pub io_write_mb: f64,
}

#[derive(Debug, Clone, Copy)]
struct IoMark {
    pid: u32,
    read: u64,
    written: u64,
}

/// Keeps the process table and I/O baselines between samples; CPU usage
/// and I/O deltas are relative to the previous refresh.
pub struct MetricsSampler {
    sys: Mutex<System>,
    io_marks: Mutex<HashMap<String, IoMark>>,
}

impl Default for MetricsSampler {
    fn default() -> Self {
        Self {
            sys: Mutex::new(System::new()),
            io_marks: Mutex::new(HashMap::new()),
        }
    }
}

impl MetricsSampler {
    /// Sample `pid` on behalf of `vm_id`. `None` once the process is gone.
    ///
    /// The first sample of a process refreshes twice, a CPU interval apart,
    /// and reports zero I/O. I/O counters the kernel withholds (a process
    /// of another user) read as zero.
    pub fn sample(&self, vm_id: &str, pid: u32, configured_mb: u32) -> Option<VmMetrics> {
        let spid = Pid::from_u32(pid);
        let mut sys = self.sys.lock();
        let known = sys.process(spid).is_some();
        if !sys.refresh_process(spid) {
            self.forget(vm_id);
            return None;
        }
        if !known {
            std::thread::sleep(CPU_SETTLE);
            if !sys.refresh_process(spid) {
                self.forget(vm_id);
                return None;
            }
        }
        let process = sys.process(spid)?;
        let disk = process.disk_usage();
        let now = IoMark {
            pid,
            read: disk.total_read_bytes,
            written: disk.total_written_bytes,
        };
        let prev = self
            .io_marks
            .lock()
            .insert(vm_id.to_string(), now)
            .filter(|m| m.pid == pid)
            .unwrap_or(now);

        let memory_mb = process.memory() as f64 / MIB;
        let memory_percent = if configured_mb > 0 {
            memory_mb / f64::from(configured_mb) * 100.0
        } else {
            0.0
        };
        Some(VmMetrics {
            vm_id: vm_id.to_string(),
            pid,
            cpu_percent: (process.cpu_usage() * 10.0).round() / 10.0,
            memory_mb: round(memory_mb, 1),
            memory_percent: round(memory_percent, 1),
            io_read_mb: round(now.read.saturating_sub(prev.read) as f64 / MIB, 2),
            io_write_mb: round(now.written.saturating_sub(prev.written) as f64 / MIB, 2),
        })
    }

    /// Drop the I/O baseline of a VM whose process ended.
    pub fn forget(&self, vm_id: &str) {
        self.io_marks.lock().remove(vm_id);
    }
}

fn round(v: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (v * scale).round() / scale
}
