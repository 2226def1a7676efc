//! Resource probes for the manager process itself.

use fleet_core::types::ProcessSnapshot;
use sysinfo::{Pid, System};

pub trait ResourceProbe: Send {
    fn sample(&mut self) -> ProcessSnapshot;
}

/// Samples the current process through `sysinfo`.
///
/// CPU usage is measured between two refreshes, so the first sample
/// reports zero.
pub struct SysinfoProbe {
    system: System,
    pid: Pid,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&mut self) -> ProcessSnapshot {
        self.system.refresh_process(self.pid);
        match self.system.process(self.pid) {
            Some(process) => ProcessSnapshot {
                pid: self.pid.as_u32(),
                memory_bytes: process.memory(),
                virtual_memory_bytes: process.virtual_memory(),
                cpu_usage: f64::from(process.cpu_usage()),
                threads: 0,
            },
            None => ProcessSnapshot {
                pid: self.pid.as_u32(),
                ..ProcessSnapshot::default()
            },
        }
    }
}

/// Always reports the same snapshot.
#[derive(Debug, Clone, Default)]
pub struct FixedProbe(pub ProcessSnapshot);

impl FixedProbe {
    pub fn with_cpu(cpu_usage: f64) -> Self {
        Self(ProcessSnapshot {
            cpu_usage,
            ..ProcessSnapshot::default()
        })
    }
}

impl ResourceProbe for FixedProbe {
    fn sample(&mut self) -> ProcessSnapshot {
        self.0.clone()
    }
}
