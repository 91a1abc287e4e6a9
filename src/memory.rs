// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Process memory probe used by the consumer's memory ceiling.

use std::sync::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::warn;

/// Reports how much memory the current process uses.
pub trait MemoryProbe: Send + Sync {
    /// Resident memory in bytes; 0 when it cannot be measured.
    fn current_usage(&self) -> u64;
}

impl<F> MemoryProbe for F
where
    F: Fn() -> u64 + Send + Sync,
{
    fn current_usage(&self) -> u64 {
        self()
    }
}

/// [`MemoryProbe`] backed by sysinfo's view of the current process.
pub struct ProcessMemory {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessMemory {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                warn!(error = err, "failed to get current process id, memory limit disabled");
                None
            }
        };

        ProcessMemory {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemory {
    fn current_usage(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        let Ok(mut system) = self.system.lock() else {
            return 0;
        };

        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}
