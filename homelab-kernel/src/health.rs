use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

use crate::dispatch::Dispatcher;
use crate::inventory::Inventory;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub hosts_tracked: u32,
    pub groups_tracked: u32,
    pub tools_registered: u32,
    pub tool_calls: u64,
    pub memory_usage_mb: Option<f32>,
    /// préfixe -> cache de résolution peuplé ?
    pub caches: BTreeMap<String, bool>,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn get_health(&self, dispatcher: &Dispatcher, inventory: &Inventory) -> KernelHealth {
        let caches = dispatcher
            .servers()
            .iter()
            .map(|s| (s.prefix().trim_end_matches('_').to_string(), s.cache_populated()))
            .collect();

        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            hosts_tracked: inventory.hosts.len() as u32,
            groups_tracked: inventory.groups.len() as u32,
            tools_registered: dispatcher.tool_count() as u32,
            tool_calls: dispatcher.calls(),
            memory_usage_mb: get_memory_usage_mb(),
            caches,
        }
    }
}

/// RSS du process via /proc (Linux seulement).
fn get_memory_usage_mb() -> Option<f32> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let kb = status
            .lines()
            .find(|line| line.starts_with("VmRSS:"))?
            .split_whitespace()
            .nth(1)?
            .parse::<u64>()
            .ok()?;
        Some(kb as f32 / 1024.0)
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_kernel_health() {
        let tracker = HealthTracker::new();
        let health = tracker.get_health(&Dispatcher::new(), &Inventory::default());

        assert_eq!(health.hosts_tracked, 0);
        assert_eq!(health.tools_registered, 1); // catalogue seul
        assert_eq!(health.tool_calls, 0);
        assert!(health.caches.is_empty());
    }
}
