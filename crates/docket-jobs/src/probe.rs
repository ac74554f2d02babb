//! Process memory usage.

/// Reports the worker's resident memory.
pub trait MemoryProbe: Send + Sync {
    /// Resident memory in MiB, or `None` when it cannot be determined.
    fn resident_mib(&self) -> Option<u64>;

    /// Whether usage has reached `limit_mib`. Unknown usage never does.
    fn exceeds(&self, limit_mib: u64) -> bool {
        self.resident_mib().is_some_and(|used| used >= limit_mib)
    }
}

/// Reads `VmRSS` from `/proc/self/status`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcMemoryProbe;

impl MemoryProbe for ProcMemoryProbe {
    fn resident_mib(&self) -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss_kib(&status).map(|kib| kib / 1024)
    }
}

fn parse_vm_rss_kib(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kib| kib.parse().ok())
}
