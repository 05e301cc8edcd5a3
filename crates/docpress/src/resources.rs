//! Process-level resource sampling for the health monitor.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    /// Open handles (file descriptors) held by this process.
    pub handle_count: u64,
    /// Resident set size in bytes.
    pub memory_bytes: u64,
}

pub trait ResourceSampler: Send + Sync + 'static {
    fn sample(&self) -> std::io::Result<ResourceUsage>;
}

/// Samples the current process through `/proc/self`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcSampler;

impl ResourceSampler for ProcSampler {
    #[cfg(target_os = "linux")]
    fn sample(&self) -> std::io::Result<ResourceUsage> {
        let status = std::fs::read_to_string("/proc/self/status")?;
        let memory_bytes = parse_vm_rss(&status).unwrap_or(0);
        let handle_count = std::fs::read_dir("/proc/self/fd")?.count() as u64;
        Ok(ResourceUsage {
            handle_count,
            memory_bytes,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&self) -> std::io::Result<ResourceUsage> {
        Ok(ResourceUsage::default())
    }
}

/// Extract `VmRSS` from `/proc/<pid>/status` content, in bytes.
pub fn parse_vm_rss(status: &str) -> Option<u64> {
    parse_kib_field(status, "VmRSS:")
}

fn parse_kib_field(text: &str, field: &str) -> Option<u64> {
    let line = text.lines().find(|l| l.starts_with(field))?;
    let kib: u64 = line[field.len()..].split_whitespace().next()?.parse().ok()?;
    Some(kib * 1024)
}

/// Total physical memory, if the platform exposes it.
pub fn system_memory_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_kib_field(&meminfo, "MemTotal:")
}

/// Logical CPU count, defaulting to 1.
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vm_rss() {
        let status = "Name:\tdocpress\nVmPeak:\t  200000 kB\nVmRSS:\t   12345 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss(status), Some(12345 * 1024));
    }

    #[test]
    fn missing_vm_rss() {
        assert_eq!(parse_vm_rss("Name:\tkthreadd\n"), None);
        assert_eq!(parse_vm_rss("VmRSS:\tgarbage kB\n"), None);
    }

    #[test]
    fn meminfo_total() {
        let meminfo = "MemTotal:       16303412 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_kib_field(meminfo, "MemTotal:"), Some(16303412 * 1024));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn samples_current_process() {
        let usage = ProcSampler.sample().unwrap();
        assert!(usage.memory_bytes > 0);
        assert!(usage.handle_count > 0);
    }
}
