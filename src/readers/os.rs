//! Operating-system metrics
//!
//! Readers query an [`OsSource`]. [`SystemSource`] is the real implementation:
//! `sysinfo` for CPU, network counters and boot time, and procfs for memory,
//! per-process thread counts and socket table sizes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use sysinfo::{Networks, System, MINIMUM_CPU_UPDATE_INTERVAL};

use crate::error::SensorError;
use crate::group::ReaderGroup;
use crate::logging::Logger;
use crate::metric::{bytes_to_gib, bytes_to_mib, round_to, Metric, DEFAULT_DECIMALS};
use crate::reader::SensorReader;

/// Sampling window of the CPU usage reader
pub const CPU_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// Physical memory figures in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    pub used: u64,
    pub active: u64,
    pub total: u64,
}

/// Cumulative network I/O since boot, all interfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

/// Source of operating-system figures
pub trait OsSource: Send + Sync {
    /// System-wide CPU usage in percent, measured over `window` (blocks)
    fn cpu_percent(&self, window: Duration) -> Result<f64, SensorError>;

    fn memory(&self) -> Result<MemoryStats, SensorError>;

    /// Ids of all visible processes
    fn process_ids(&self) -> Result<Vec<u32>, SensorError>;

    /// Thread count of one process; fails if the process is gone
    fn thread_count(&self, pid: u32) -> Result<u64, SensorError>;

    fn network_counters(&self) -> Result<NetworkCounters, SensorError>;

    /// Number of open inet sockets
    fn connection_count(&self) -> Result<u64, SensorError>;

    /// Boot time in seconds since the Unix epoch
    fn boot_time_secs(&self) -> Result<u64, SensorError>;
}

/// Reader for a procfs tree
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, relative: impl AsRef<Path>) -> Result<String, SensorError> {
        let path = self.root.join(relative);
        fs::read_to_string(&path).map_err(|e| SensorError::from_io(path.display().to_string(), &e))
    }

    /// Numeric entries of the procfs root
    pub fn process_ids(&self) -> Result<Vec<u32>, SensorError> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| SensorError::from_io(self.root.display().to_string(), &e))?;
        Ok(entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect())
    }

    /// `Threads:` field of `<pid>/status`
    pub fn thread_count(&self, pid: u32) -> Result<u64, SensorError> {
        let status = self.read(format!("{}/status", pid))?;
        status
            .lines()
            .find_map(|line| line.strip_prefix("Threads:"))
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| SensorError::parse(format!("process {} status", pid), "Threads"))
    }

    /// Physical memory from `meminfo`, in bytes
    ///
    /// Used memory is total minus free, buffers and page cache (including
    /// reclaimable slab). When that goes negative, as on some containers,
    /// it falls back to total minus free.
    pub fn memory(&self) -> Result<MemoryStats, SensorError> {
        let meminfo = self.read("meminfo")?;
        let required = |field: &str| {
            meminfo_kib(&meminfo, field).ok_or_else(|| SensorError::parse("meminfo", field))
        };
        let total = required("MemTotal")?;
        let free = required("MemFree")?;
        let active = required("Active")?;
        if total == 0 {
            return Err(SensorError::unavailable("meminfo", "MemTotal reported as 0"));
        }

        let buffers = meminfo_kib(&meminfo, "Buffers").unwrap_or(0);
        let cached = meminfo_kib(&meminfo, "Cached").unwrap_or(0)
            + meminfo_kib(&meminfo, "SReclaimable").unwrap_or(0);
        let used = total
            .checked_sub(free + buffers + cached)
            .unwrap_or_else(|| total.saturating_sub(free));

        Ok(MemoryStats {
            used: used * 1024,
            active: active * 1024,
            total: total * 1024,
        })
    }

    /// Entries of the tcp/udp socket tables, IPv4 and IPv6
    pub fn connection_count(&self) -> Result<u64, SensorError> {
        let mut total = 0u64;
        let mut readable = 0;
        for table in ["net/tcp", "net/tcp6", "net/udp", "net/udp6"] {
            // IPv6 tables are missing on kernels without IPv6.
            if let Ok(contents) = self.read(table) {
                readable += 1;
                total += contents
                    .lines()
                    .skip(1)
                    .filter(|line| !line.trim().is_empty())
                    .count() as u64;
            }
        }
        if readable == 0 {
            return Err(SensorError::unavailable(
                format!("{}/net", self.root.display()),
                "no socket table readable",
            ));
        }
        Ok(total)
    }
}

fn meminfo_kib(meminfo: &str, field: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key != field {
            return None;
        }
        value.trim().trim_end_matches("kB").trim().parse().ok()
    })
}

/// Live system source
pub struct SystemSource {
    system: Mutex<System>,
    procfs: ProcFs,
}

impl SystemSource {
    pub fn new() -> Self {
        Self::with_procfs(ProcFs::default())
    }

    pub fn with_procfs(procfs: ProcFs) -> Self {
        Self {
            system: Mutex::new(System::new()),
            procfs,
        }
    }
}

impl Default for SystemSource {
    fn default() -> Self {
        Self::new()
    }
}

impl OsSource for SystemSource {
    fn cpu_percent(&self, window: Duration) -> Result<f64, SensorError> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_cpu_usage();
        thread::sleep(window.max(MINIMUM_CPU_UPDATE_INTERVAL));
        system.refresh_cpu_usage();
        Ok(system.global_cpu_info().cpu_usage() as f64)
    }

    fn memory(&self) -> Result<MemoryStats, SensorError> {
        self.procfs.memory()
    }

    fn process_ids(&self) -> Result<Vec<u32>, SensorError> {
        self.procfs.process_ids()
    }

    fn thread_count(&self, pid: u32) -> Result<u64, SensorError> {
        self.procfs.thread_count(pid)
    }

    fn network_counters(&self) -> Result<NetworkCounters, SensorError> {
        let networks = Networks::new_with_refreshed_list();
        let mut counters = NetworkCounters::default();
        for (_, data) in networks.iter() {
            counters.bytes_sent += data.total_transmitted();
            counters.bytes_recv += data.total_received();
        }
        Ok(counters)
    }

    fn connection_count(&self) -> Result<u64, SensorError> {
        self.procfs.connection_count()
    }

    fn boot_time_secs(&self) -> Result<u64, SensorError> {
        match System::boot_time() {
            0 => Err(SensorError::unavailable("boot time", "not reported")),
            secs => Ok(secs),
        }
    }
}

/// `uptime`: hours since boot
pub struct UptimeReader {
    source: Arc<dyn OsSource>,
}

impl UptimeReader {
    pub fn new(source: Arc<dyn OsSource>) -> Self {
        Self { source }
    }
}

impl SensorReader for UptimeReader {
    fn label(&self) -> &str {
        "uptime"
    }

    fn metric_names(&self) -> Vec<String> {
        vec!["uptime".to_string()]
    }

    fn read(&mut self) -> Result<Vec<Metric>, SensorError> {
        let boot = self.source.boot_time_secs()? as f64;
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        let hours = (now - boot).max(0.0) / 3600.0;
        Ok(vec![Metric::new("uptime", round_to(hours, DEFAULT_DECIMALS))])
    }
}

/// `process`: number of visible processes
pub struct ProcessCountReader {
    source: Arc<dyn OsSource>,
}

impl ProcessCountReader {
    pub fn new(source: Arc<dyn OsSource>) -> Self {
        Self { source }
    }
}

impl SensorReader for ProcessCountReader {
    fn label(&self) -> &str {
        "total processes"
    }

    fn metric_names(&self) -> Vec<String> {
        vec!["process".to_string()]
    }

    fn read(&mut self) -> Result<Vec<Metric>, SensorError> {
        let count = self.source.process_ids()?.len() as i64;
        Ok(vec![Metric::new("process", count)])
    }
}

/// `thread`: threads summed across all processes
///
/// Processes that exit during enumeration are skipped.
pub struct ThreadCountReader {
    source: Arc<dyn OsSource>,
}

impl ThreadCountReader {
    pub fn new(source: Arc<dyn OsSource>) -> Self {
        Self { source }
    }
}

impl SensorReader for ThreadCountReader {
    fn label(&self) -> &str {
        "active threads"
    }

    fn metric_names(&self) -> Vec<String> {
        vec!["thread".to_string()]
    }

    fn read(&mut self) -> Result<Vec<Metric>, SensorError> {
        let total: u64 = self
            .source
            .process_ids()?
            .into_iter()
            .filter_map(|pid| self.source.thread_count(pid).ok())
            .sum();
        Ok(vec![Metric::new("thread", total as i64)])
    }
}

/// `cpu`: usage percent over [`CPU_SAMPLE_WINDOW`]
pub struct CpuReader {
    source: Arc<dyn OsSource>,
    window: Duration,
}

impl CpuReader {
    pub fn new(source: Arc<dyn OsSource>) -> Self {
        Self {
            source,
            window: CPU_SAMPLE_WINDOW,
        }
    }
}

impl SensorReader for CpuReader {
    fn label(&self) -> &str {
        "CPU usage"
    }

    fn metric_names(&self) -> Vec<String> {
        vec!["cpu".to_string()]
    }

    fn read(&mut self) -> Result<Vec<Metric>, SensorError> {
        let percent = self.source.cpu_percent(self.window)?;
        Ok(vec![Metric::new("cpu", round_to(percent, DEFAULT_DECIMALS))])
    }
}

/// `ram.used`, `ram.active`, `ram.total` in GiB
pub struct MemoryReader {
    source: Arc<dyn OsSource>,
}

impl MemoryReader {
    pub fn new(source: Arc<dyn OsSource>) -> Self {
        Self { source }
    }
}

impl SensorReader for MemoryReader {
    fn label(&self) -> &str {
        "RAM info"
    }

    fn metric_names(&self) -> Vec<String> {
        vec![
            "ram.used".to_string(),
            "ram.active".to_string(),
            "ram.total".to_string(),
        ]
    }

    fn read(&mut self) -> Result<Vec<Metric>, SensorError> {
        let memory = self.source.memory()?;
        Ok(vec![
            Metric::new("ram.used", bytes_to_gib(memory.used, DEFAULT_DECIMALS)),
            Metric::new("ram.active", bytes_to_gib(memory.active, DEFAULT_DECIMALS)),
            Metric::new("ram.total", bytes_to_gib(memory.total, DEFAULT_DECIMALS)),
        ])
    }
}

/// `network.send`, `network.receive` in MiB and `network.connection`
pub struct NetworkReader {
    source: Arc<dyn OsSource>,
}

impl NetworkReader {
    pub fn new(source: Arc<dyn OsSource>) -> Self {
        Self { source }
    }
}

impl SensorReader for NetworkReader {
    fn label(&self) -> &str {
        "network info"
    }

    fn metric_names(&self) -> Vec<String> {
        vec![
            "network.send".to_string(),
            "network.receive".to_string(),
            "network.connection".to_string(),
        ]
    }

    fn read(&mut self) -> Result<Vec<Metric>, SensorError> {
        let counters = self.source.network_counters()?;
        let connections = self.source.connection_count()?;
        Ok(vec![
            Metric::new("network.send", bytes_to_mib(counters.bytes_sent, DEFAULT_DECIMALS)),
            Metric::new("network.receive", bytes_to_mib(counters.bytes_recv, DEFAULT_DECIMALS)),
            Metric::new("network.connection", connections as i64),
        ])
    }
}

/// OS-metrics group: uptime, process, thread, cpu, ram, network
pub fn os_group(name: impl Into<String>, source: Arc<dyn OsSource>, logger: Logger) -> ReaderGroup {
    ReaderGroup::new(name, logger)
        .with_reader(UptimeReader::new(source.clone()))
        .with_reader(ProcessCountReader::new(source.clone()))
        .with_reader(ThreadCountReader::new(source.clone()))
        .with_reader(CpuReader::new(source.clone()))
        .with_reader(MemoryReader::new(source.clone()))
        .with_reader(NetworkReader::new(source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fake_proc() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let root = dir.path();
        for (pid, threads) in [(1, 1), (42, 7), (1337, 3)] {
            fs::create_dir_all(root.join(pid.to_string())).unwrap();
            fs::write(
                root.join(format!("{}/status", pid)),
                format!("Name:\tproc\nState:\tS (sleeping)\nThreads:\t{}\n", threads),
            )
            .unwrap();
        }
        fs::create_dir_all(root.join("sys")).unwrap();
        fs::create_dir_all(root.join("net")).unwrap();
        fs::write(
            root.join("meminfo"),
            "MemTotal:        4194304 kB\nMemFree:         1048576 kB\nBuffers:          262144 kB\nCached:          1572864 kB\nSReclaimable:     262144 kB\nActive:          1048576 kB\nInactive:         524288 kB\n",
        )
        .unwrap();
        fs::write(
            root.join("net/tcp"),
            "  sl  local_address rem_address   st\n   0: 00000000:0016 00000000:0000 0A\n   1: 0100007F:0277 00000000:0000 0A\n",
        )
        .unwrap();
        fs::write(
            root.join("net/udp"),
            "  sl  local_address rem_address   st\n   0: 00000000:0044 00000000:0000 07\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_procfs_process_ids() {
        let dir = fake_proc();
        let mut pids = ProcFs::new(dir.path()).process_ids().unwrap();
        pids.sort_unstable();
        assert_eq!(pids, vec![1, 42, 1337]);
    }

    #[test]
    fn test_procfs_thread_count() {
        let dir = fake_proc();
        let procfs = ProcFs::new(dir.path());
        assert_eq!(procfs.thread_count(42).unwrap(), 7);
        assert!(matches!(
            procfs.thread_count(999),
            Err(SensorError::SourceUnavailable { .. })
        ));
    }

    #[test]
    fn test_procfs_memory_excludes_cache() {
        let dir = fake_proc();
        let memory = ProcFs::new(dir.path()).memory().unwrap();
        assert_eq!(memory.total, 4 * 1_073_741_824);
        // 4 GiB - 1 GiB free - 0.25 GiB buffers - (1.5 + 0.25) GiB cache
        assert_eq!(memory.used, 1_073_741_824);
        assert_eq!(memory.active, 1_073_741_824);
    }

    #[test]
    fn test_procfs_memory_falls_back_to_total_minus_free() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("meminfo"),
            "MemTotal: 2097152 kB\nMemFree: 1048576 kB\nCached: 2097152 kB\nActive: 524288 kB\n",
        )
        .unwrap();
        let memory = ProcFs::new(dir.path()).memory().unwrap();
        assert_eq!(memory.used, 1_073_741_824);
    }

    #[test]
    fn test_procfs_memory_requires_totals() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("meminfo"), "MemFree: 1048576 kB\nActive: 1 kB\n").unwrap();
        assert!(matches!(
            ProcFs::new(dir.path()).memory(),
            Err(SensorError::ParseFailure { .. })
        ));
    }

    #[test]
    fn test_procfs_connection_count_skips_missing_tables() {
        let dir = fake_proc();
        assert_eq!(ProcFs::new(dir.path()).connection_count().unwrap(), 3);
    }

    #[test]
    fn test_procfs_connection_count_without_tables() {
        let dir = tempdir().unwrap();
        assert!(ProcFs::new(dir.path()).connection_count().is_err());
    }

    #[test]
    fn test_thread_reader_on_procfs() {
        let dir = fake_proc();
        let source = SystemSource::with_procfs(ProcFs::new(dir.path()));
        let mut reader = ThreadCountReader::new(Arc::new(source));
        assert_eq!(reader.read().unwrap(), vec![Metric::new("thread", 11i64)]);
    }

    #[test]
    fn test_os_group_order() {
        let source: Arc<dyn OsSource> = Arc::new(SystemSource::new());
        let group = os_group("os_info", source, Logger::disabled("os_info"));
        assert_eq!(
            group.metric_names(),
            vec![
                "uptime",
                "process",
                "thread",
                "cpu",
                "ram.used",
                "ram.active",
                "ram.total",
                "network.send",
                "network.receive",
                "network.connection",
            ]
        );
    }
}
