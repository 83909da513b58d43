// PHASECTL LINUX PERF BACKEND
// OPENS THE PROFILE'S RAW EVENTS AS ONE COUNTER GROUP PER ACTIVE CPU
// (SYSTEM-WIDE, pid = -1). THE GROUP LEADER GATES ENABLE/DISABLE/RESET FOR
// ALL MEMBERS SO EVERY EVENT IN A CYCLE COVERS THE SAME WINDOW.
//
// OPTIONAL EVENTS THE PMU DOES NOT MAP KEEP THEIR SLOT AND READ AS 0.
// A GROUP THAT WAS ENABLED BUT NEVER SCHEDULED IS AN ACQUISITION ERROR.
//
// NO PRE-AGGREGATED METRIC GROUPS: setup_group() ALWAYS REPORTS "NOT
// AVAILABLE" AND THE CONTROLLER RUNS IN RAW MODE.
//
// REQUIRES perf_event_paranoid <= 0 OR CAP_PERFMON.

use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd};

use log::{debug, info, warn};

use crate::counters::{CounterBackend, EventCode, EventSpec};
use crate::error::{Error, Result};

pub const PARANOID_PATH: &str = "/proc/sys/kernel/perf_event_paranoid";

const PERF_TYPE_HARDWARE: u32 = 0;
const PERF_TYPE_RAW: u32 = 4;

const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

// _IO('$', n)
const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;
const PERF_EVENT_IOC_DISABLE: u64 = 0x2401;
const PERF_EVENT_IOC_RESET: u64 = 0x2403;
const PERF_IOC_FLAG_GROUP: libc::c_ulong = 1;

const PERF_FORMAT_TOTAL_TIME_ENABLED: u64 = 1 << 0;
const PERF_FORMAT_TOTAL_TIME_RUNNING: u64 = 1 << 1;

// perf_event_attr BITFIELD
const ATTR_DISABLED: u64 = 1 << 0;
const ATTR_EXCLUDE_HV: u64 = 1 << 6;

// MATCHES struct perf_event_attr (PERF_ATTR_SIZE_VER5, 112 BYTES)
#[repr(C)]
#[derive(Default, Clone, Copy)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub _reserved_2: u16,
}

impl PerfEventAttr {
    pub fn counting(code: EventCode) -> Self {
        let (type_, config) = match code {
            EventCode::Hardware(id) => (PERF_TYPE_HARDWARE, id),
            EventCode::Raw(cfg) => (PERF_TYPE_RAW, cfg),
        };
        Self {
            type_,
            size: std::mem::size_of::<Self>() as u32,
            config,
            read_format: PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING,
            flags: ATTR_DISABLED | ATTR_EXCLUDE_HV,
            ..Default::default()
        }
    }
}

fn perf_event_open(attr: &PerfEventAttr, cpu: usize, group_fd: libc::c_int) -> std::io::Result<File> {
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            -1 as libc::pid_t,
            cpu as libc::c_int,
            group_fd,
            PERF_FLAG_FD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: THE KERNEL JUST HANDED US THIS FD; NOTHING ELSE OWNS IT
    Ok(unsafe { File::from_raw_fd(fd as libc::c_int) })
}

fn group_ioctl(leader: &File, request: u64) -> std::io::Result<()> {
    let rc = unsafe { libc::ioctl(leader.as_raw_fd(), request as _, PERF_IOC_FLAG_GROUP) };
    if rc < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

// read_format = TOTAL_TIME_ENABLED | TOTAL_TIME_RUNNING: { value, enabled, running }
const READ_BYTES: usize = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reading {
    pub value: u64,
    pub time_enabled: u64,
    pub time_running: u64,
}

impl Reading {
    pub fn decode(buf: &[u8; READ_BYTES]) -> Self {
        let word = |i: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&buf[i * 8..i * 8 + 8]);
            u64::from_ne_bytes(w)
        };
        Self { value: word(0), time_enabled: word(1), time_running: word(2) }
    }

    // None: ENABLED BUT NEVER ON THE PMU THIS WINDOW. THE ZERO COUNT IS NOT A MEASUREMENT.
    // MULTIPLEXED (running < enabled): SCALED UP TO THE FULL WINDOW.
    pub fn count(self) -> Option<f64> {
        if self.time_enabled > 0 && self.time_running == 0 {
            return None;
        }
        if self.time_running > 0 && self.time_running < self.time_enabled {
            Some(self.value as f64 * self.time_enabled as f64 / self.time_running as f64)
        } else {
            Some(self.value as f64)
        }
    }
}

// THE PMU DOES NOT MAP THIS EVENT
fn unsupported(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EOPNOTSUPP))
}

// ONE LEADER + MEMBERS ON A SINGLE CPU. ONE SLOT PER EVENT, IN ORDER;
// None = OPTIONAL EVENT THE PMU REJECTED. THE FIRST OPEN SLOT IS THE LEADER.
struct CpuGroup {
    cpu: usize,
    names: Vec<&'static str>,
    fds: Vec<Option<File>>,
}

impl CpuGroup {
    fn open(cpu: usize, events: &[EventSpec]) -> Result<Self> {
        Self::open_with(cpu, events, |attr, group_fd| perf_event_open(attr, cpu, group_fd))
    }

    fn open_with<F>(cpu: usize, events: &[EventSpec], mut open: F) -> Result<Self>
    where
        F: FnMut(&PerfEventAttr, libc::c_int) -> std::io::Result<File>,
    {
        let mut group = Self {
            cpu,
            names: events.iter().map(|e| e.name).collect(),
            fds: Vec::with_capacity(events.len()),
        };
        for ev in events {
            let leader_fd = group.leader().map(|f| f.as_raw_fd()).unwrap_or(-1);
            match open(&PerfEventAttr::counting(ev.code), leader_fd) {
                Ok(file) => group.fds.push(Some(file)),
                Err(e) if ev.optional && unsupported(&e) => {
                    debug!("PERF: cpu {}: {} NOT SUPPORTED ({}), READS AS 0", cpu, ev.name, e);
                    group.fds.push(None);
                }
                Err(e) => {
                    return Err(Error::Acquisition(format!("cpu {}: open {}: {}", cpu, ev.name, e)));
                }
            }
        }
        if group.leader().is_none() {
            return Err(Error::Acquisition(format!("cpu {}: no event could be opened", cpu)));
        }
        Ok(group)
    }

    fn leader(&self) -> Option<&File> {
        self.fds.iter().flatten().next()
    }

    fn missing(&self) -> Vec<&'static str> {
        self.names
            .iter()
            .zip(&self.fds)
            .filter(|(_, fd)| fd.is_none())
            .map(|(name, _)| *name)
            .collect()
    }

    fn read(&self) -> Result<Vec<f64>> {
        let mut out = Vec::with_capacity(self.fds.len());
        let mut buf = [0u8; READ_BYTES];
        for (name, slot) in self.names.iter().zip(&self.fds) {
            let Some(f) = slot else {
                out.push(0.0);
                continue;
            };
            let mut reader: &File = f;
            reader.read_exact(&mut buf)
                .map_err(|e| Error::Acquisition(format!("cpu {}: read {}: {}", self.cpu, name, e)))?;
            let reading = Reading::decode(&buf);
            let count = reading.count().ok_or_else(|| {
                Error::Acquisition(format!(
                    "cpu {}: {} enabled for {}ns but never scheduled on the PMU",
                    self.cpu, name, reading.time_enabled
                ))
            })?;
            out.push(count);
        }
        Ok(out)
    }
}

#[derive(Default)]
pub struct PerfCounters {
    contexts: Vec<usize>,
    groups: Vec<CpuGroup>,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paranoid_level() -> Option<i32> {
        std::fs::read_to_string(PARANOID_PATH).ok()?.trim().parse().ok()
    }

    fn each_leader(&self, request: u64, what: &str) -> Result<()> {
        for g in &self.groups {
            if let Some(leader) = g.leader() {
                group_ioctl(leader, request)
                    .map_err(|e| Error::Acquisition(format!("cpu {}: {}: {}", g.cpu, what, e)))?;
            }
        }
        Ok(())
    }
}

impl CounterBackend for PerfCounters {
    fn init(&mut self, contexts: &[usize]) -> Result<()> {
        if std::fs::metadata(PARANOID_PATH).is_err() {
            return Err(Error::StartupConfig("perf events not supported by this kernel".into()));
        }
        self.contexts = contexts.to_vec();
        info!("PERF: MONITORING {} CPUS (paranoid={:?})", contexts.len(), Self::paranoid_level());
        Ok(())
    }

    fn setup_group(&mut self, name: &str) -> Result<Option<usize>> {
        debug!("PERF: NO METRIC GROUP SUPPORT ({})", name);
        Ok(None)
    }

    fn setup_events(&mut self, events: &[EventSpec]) -> Result<()> {
        let mut groups = Vec::with_capacity(self.contexts.len());
        for &cpu in &self.contexts {
            // ON ERROR, groups DROPS AND CLOSES EVERYTHING OPENED SO FAR
            groups.push(CpuGroup::open(cpu, events)?);
        }
        if let Some(first) = groups.first() {
            let missing = first.missing();
            if !missing.is_empty() {
                warn!("PERF: PMU DOES NOT MAP {}, THOSE SLOTS READ AS 0", missing.join(", "));
            }
        }
        self.groups = groups;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.each_leader(PERF_EVENT_IOC_RESET, "reset")?;
        self.each_leader(PERF_EVENT_IOC_ENABLE, "enable")
    }

    fn stop(&mut self) -> Result<()> {
        self.each_leader(PERF_EVENT_IOC_DISABLE, "disable")
    }

    fn read_events(&mut self, context: usize) -> Result<Vec<f64>> {
        self.groups
            .iter()
            .find(|g| g.cpu == context)
            .ok_or_else(|| Error::Acquisition(format!("cpu {} is not monitored", context)))?
            .read()
    }

    fn read_metrics(&mut self, _context: usize) -> Result<Vec<f64>> {
        Err(Error::Acquisition("perf backend has no metric groups".into()))
    }

    fn finalize(&mut self) {
        // CLOSE IN REVERSE OPEN ORDER: MEMBERS BEFORE LEADERS, LAST CPU FIRST
        while let Some(mut g) = self.groups.pop() {
            while let Some(slot) = g.fds.pop() {
                drop(slot);
            }
        }
        self.contexts.clear();
    }
}

impl Drop for PerfCounters {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_layout_matches_kernel_ver5() {
        // PERF_ATTR_SIZE_VER5
        assert_eq!(std::mem::size_of::<PerfEventAttr>(), 112);
    }

    #[test]
    fn attr_encodes_type_and_config() {
        let hw = PerfEventAttr::counting(EventCode::Hardware(1));
        assert_eq!(hw.type_, PERF_TYPE_HARDWARE);
        assert_eq!(hw.config, 1);
        assert_eq!(hw.size, 112);
        assert_eq!(hw.flags & ATTR_DISABLED, ATTR_DISABLED);

        let raw = PerfEventAttr::counting(EventCode::Raw(0x40c7));
        assert_eq!(raw.type_, PERF_TYPE_RAW);
        assert_eq!(raw.config, 0x40c7);
    }

    #[test]
    fn attr_requests_enabled_and_running_times() {
        let attr = PerfEventAttr::counting(EventCode::Hardware(0));
        assert_eq!(attr.read_format, PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING);
    }

    // --- READ DECODING ---

    fn encoded(value: u64, enabled: u64, running: u64) -> [u8; READ_BYTES] {
        let mut buf = [0u8; READ_BYTES];
        buf[0..8].copy_from_slice(&value.to_ne_bytes());
        buf[8..16].copy_from_slice(&enabled.to_ne_bytes());
        buf[16..24].copy_from_slice(&running.to_ne_bytes());
        buf
    }

    #[test]
    fn decode_value_enabled_running() {
        let r = Reading::decode(&encoded(123_456, 500_000_000, 499_000_000));
        assert_eq!(r, Reading { value: 123_456, time_enabled: 500_000_000, time_running: 499_000_000 });
    }

    #[test]
    fn count_full_window_is_raw_value() {
        let r = Reading { value: 1000, time_enabled: 500, time_running: 500 };
        assert_eq!(r.count(), Some(1000.0));
    }

    #[test]
    fn count_multiplexed_is_scaled_to_window() {
        // ON THE PMU HALF THE TIME -> DOUBLE THE OBSERVED COUNT
        let r = Reading { value: 1000, time_enabled: 500, time_running: 250 };
        assert_eq!(r.count(), Some(2000.0));
    }

    #[test]
    fn count_never_scheduled_is_none() {
        let r = Reading { value: 0, time_enabled: 500_000_000, time_running: 0 };
        assert_eq!(r.count(), None);
    }

    #[test]
    fn count_never_enabled_is_zero() {
        let r = Reading { value: 0, time_enabled: 0, time_running: 0 };
        assert_eq!(r.count(), Some(0.0));
    }

    // --- GROUP OPEN WITH A FAKE KERNEL ---
    // EACH EVENT IS A FILE HOLDING ONE ENCODED READING; value = (config + 1) * 100

    fn fake_counters(enabled: u64, running: u64) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for config in 0..10u64 {
            std::fs::write(
                dir.path().join(format!("ev{}", config)),
                encoded((config + 1) * 100, enabled, running),
            ).unwrap();
        }
        dir
    }

    fn rejecting<'a>(
        root: std::path::PathBuf,
        reject: &'static [u64],
        errno: i32,
        group_fds: &'a mut Vec<libc::c_int>,
    ) -> impl FnMut(&PerfEventAttr, libc::c_int) -> std::io::Result<File> + 'a {
        move |attr: &PerfEventAttr, group_fd: libc::c_int| {
            group_fds.push(group_fd);
            if reject.contains(&attr.config) {
                return Err(std::io::Error::from_raw_os_error(errno));
            }
            File::open(root.join(format!("ev{}", attr.config)))
        }
    }

    #[test]
    fn generic_group_opens_without_optional_events() {
        // PMU WITHOUT ref-cycles (9) OR stalled-cycles-backend (8)
        let dir = fake_counters(1000, 1000);
        let mut group_fds = Vec::new();
        let events = crate::vendor::VendorProfile::Generic.events();
        let group = CpuGroup::open_with(0, events, rejecting(dir.path().to_path_buf(), &[9, 8], libc::ENOENT, &mut group_fds)).unwrap();

        assert_eq!(group.missing(), vec!["ref-cycles", "stalled-cycles-backend"]);
        // instructions, cycles, -, cache-misses, branch-misses, -
        assert_eq!(group.read().unwrap(), vec![200.0, 100.0, 0.0, 400.0, 600.0, 0.0]);

        let leader = group.leader().map(|f| f.as_raw_fd());
        assert_eq!(group_fds[0], -1);
        assert!(group_fds[1..].iter().all(|fd| Some(*fd) == leader));
    }

    #[test]
    fn eopnotsupp_also_marks_optional_absent() {
        let dir = fake_counters(1000, 1000);
        let mut group_fds = Vec::new();
        let events = crate::vendor::VendorProfile::Generic.events();
        let group = CpuGroup::open_with(0, events, rejecting(dir.path().to_path_buf(), &[9], libc::EOPNOTSUPP, &mut group_fds)).unwrap();
        assert_eq!(group.missing(), vec!["ref-cycles"]);
    }

    #[test]
    fn unsupported_required_event_fails() {
        let dir = fake_counters(1000, 1000);
        let mut group_fds = Vec::new();
        let events = crate::vendor::VendorProfile::Generic.events();
        // cache-misses (3) IS REQUIRED
        let r = CpuGroup::open_with(0, events, rejecting(dir.path().to_path_buf(), &[3], libc::ENOENT, &mut group_fds));
        assert!(matches!(r, Err(Error::Acquisition(ref m)) if m.contains("cache-misses")));
    }

    #[test]
    fn optional_event_with_other_errno_fails() {
        // PERMISSION PROBLEMS ARE NOT "UNSUPPORTED"
        let dir = fake_counters(1000, 1000);
        let mut group_fds = Vec::new();
        let events = crate::vendor::VendorProfile::Generic.events();
        let r = CpuGroup::open_with(0, events, rejecting(dir.path().to_path_buf(), &[9], libc::EACCES, &mut group_fds));
        assert!(matches!(r, Err(Error::Acquisition(_))));
    }

    #[test]
    fn unscheduled_group_read_is_acquisition_error() {
        // ENABLED FOR THE WHOLE WINDOW, NEVER ON THE PMU
        let dir = fake_counters(500_000_000, 0);
        let mut group_fds = Vec::new();
        let events = crate::vendor::VendorProfile::Generic.events();
        let group = CpuGroup::open_with(0, &events[..2], rejecting(dir.path().to_path_buf(), &[], libc::ENOENT, &mut group_fds)).unwrap();
        let r = group.read();
        assert!(matches!(r, Err(Error::Acquisition(ref m)) if m.contains("never scheduled")));
    }

    #[test]
    fn no_metric_groups() {
        let mut p = PerfCounters::new();
        assert_eq!(p.setup_group("HPC_DVFS_MODEL_INTEL").unwrap(), None);
        assert!(p.read_metrics(0).is_err());
    }

    #[test]
    fn read_unmonitored_cpu_fails() {
        let mut p = PerfCounters::new();
        assert!(matches!(p.read_events(0), Err(Error::Acquisition(_))));
    }

    #[test]
    fn finalize_twice_is_harmless() {
        let mut p = PerfCounters::new();
        p.finalize();
        p.finalize();
    }
}
