use std::io::Read;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Result};

use phasectl::perf::{PerfCounters, PARANOID_PATH};
use phasectl::topology::LinuxTopology;
use phasectl::vendor::VendorProfile;

const CPUFREQ_CPU0: &str = "/sys/devices/system/cpu/cpu0/cpufreq";

const KERNEL_OPTIONS: [&str; 2] = ["CONFIG_PERF_EVENTS=y", "CONFIG_CPU_FREQ=y"];

fn check_tool(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn check_kernel_config() -> bool {
    let file = match std::fs::File::open("/proc/config.gz") {
        Ok(f) => f,
        Err(_) => {
            println!("  /proc/config.gz       NOT FOUND (SKIPPED)");
            return true;
        }
    };
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut config = String::new();
    if decoder.read_to_string(&mut config).is_err() {
        println!("  /proc/config.gz       UNREADABLE (SKIPPED)");
        return true;
    }
    let mut ok = true;
    for opt in KERNEL_OPTIONS {
        let name = opt.trim_end_matches("=y");
        if config.lines().any(|l| l == opt) {
            println!("  {:<22}OK", name);
        } else {
            println!("  {:<22}NOT FOUND", name);
            ok = false;
        }
    }
    ok
}

// <= 0 LETS AN UNPRIVILEGED PROCESS OPEN SYSTEM-WIDE COUNTERS
fn check_perf_access() -> bool {
    if !Path::new(PARANOID_PATH).exists() {
        println!("  perf_event_paranoid   MISSING (NO PERF SUPPORT)");
        return false;
    }
    let root = unsafe { libc::geteuid() } == 0;
    match PerfCounters::paranoid_level() {
        Some(level) if level <= 0 || root => {
            println!("  perf_event_paranoid   OK ({}{})", level, if root { ", root" } else { "" });
            true
        }
        Some(level) => {
            println!("  perf_event_paranoid   {} -- SYSTEM-WIDE COUNTERS NEED ROOT OR CAP_PERFMON", level);
            false
        }
        None => {
            println!("  perf_event_paranoid   UNREADABLE");
            false
        }
    }
}

fn read_trimmed(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default().trim().to_string()
}

fn check_cpufreq() -> bool {
    let root = Path::new(CPUFREQ_CPU0);
    if !root.exists() {
        println!("  cpufreq               NOT AVAILABLE (sysfs path missing)");
        return false;
    }
    let driver = read_trimmed(&root.join("scaling_driver"));
    let governor = read_trimmed(&root.join("scaling_governor"));
    let available = read_trimmed(&root.join("scaling_available_governors"));
    println!("  scaling_driver        {}", if driver.is_empty() { "unknown" } else { &driver });
    println!("  scaling_governor      {}", if governor.is_empty() { "unknown" } else { &governor });

    if governor == "userspace" {
        return true;
    }
    if available.split_whitespace().any(|g| g == "userspace") {
        println!("  userspace governor    AVAILABLE (NOT ACTIVE -- cpupower frequency-set -g userspace)");
        true
    } else {
        println!("  userspace governor    NOT OFFERED -- FIXED FREQUENCY REQUESTS MAY BE IGNORED");
        false
    }
}

pub fn run_check() -> Result<()> {
    println!("PHASECTL ENVIRONMENT CHECK");
    println!();

    let mut ok = true;

    println!("TOOLS:");
    if check_tool("cpupower") {
        println!("  {:<22}OK", "cpupower");
    } else {
        println!("  {:<22}MISSING (USE --actuator sysfs OR dry-run)", "cpupower");
        ok = false;
    }
    println!();

    println!("KERNEL CONFIG:");
    if !check_kernel_config() {
        ok = false;
    }
    println!();

    println!("COUNTERS:");
    if !check_perf_access() {
        ok = false;
    }
    let profile = VendorProfile::detect();
    println!("  vendor profile        {} ({} raw events)", profile.label(), profile.events().len());
    match LinuxTopology::discover() {
        Ok(t) => println!("  active cpus           {}", t.contexts().len()),
        Err(e) => {
            println!("  active cpus           UNKNOWN ({})", e);
            ok = false;
        }
    }
    println!();

    println!("FREQUENCY SCALING:");
    if !check_cpufreq() {
        ok = false;
    }
    println!();

    if ok {
        println!("ALL CHECKS PASSED");
        Ok(())
    } else {
        println!("SOME CHECKS FAILED");
        bail!("environment not ready for phasectl")
    }
}
