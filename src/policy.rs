// PHASECTL POLICY TABLE AND ACTUATION
// LEVEL -> TARGET FREQUENCY FROM THE LOADED CONFIG.
// UNKNOWN (AND ANY UNRECOGNIZED LEVEL) -> HIGH: FAIL TOWARD PERFORMANCE.
//
// IDEMPOTENT: THE EXTERNAL CALL IS ISSUED ONLY WHEN THE TARGET DIFFERS FROM
// THE LAST SUCCESSFULLY APPLIED FREQUENCY. FAILURES NEVER ADVANCE STATE AND
// NEVER STOP THE LOOP.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use log::{debug, error, info};

use crate::classifier::PhaseLevel;
use crate::config::FreqConfig;
use crate::error::{Error, Result};

pub fn target_frequency(cfg: &FreqConfig, level: PhaseLevel) -> u64 {
    match level {
        PhaseLevel::Low => cfg.low_freq_khz,
        PhaseLevel::Med => cfg.med_freq_khz,
        PhaseLevel::High | PhaseLevel::Unknown => cfg.high_freq_khz,
    }
}

// --- ACTUATORS ---

pub trait Actuator {
    fn set_frequency(&mut self, khz: u64) -> Result<()>;

    fn name(&self) -> &str;
}

// LETS THE BINARY PICK AN ACTUATOR AT RUNTIME
impl<A: Actuator + ?Sized> Actuator for Box<A> {
    fn set_frequency(&mut self, khz: u64) -> Result<()> {
        (**self).set_frequency(khz)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

// cpupower frequency-set -f <kHz>. REQUIRES ROOT AND A GOVERNOR THAT HONORS IT.
pub struct CpupowerActuator {
    program: String,
}

impl CpupowerActuator {
    pub fn new() -> Self {
        Self { program: "cpupower".to_string() }
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }
}

impl Default for CpupowerActuator {
    fn default() -> Self {
        Self::new()
    }
}

impl Actuator for CpupowerActuator {
    fn set_frequency(&mut self, khz: u64) -> Result<()> {
        let status = Command::new(&self.program)
            .args(["frequency-set", "-f", &khz.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| Error::Actuation { khz, reason: format!("{}: {}", self.program, e) })?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Actuation { khz, reason: format!("{} exited with {}", self.program, status) })
        }
    }

    fn name(&self) -> &str {
        "cpupower"
    }
}

// WRITES scaling_setspeed FOR EVERY LISTED CPU (USERSPACE GOVERNOR).
// ONE FAILED WRITE FAILS THE WHOLE REQUEST SO THE NEXT CYCLE RETRIES ALL.
pub struct SysfsActuator {
    cpufreq_root: PathBuf,
    cpus: Vec<usize>,
}

impl SysfsActuator {
    pub fn new(cpus: Vec<usize>) -> Self {
        Self::with_root("/sys/devices/system/cpu", cpus)
    }

    pub fn with_root(root: impl Into<PathBuf>, cpus: Vec<usize>) -> Self {
        Self { cpufreq_root: root.into(), cpus }
    }

    fn setspeed_path(&self, cpu: usize) -> PathBuf {
        self.cpufreq_root.join(format!("cpu{}/cpufreq/scaling_setspeed", cpu))
    }
}

impl Actuator for SysfsActuator {
    fn set_frequency(&mut self, khz: u64) -> Result<()> {
        for &cpu in &self.cpus {
            let path = self.setspeed_path(cpu);
            std::fs::write(&path, khz.to_string()).map_err(|e| Error::Actuation {
                khz,
                reason: format!("{}: {}", path.display(), e),
            })?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "sysfs"
    }
}

// LOGS AND RECORDS, NEVER TOUCHES HARDWARE
#[derive(Default)]
pub struct DryRunActuator {
    pub requested: Vec<u64>,
}

impl Actuator for DryRunActuator {
    fn set_frequency(&mut self, khz: u64) -> Result<()> {
        info!("DRY RUN: WOULD SET {} kHz", khz);
        self.requested.push(khz);
        Ok(())
    }

    fn name(&self) -> &str {
        "dry-run"
    }
}

// --- CONTROLLER STATE ---

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControllerState {
    // None UNTIL THE FIRST CONFIRMED SUCCESS
    pub last_applied_khz: Option<u64>,
    pub monitor_cpu: usize,
    pub controller_cpu: usize,
}

impl ControllerState {
    pub fn new(monitor_cpu: usize, controller_cpu: usize) -> Self {
        Self { last_applied_khz: None, monitor_cpu, controller_cpu }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Unchanged(u64),
    Applied(u64),
    Failed(u64),
}

impl Outcome {
    pub fn target_khz(self) -> u64 {
        match self {
            Self::Unchanged(k) | Self::Applied(k) | Self::Failed(k) => k,
        }
    }
}

// --- POLICY ---

pub struct FrequencyPolicy<'c, A: Actuator> {
    cfg: &'c FreqConfig,
    actuator: A,
    state: ControllerState,
    pub nr_applied: u64,
    pub nr_failed: u64,
}

impl<'c, A: Actuator> FrequencyPolicy<'c, A> {
    pub fn new(cfg: &'c FreqConfig, actuator: A, state: ControllerState) -> Self {
        Self { cfg, actuator, state, nr_applied: 0, nr_failed: 0 }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    pub fn into_actuator(self) -> A {
        self.actuator
    }

    pub fn apply(&mut self, level: PhaseLevel) -> Outcome {
        let target = target_frequency(self.cfg, level);
        if self.state.last_applied_khz == Some(target) {
            debug!("DVFS: {} -> {} kHz (UNCHANGED)", level.label(), target);
            return Outcome::Unchanged(target);
        }

        match self.actuator.set_frequency(target) {
            Ok(()) => {
                info!("DVFS: SWITCHING TO {} ({} kHz) VIA {}", level.label(), target, self.actuator.name());
                self.state.last_applied_khz = Some(target);
                self.nr_applied += 1;
                Outcome::Applied(target)
            }
            Err(e) => {
                error!("DVFS: {}", e);
                self.nr_failed += 1;
                Outcome::Failed(target)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CFG: FreqConfig = FreqConfig {
        low_freq_khz: 1_000_000,
        med_freq_khz: 2_000_000,
        high_freq_khz: 3_000_000,
    };

    // FAILS THE FIRST n CALLS, THEN SUCCEEDS
    struct Flaky {
        fail_left: u32,
        calls: Vec<u64>,
    }

    impl Actuator for Flaky {
        fn set_frequency(&mut self, khz: u64) -> Result<()> {
            self.calls.push(khz);
            if self.fail_left > 0 {
                self.fail_left -= 1;
                return Err(Error::Actuation { khz, reason: "exit status 1".into() });
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[test]
    fn level_to_threshold() {
        assert_eq!(target_frequency(&CFG, PhaseLevel::Low), 1_000_000);
        assert_eq!(target_frequency(&CFG, PhaseLevel::Med), 2_000_000);
        assert_eq!(target_frequency(&CFG, PhaseLevel::High), 3_000_000);
    }

    #[test]
    fn unknown_maps_to_high() {
        assert_eq!(target_frequency(&CFG, PhaseLevel::Unknown), CFG.high_freq_khz);
        assert_eq!(target_frequency(&CFG, PhaseLevel::from_code(99)), CFG.high_freq_khz);
        assert_eq!(target_frequency(&CFG, PhaseLevel::from_code(7)), CFG.high_freq_khz);
    }

    #[test]
    fn same_level_twice_actuates_once() {
        let mut p = FrequencyPolicy::new(&CFG, DryRunActuator::default(), ControllerState::new(0, 0));
        assert_eq!(p.apply(PhaseLevel::Low), Outcome::Applied(1_000_000));
        assert_eq!(p.apply(PhaseLevel::Low), Outcome::Unchanged(1_000_000));
        assert_eq!(p.actuator().requested, vec![1_000_000]);
    }

    #[test]
    fn unknown_after_high_is_noop() {
        let mut p = FrequencyPolicy::new(&CFG, DryRunActuator::default(), ControllerState::new(0, 0));
        p.apply(PhaseLevel::High);
        assert_eq!(p.apply(PhaseLevel::Unknown), Outcome::Unchanged(3_000_000));
        assert_eq!(p.actuator().requested.len(), 1);
    }

    #[test]
    fn failure_leaves_state_and_retries() {
        let flaky = Flaky { fail_left: 1, calls: Vec::new() };
        let mut p = FrequencyPolicy::new(&CFG, flaky, ControllerState::new(0, 0));

        assert_eq!(p.apply(PhaseLevel::Med), Outcome::Failed(2_000_000));
        assert_eq!(p.state().last_applied_khz, None);

        // SAME TARGET NEXT CYCLE IS RETRIED, NOT SKIPPED
        assert_eq!(p.apply(PhaseLevel::Med), Outcome::Applied(2_000_000));
        assert_eq!(p.state().last_applied_khz, Some(2_000_000));
        assert_eq!(p.nr_failed, 1);
        assert_eq!(p.nr_applied, 1);
        assert_eq!(p.actuator().calls, vec![2_000_000, 2_000_000]);
    }

    #[test]
    fn sysfs_writes_every_cpu() {
        let dir = tempfile::tempdir().unwrap();
        for cpu in [0usize, 1] {
            std::fs::create_dir_all(dir.path().join(format!("cpu{}/cpufreq", cpu))).unwrap();
        }
        let mut a = SysfsActuator::with_root(dir.path(), vec![0, 1]);
        a.set_frequency(1_800_000).unwrap();
        for cpu in [0usize, 1] {
            let v = std::fs::read_to_string(dir.path().join(format!("cpu{}/cpufreq/scaling_setspeed", cpu))).unwrap();
            assert_eq!(v, "1800000");
        }
    }

    #[test]
    fn sysfs_missing_cpu_is_actuation_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = SysfsActuator::with_root(dir.path(), vec![3]);
        assert!(matches!(a.set_frequency(1_000_000), Err(Error::Actuation { khz: 1_000_000, .. })));
    }

    #[test]
    fn cpupower_missing_binary_is_actuation_error() {
        let mut a = CpupowerActuator::with_program("/nonexistent/phasectl-cpupower");
        assert!(matches!(a.set_frequency(800_000), Err(Error::Actuation { khz: 800_000, .. })));
    }
}
