// PHASECTL CONTROLLER
// OWNS THE SAMPLING LOOP AND THE SESSION LIFECYCLE:
//   VALIDATE CONTEXTS -> PIN -> INIT COUNTERS -> SELECT MODE
//   LOOP: START -> SLEEP -> STOP -> READ -> DERIVE -> CLASSIFY -> ACTUATE
//   TEARDOWN: FINALIZE COUNTERS -> RESTORE AFFINITY
//
// TEARDOWN RUNS EXACTLY ONCE: AT THE END OF run(), ON A MID-LOOP FAILURE, OR
// FROM Drop IF THE SESSION IS ABANDONED OR init() FAILS PART WAY.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::classifier::{Classifier, ClassifierSlot, PhaseLevel};
use crate::config::FreqConfig;
use crate::counters::{self, AcquisitionMode, CounterBackend};
use crate::error::{Error, Result};
use crate::event::{Action, EventLog};
use crate::metrics::{Deriver, FeatureVector};
use crate::policy::{Actuator, ControllerState, FrequencyPolicy};
use crate::topology::{self, Topology};
use crate::vendor::VendorProfile;

pub const DEFAULT_INTERVAL_MS: u64 = 500;

#[derive(Clone, Copy, Debug)]
pub struct Settings {
    pub monitor_cpu: usize,
    pub controller_cpu: usize,
    pub interval: Duration,
    pub profile: VendorProfile,
    pub try_groups: bool,
    // 0 = RUN UNTIL CANCELLED
    pub max_cycles: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            monitor_cpu: 0,
            controller_cpu: 0,
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            profile: VendorProfile::Generic,
            try_groups: true,
            max_cycles: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub applied: u64,
    pub failed: u64,
    pub skipped: u64,
    pub mode: AcquisitionMode,
    pub last_applied_khz: Option<u64>,
}

pub struct Controller<'c, B: CounterBackend, T: Topology, A: Actuator> {
    backend: B,
    topology: T,
    policy: FrequencyPolicy<'c, A>,
    classifier: ClassifierSlot,
    settings: Settings,
    deriver: Deriver,
    mode: AcquisitionMode,
    // WHAT teardown() STILL OWES
    pinned: bool,
    acquiring: bool,
    nr_cycles: u64,
    nr_skipped: u64,
    pub log: EventLog,
}

impl<'c, B: CounterBackend, T: Topology, A: Actuator> Controller<'c, B, T, A> {
    pub fn init(
        cfg: &'c FreqConfig,
        settings: Settings,
        backend: B,
        topology: T,
        actuator: A,
        classifier: ClassifierSlot,
    ) -> Result<Self> {
        // NOTHING IS ACQUIRED UNTIL BOTH IDS CHECK OUT
        let active = topology.active_contexts();
        topology::validate_context("monitor", settings.monitor_cpu, active)?;
        topology::validate_context("controller", settings.controller_cpu, active)?;

        let state = ControllerState::new(settings.monitor_cpu, settings.controller_cpu);
        let mut ctl = Self {
            backend,
            topology,
            policy: FrequencyPolicy::new(cfg, actuator, state),
            classifier,
            settings,
            deriver: settings.profile.deriver(),
            mode: AcquisitionMode::Raw,
            pinned: false,
            acquiring: false,
            nr_cycles: 0,
            nr_skipped: 0,
            log: EventLog::new(),
        };

        // ON ANY ERROR BELOW, ctl DROPS AND RELEASES WHAT WAS ACQUIRED
        ctl.topology.pin(settings.controller_cpu)?;
        ctl.pinned = true;

        let contexts: Vec<usize> = (0..active).collect();
        ctl.backend.init(&contexts).map_err(|e| match e {
            Error::StartupConfig(_) => e,
            other => Error::StartupConfig(format!("counter init failed: {}", other)),
        })?;
        ctl.acquiring = true;

        ctl.mode = counters::select_mode(&mut ctl.backend, settings.profile, settings.try_groups)?;

        info!(
            "CONTROLLER: PROFILE {} MODE {} MONITOR CPU {} CONTROLLER CPU {} INTERVAL {}ms CLASSIFIER {}",
            settings.profile.label(),
            ctl.mode.label(),
            settings.monitor_cpu,
            settings.controller_cpu,
            settings.interval.as_millis(),
            ctl.classifier.name(),
        );
        Ok(ctl)
    }

    pub fn mode(&self) -> AcquisitionMode {
        self.mode
    }

    pub fn profile(&self) -> VendorProfile {
        self.settings.profile
    }

    pub fn policy(&self) -> &FrequencyPolicy<'c, A> {
        &self.policy
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    // REPLACES ANY EARLIER BINDING. CALL BEFORE run().
    pub fn register_classifier(&mut self, classifier: Box<dyn Classifier>) {
        self.classifier.register(classifier);
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            cycles: self.nr_cycles,
            applied: self.policy.nr_applied,
            failed: self.policy.nr_failed,
            skipped: self.nr_skipped,
            mode: self.mode,
            last_applied_khz: self.policy.state().last_applied_khz,
        }
    }

    // RUN UNTIL shutdown IS SET, max_cycles IS REACHED, OR ACQUISITION FAILS.
    // shutdown IS CHECKED ONCE PER ITERATION; AN IN-FLIGHT SLEEP IS NOT CUT SHORT.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<RunSummary> {
        if !self.acquiring {
            return Err(Error::StartupConfig("session already torn down".into()));
        }
        while !shutdown.load(Ordering::Relaxed) {
            if self.settings.max_cycles > 0 && self.nr_cycles >= self.settings.max_cycles {
                break;
            }
            if let Err(e) = self.cycle() {
                error!("CONTROLLER: {}, ENDING SESSION", e);
                self.teardown();
                return Err(e);
            }
        }
        self.teardown();
        Ok(self.summary())
    }

    fn cycle(&mut self) -> Result<()> {
        let monitor = self.settings.monitor_cpu;

        self.backend.start().map_err(|e| acquisition("start", e))?;
        let t0 = Instant::now();
        std::thread::sleep(self.settings.interval);
        let elapsed = t0.elapsed();
        self.backend.stop().map_err(|e| acquisition("stop", e))?;

        // MONOTONIC CLOCK CAN STILL REPORT ZERO ON A TINY INTERVAL
        let elapsed_s = if elapsed.is_zero() {
            self.settings.interval.as_secs_f64()
        } else {
            elapsed.as_secs_f64()
        };

        let features = match self.mode {
            AcquisitionMode::Grouped => {
                let values = self.backend.read_metrics(monitor).map_err(|e| acquisition("read", e))?;
                FeatureVector::from_metrics(&values)
            }
            AcquisitionMode::Raw => {
                let raw = self.backend.read_events(monitor).map_err(|e| acquisition("read", e))?;
                (self.deriver)(&raw, elapsed_s)
            }
        };
        self.nr_cycles += 1;

        debug!(
            "CYCLE {}: cpi={:.3} mi={:.3} stall={:.3} bw={:.3} mpki={:.3} gflops={:.3} clk={:.3}",
            self.nr_cycles, features.cpi, features.math_intensity, features.stall_ratio,
            features.bandwidth_proxy, features.branch_mpki, features.gflops_approx, features.clock_ratio,
        );

        let level = self.classifier.classify(&features);
        let (target_khz, action) = match level {
            Some(level) => self.actuate(level),
            None => {
                if self.nr_skipped == 0 {
                    warn!("CONTROLLER: {}, SKIPPING ACTUATION", Error::ClassifierUnavailable);
                } else {
                    debug!("CONTROLLER: {}", Error::ClassifierUnavailable);
                }
                self.nr_skipped += 1;
                (0, Action::Skipped)
            }
        };

        self.log.record(elapsed.as_nanos() as u64, features, level, target_khz, action);
        Ok(())
    }

    fn actuate(&mut self, level: PhaseLevel) -> (u64, Action) {
        let outcome = self.policy.apply(level);
        (outcome.target_khz(), outcome.into())
    }

    // REVERSE ACQUISITION ORDER. SAFE TO CALL REPEATEDLY.
    fn teardown(&mut self) {
        if self.acquiring {
            self.acquiring = false;
            self.backend.finalize();
            debug!("CONTROLLER: COUNTERS FINALIZED");
        }
        if self.pinned {
            self.pinned = false;
            self.topology.restore();
            debug!("CONTROLLER: AFFINITY RESTORED");
        }
    }
}

impl<B: CounterBackend, T: Topology, A: Actuator> Drop for Controller<'_, B, T, A> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn acquisition(what: &str, e: Error) -> Error {
    match e {
        Error::Acquisition(_) => e,
        other => Error::Acquisition(format!("{}: {}", what, other)),
    }
}
