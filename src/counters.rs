// PHASECTL COUNTER ACQUISITION BOUNDARY
// THE CONTROLLER TALKS TO THE COUNTER SUBSYSTEM ONLY THROUGH CounterBackend.
//
// TWO STRATEGIES:
//   GROUPED: THE BACKEND PRE-COMPUTES THE 7 FEATURES FROM A NAMED GROUP
//   RAW:     THE BACKEND RETURNS 8-9 RAW EVENT COUNTS, THE PROFILE DERIVES
// MODE IS DECIDED ONCE AT SETUP AND NEVER RE-EVALUATED.

use log::{info, warn};

use crate::error::{Error, Result};
use crate::metrics::FEATURE_COUNT;
use crate::vendor::VendorProfile;

// HOW A NAMED EVENT IS PROGRAMMED INTO A perf_event_attr
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventCode {
    // PERF_TYPE_HARDWARE GENERIC EVENT (PERF_COUNT_HW_*)
    Hardware(u64),
    // PERF_TYPE_RAW MODEL-SPECIFIC ENCODING
    Raw(u64),
}

// optional: THE PMU MAY NOT MAP THIS EVENT. A BACKEND THAT CANNOT OPEN IT
// KEEPS THE SLOT AND READS IT AS 0 INSTEAD OF FAILING SETUP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventSpec {
    pub name: &'static str,
    pub code: EventCode,
    pub optional: bool,
}

impl EventSpec {
    pub const fn hw(name: &'static str, id: u64) -> Self {
        Self { name, code: EventCode::Hardware(id), optional: false }
    }

    pub const fn raw(name: &'static str, config: u64) -> Self {
        Self { name, code: EventCode::Raw(config), optional: false }
    }

    pub const fn optional(self) -> Self {
        Self { optional: true, ..self }
    }
}

// HOW MANY GROUPED METRICS A PROFILE ACCEPTS BEFORE FALLING BACK TO RAW
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricCountRule {
    AtLeast(usize),
    Exactly(usize),
}

impl MetricCountRule {
    pub fn accepts(self, delivered: usize) -> bool {
        match self {
            Self::AtLeast(n) => delivered >= n,
            Self::Exactly(n) => delivered == n,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquisitionMode {
    Grouped,
    Raw,
}

impl AcquisitionMode {
    pub fn label(self) -> &'static str {
        match self {
            Self::Grouped => "GROUPED",
            Self::Raw => "RAW",
        }
    }
}

pub trait CounterBackend {
    // ACQUIRE GLOBAL MONITORING STATE FOR THE GIVEN CONTEXTS
    fn init(&mut self, contexts: &[usize]) -> Result<()>;

    // REQUEST A NAMED METRIC GROUP. Ok(None) = GROUP NOT AVAILABLE.
    // Ok(Some(n)) = GROUP REGISTERED, n METRICS WILL BE DELIVERED.
    fn setup_group(&mut self, name: &str) -> Result<Option<usize>>;

    // REGISTER RAW EVENTS. READ ORDER MATCHES events ORDER; AN OPTIONAL EVENT
    // THE HARDWARE REJECTS STILL OCCUPIES ITS SLOT AND READS AS 0.
    fn setup_events(&mut self, events: &[EventSpec]) -> Result<()>;

    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;

    // RAW COUNTS FOR ONE CONTEXT, IN REGISTRATION ORDER
    fn read_events(&mut self, context: usize) -> Result<Vec<f64>>;

    // PRE-AGGREGATED METRICS FOR ONE CONTEXT (GROUPED MODE ONLY)
    fn read_metrics(&mut self, context: usize) -> Result<Vec<f64>>;

    // RELEASE EVERYTHING init() ACQUIRED
    fn finalize(&mut self);
}

// PREFER GROUPED METRICS; VALIDATE THE DELIVERED COUNT AGAINST THE PROFILE RULE;
// OTHERWISE REGISTER THE PROFILE'S RAW EVENTS. SETUP FAILURES ARE STARTUP ERRORS.
pub fn select_mode<B: CounterBackend + ?Sized>(
    backend: &mut B,
    profile: VendorProfile,
    try_groups: bool,
) -> Result<AcquisitionMode> {
    if try_groups {
        let group = profile.group_name();
        match backend.setup_group(group) {
            Ok(Some(n)) if profile.metric_rule().accepts(n) => {
                info!("COUNTERS: GROUP {} DELIVERS {} METRICS", group, n);
                return Ok(AcquisitionMode::Grouped);
            }
            Ok(Some(n)) => {
                warn!(
                    "COUNTERS: GROUP {} DELIVERS {} METRICS ({:?} REQUIRED, {} FEATURES), FALLING BACK TO RAW",
                    group, n, profile.metric_rule(), FEATURE_COUNT,
                );
            }
            Ok(None) => {
                info!("COUNTERS: GROUP {} NOT AVAILABLE, USING RAW EVENTS", group);
            }
            Err(e) => {
                warn!("COUNTERS: GROUP {} SETUP FAILED ({}), FALLING BACK TO RAW", group, e);
            }
        }
    }

    let events = profile.events();
    backend
        .setup_events(events)
        .map_err(|e| Error::StartupConfig(format!("raw event setup failed: {}", e)))?;
    info!("COUNTERS: {} RAW EVENTS REGISTERED ({})", events.len(), profile.label());
    Ok(AcquisitionMode::Raw)
}
