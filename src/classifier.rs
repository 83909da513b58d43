// PHASECTL PHASE CLASSIFIER BOUNDARY
// THE MODEL IS EXTERNAL. THE CONTROLLER ONLY SEES classify(features) -> level.
// ONE BINDING AT A TIME, REGISTERED BEFORE THE LOOP; LAST REGISTRATION WINS.

use crate::metrics::FeatureVector;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PhaseLevel {
    Low,
    Med,
    High,
    Unknown,
}

impl PhaseLevel {
    // MODEL OUTPUT CODES: 0/1/2 ARE LEVELS, EVERYTHING ELSE (INCL. 99) IS UNKNOWN
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Low,
            1 => Self::Med,
            2 => Self::High,
            _ => Self::Unknown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Med => "MED",
            Self::High => "HIGH",
            Self::Unknown => "UNKNOWN",
        }
    }
}

pub trait Classifier {
    fn classify(&self, features: &FeatureVector) -> PhaseLevel;

    fn name(&self) -> &str {
        "external"
    }
}

impl<F> Classifier for F
where
    F: Fn(&FeatureVector) -> PhaseLevel,
{
    fn classify(&self, features: &FeatureVector) -> PhaseLevel {
        self(features)
    }
}

// EXPLICIT UNBOUND STATE INSTEAD OF A NULL CALLBACK
#[derive(Default)]
pub struct ClassifierSlot {
    bound: Option<Box<dyn Classifier>>,
}

impl ClassifierSlot {
    pub fn new() -> Self {
        Self { bound: None }
    }

    pub fn register(&mut self, classifier: Box<dyn Classifier>) {
        self.bound = Some(classifier);
    }

    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    pub fn name(&self) -> &str {
        self.bound.as_deref().map(|c| c.name()).unwrap_or("none")
    }

    // None = NO CLASSIFIER REGISTERED
    pub fn classify(&self, features: &FeatureVector) -> Option<PhaseLevel> {
        self.bound.as_deref().map(|c| c.classify(features))
    }
}

// --- BUILT-IN HEURISTIC ---
// STAND-IN WHEN NO TRAINED MODEL IS LINKED. ROOFLINE-STYLE THRESHOLDS:
// IDLE AND MEMORY-BOUND INTERVALS RUN SLOW, COMPUTE-BOUND RUN FAST.

pub const IDLE_GFLOPS: f64 = 0.05;
pub const IDLE_BANDWIDTH_GBS: f64 = 0.1;
pub const IDLE_CPI: f64 = 3.0;
pub const MEMORY_STALL_RATIO: f64 = 0.35;
pub const MEMORY_BANDWIDTH_GBS: f64 = 8.0;
pub const COMPUTE_MATH_INTENSITY: f64 = 0.5;
pub const COMPUTE_GFLOPS: f64 = 2.0;
pub const COMPUTE_MAX_CPI: f64 = 1.0;

#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicClassifier;

impl Classifier for HeuristicClassifier {
    fn classify(&self, f: &FeatureVector) -> PhaseLevel {
        let idle = f.gflops_approx < IDLE_GFLOPS
            && f.bandwidth_proxy < IDLE_BANDWIDTH_GBS
            && f.cpi > IDLE_CPI;
        if idle {
            return PhaseLevel::Low;
        }
        if f.stall_ratio > MEMORY_STALL_RATIO || f.bandwidth_proxy > MEMORY_BANDWIDTH_GBS {
            return PhaseLevel::Low;
        }
        if (f.math_intensity > COMPUTE_MATH_INTENSITY || f.gflops_approx > COMPUTE_GFLOPS)
            && f.cpi < COMPUTE_MAX_CPI
        {
            return PhaseLevel::High;
        }
        PhaseLevel::Med
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(cpi: f64, mi: f64, stall: f64, bw: f64, gflops: f64) -> FeatureVector {
        FeatureVector {
            cpi,
            math_intensity: mi,
            stall_ratio: stall,
            bandwidth_proxy: bw,
            branch_mpki: 1.0,
            gflops_approx: gflops,
            clock_ratio: 1.0,
        }
    }

    #[test]
    fn level_codes() {
        assert_eq!(PhaseLevel::from_code(0), PhaseLevel::Low);
        assert_eq!(PhaseLevel::from_code(1), PhaseLevel::Med);
        assert_eq!(PhaseLevel::from_code(2), PhaseLevel::High);
        assert_eq!(PhaseLevel::from_code(99), PhaseLevel::Unknown);
        assert_eq!(PhaseLevel::from_code(3), PhaseLevel::Unknown);
    }

    #[test]
    fn empty_slot_classifies_nothing() {
        let slot = ClassifierSlot::new();
        assert!(!slot.is_bound());
        assert_eq!(slot.classify(&FeatureVector::default()), None);
        assert_eq!(slot.name(), "none");
    }

    #[test]
    fn last_registration_wins() {
        let mut slot = ClassifierSlot::new();
        slot.register(Box::new(|_: &FeatureVector| PhaseLevel::Low));
        slot.register(Box::new(|_: &FeatureVector| PhaseLevel::High));
        assert_eq!(slot.classify(&FeatureVector::default()), Some(PhaseLevel::High));
    }

    #[test]
    fn heuristic_idle_is_low() {
        let c = HeuristicClassifier;
        assert_eq!(c.classify(&features(8.0, 0.0, 0.01, 0.0, 0.0)), PhaseLevel::Low);
    }

    #[test]
    fn heuristic_memory_bound_is_low() {
        let c = HeuristicClassifier;
        assert_eq!(c.classify(&features(2.5, 0.05, 0.6, 20.0, 0.3)), PhaseLevel::Low);
    }

    #[test]
    fn heuristic_compute_bound_is_high() {
        let c = HeuristicClassifier;
        assert_eq!(c.classify(&features(0.4, 2.0, 0.02, 0.5, 40.0)), PhaseLevel::High);
    }

    #[test]
    fn heuristic_mixed_is_med() {
        let c = HeuristicClassifier;
        assert_eq!(c.classify(&features(1.3, 0.1, 0.1, 2.0, 0.5)), PhaseLevel::Med);
    }
}
