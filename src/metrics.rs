// PHASECTL METRIC DERIVATION
// RAW COUNTER VALUES -> 7-ELEMENT FEATURE VECTOR, ONE PER SAMPLING INTERVAL.
//
// DIVISION SAFETY: A DENOMINATOR COUNTER THAT READS EXACTLY ZERO IS CLAMPED
// TO 1 BEFORE USE. NEAR-IDLE SAMPLES PRODUCE SMALL NON-ZERO RATIOS INSTEAD OF
// NaN/Inf. EVERY OUTPUT IS FINITE BY CONSTRUCTION.

pub const FEATURE_COUNT: usize = 7;

const CACHE_LINE_BYTES: f64 = 64.0;
const GIGA: f64 = 1.0e9;

// ZEN 4 DISPATCHES UP TO 6 OPS PER CYCLE; STALL SLOTS ARE COUNTED PER SLOT
const AMD_DISPATCH_WIDTH: f64 = 6.0;

pub type Deriver = fn(&[f64], f64) -> FeatureVector;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FeatureVector {
    pub cpi: f64,
    pub math_intensity: f64,
    pub stall_ratio: f64,
    pub bandwidth_proxy: f64,
    pub branch_mpki: f64,
    pub gflops_approx: f64,
    pub clock_ratio: f64,
}

impl FeatureVector {
    pub fn as_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.cpi,
            self.math_intensity,
            self.stall_ratio,
            self.bandwidth_proxy,
            self.branch_mpki,
            self.gflops_approx,
            self.clock_ratio,
        ]
    }

    pub fn is_finite(&self) -> bool {
        self.as_array().iter().all(|v| v.is_finite())
    }

    // GROUPED MODE: THE BACKEND ALREADY COMPUTED THE FEATURES, IN ORDER.
    // MISSING OR NON-FINITE ENTRIES BECOME 0.
    pub fn from_metrics(values: &[f64]) -> Self {
        let v = |i: usize| values.get(i).copied().filter(|x| x.is_finite()).unwrap_or(0.0);
        Self {
            cpi: v(0),
            math_intensity: v(1),
            stall_ratio: v(2),
            bandwidth_proxy: v(3),
            branch_mpki: v(4),
            gflops_approx: v(5),
            clock_ratio: v(6),
        }
    }
}

// ZERO -> 1, ANYTHING ELSE UNTOUCHED
#[inline]
fn denom(x: f64) -> f64 {
    if x == 0.0 { 1.0 } else { x }
}

// SHORT SAMPLES READ AS ZERO-FILLED
#[inline]
fn at(raw: &[f64], i: usize) -> f64 {
    raw.get(i).copied().unwrap_or(0.0)
}

// NON-POSITIVE ELAPSED TIME IS THE CALLER'S PROBLEM (NOMINAL FALLBACK);
// GUARD HERE ANYWAY SO A BAD VALUE CAN NEVER PRODUCE Inf
#[inline]
fn seconds(elapsed_s: f64) -> f64 {
    if elapsed_s > 0.0 && elapsed_s.is_finite() { elapsed_s } else { 1.0 }
}

// INTEL LAYOUT:
// 0 INST_RETIRED  1 CLK_CORE  2 CLK_REF  3 FP_512  4 FP_256  5 FP_SCALAR
// 6 L2_LINES_IN   7 L3_MISS_STALLS       8 BR_MISP
pub fn derive_intel(raw: &[f64], elapsed_s: f64) -> FeatureVector {
    let instr = denom(at(raw, 0));
    let core = denom(at(raw, 1));
    let reference = denom(at(raw, 2));
    let secs = seconds(elapsed_s);

    let flops = at(raw, 3) * 8.0 + at(raw, 4) * 4.0 + at(raw, 5);

    FeatureVector {
        cpi: core / instr,
        math_intensity: flops / core,
        stall_ratio: at(raw, 7) / core,
        bandwidth_proxy: at(raw, 6) * CACHE_LINE_BYTES / secs / GIGA,
        branch_mpki: 1000.0 * at(raw, 8) / instr,
        gflops_approx: flops / secs / GIGA,
        clock_ratio: core / reference,
    }
}

// AMD ZEN 4 LAYOUT:
// 0 RET_INSTR  1 CYCLES  2 P0_CYCLES  3 SSE_AVX_FLOPS (ALREADY PER-FLOP)
// 4 DRAM_FILLS_NEAR  5 DRAM_FILLS_FAR  6 BACKEND_STALL_SLOTS  7 BR_MISP
pub fn derive_amd(raw: &[f64], elapsed_s: f64) -> FeatureVector {
    let instr = denom(at(raw, 0));
    let cycles = denom(at(raw, 1));
    let p0_cycles = denom(at(raw, 2));
    let secs = seconds(elapsed_s);

    let flops = at(raw, 3);
    let fills = at(raw, 4) + at(raw, 5);

    FeatureVector {
        cpi: cycles / instr,
        math_intensity: flops / cycles,
        stall_ratio: at(raw, 6) / (AMD_DISPATCH_WIDTH * cycles),
        bandwidth_proxy: fills * CACHE_LINE_BYTES / secs / GIGA,
        branch_mpki: 1000.0 * at(raw, 7) / instr,
        gflops_approx: flops / secs / GIGA,
        clock_ratio: cycles / p0_cycles,
    }
}

// GENERIC LAYOUT (KERNEL GENERIC EVENTS, NO FP COUNTERS):
// 0 INSTRUCTIONS  1 CYCLES  2 REF_CYCLES*  3 CACHE_MISSES  4 BRANCH_MISSES
// 5 STALLED_CYCLES_BACKEND*
// * OPTIONAL, 0 WHEN THE PMU DOES NOT MAP IT. NO REFERENCE CLOCK -> RATIO 1.
pub fn derive_generic(raw: &[f64], elapsed_s: f64) -> FeatureVector {
    let instr = denom(at(raw, 0));
    let cycles = denom(at(raw, 1));
    let secs = seconds(elapsed_s);

    let clock_ratio = match at(raw, 2) {
        r if r == 0.0 => 1.0,
        r => cycles / r,
    };

    FeatureVector {
        cpi: cycles / instr,
        math_intensity: 0.0,
        stall_ratio: at(raw, 5) / cycles,
        bandwidth_proxy: at(raw, 3) * CACHE_LINE_BYTES / secs / GIGA,
        branch_mpki: 1000.0 * at(raw, 4) / instr,
        gflops_approx: 0.0,
        clock_ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * b.abs().max(1.0)
    }

    #[test]
    fn intel_formulas() {
        // 1e9 INSTR, 2e9 CORE, 1e9 REF, FP: 1e6 x 512, 2e6 x 256, 3e6 SCALAR
        let raw = [1e9, 2e9, 1e9, 1e6, 2e6, 3e6, 5e6, 4e8, 2e6];
        let f = derive_intel(&raw, 0.5);
        let flops = 1e6 * 8.0 + 2e6 * 4.0 + 3e6;
        assert!(close(f.cpi, 2.0));
        assert!(close(f.math_intensity, flops / 2e9));
        assert!(close(f.stall_ratio, 0.2));
        assert!(close(f.bandwidth_proxy, 5e6 * 64.0 / 0.5 / 1e9));
        assert!(close(f.branch_mpki, 2.0));
        assert!(close(f.gflops_approx, flops / 0.5 / 1e9));
        assert!(close(f.clock_ratio, 2.0));
    }

    #[test]
    fn amd_formulas() {
        let raw = [2e9, 3e9, 2.5e9, 6e8, 1e6, 5e5, 1.8e9, 4e6];
        let f = derive_amd(&raw, 0.5);
        assert!(close(f.cpi, 1.5));
        assert!(close(f.math_intensity, 0.2));
        assert!(close(f.stall_ratio, 1.8e9 / (6.0 * 3e9)));
        assert!(close(f.bandwidth_proxy, 1.5e6 * 64.0 / 0.5 / 1e9));
        assert!(close(f.branch_mpki, 2.0));
        assert!(close(f.gflops_approx, 6e8 / 0.5 / 1e9));
        assert!(close(f.clock_ratio, 1.2));
    }

    #[test]
    fn all_zero_inputs_finite_every_profile() {
        for d in [derive_intel as Deriver, derive_amd, derive_generic] {
            let f = d(&[0.0; 9], 0.5);
            assert!(f.is_finite(), "{:?}", f);
        }
    }

    #[test]
    fn zero_denominators_clamped_to_one() {
        let f = derive_intel(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 5.0], 0.5);
        assert_eq!(f.cpi, 1.0);
        assert_eq!(f.clock_ratio, 1.0);
        assert_eq!(f.branch_mpki, 5000.0);
    }

    #[test]
    fn short_sample_zero_filled() {
        let f = derive_intel(&[1e9, 2e9], 0.5);
        assert!(f.is_finite());
        assert!(close(f.cpi, 2.0));
        assert_eq!(f.clock_ratio, 2e9);
        assert_eq!(f.gflops_approx, 0.0);
    }

    #[test]
    fn generic_without_ref_or_stall_counters() {
        // SLOTS 2 AND 5 ABSENT ON THIS PMU
        let f = derive_generic(&[1e9, 2e9, 0.0, 1e6, 2e6, 0.0], 0.5);
        assert_eq!(f.clock_ratio, 1.0);
        assert_eq!(f.stall_ratio, 0.0);
        assert!(close(f.cpi, 2.0));
        assert!(close(f.branch_mpki, 2.0));
        assert!(f.is_finite());
    }

    #[test]
    fn generic_with_ref_counter() {
        let f = derive_generic(&[1e9, 3e9, 2e9, 0.0, 0.0, 6e8], 0.5);
        assert!(close(f.clock_ratio, 1.5));
        assert!(close(f.stall_ratio, 0.2));
    }

    #[test]
    fn bad_elapsed_never_infinite() {
        let raw = [1e9, 2e9, 1e9, 1e6, 2e6, 3e6, 5e6, 4e8, 2e6];
        assert!(derive_intel(&raw, 0.0).is_finite());
        assert!(derive_amd(&raw, -1.0).is_finite());
        assert!(derive_generic(&raw, f64::NAN).is_finite());
    }

    #[test]
    fn from_metrics_positional_and_sanitized() {
        let f = FeatureVector::from_metrics(&[1.0, 2.0, f64::NAN, 4.0, f64::INFINITY, 6.0, 7.0, 99.0]);
        assert_eq!(f.as_array(), [1.0, 2.0, 0.0, 4.0, 0.0, 6.0, 7.0]);
        let short = FeatureVector::from_metrics(&[1.5]);
        assert_eq!(short.as_array(), [1.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }
}
