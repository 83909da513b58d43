// PHASECTL VENDOR PROFILES
// DIFFERENT MICROARCHITECTURES NAME THE SAME CONCEPTS WITH DIFFERENT EVENTS.
// ONE PROFILE IS SELECTED AT STARTUP; IT OWNS ITS EVENT LIST, ITS GROUP NAME,
// ITS GROUPED-METRIC VALIDATION RULE, AND ITS DERIVATION FUNCTION.
//
// UNKNOWN VENDORS RUN IN THE GENERIC PROFILE (KERNEL GENERIC EVENTS) INSTEAD
// OF REFUSING TO START.

use std::sync::OnceLock;

use regex::Regex;

use crate::counters::{EventSpec, MetricCountRule};
use crate::metrics::{self, Deriver};

const CPUINFO_PATH: &str = "/proc/cpuinfo";

// PERF_COUNT_HW_* (include/uapi/linux/perf_event.h)
const HW_CPU_CYCLES: u64 = 0;
const HW_INSTRUCTIONS: u64 = 1;
const HW_CACHE_MISSES: u64 = 3;
const HW_BRANCH_MISSES: u64 = 5;
const HW_STALLED_CYCLES_BACKEND: u64 = 8;
const HW_REF_CPU_CYCLES: u64 = 9;

// INTEL GOLDEN COVE (SAPPHIRE RAPIDS) -- FIXED COUNTERS VIA GENERIC EVENTS,
// PROGRAMMABLE COUNTERS AS event | umask << 8 | cmask << 24
static INTEL_EVENTS: [EventSpec; 9] = [
    EventSpec::hw("INST_RETIRED_ANY", HW_INSTRUCTIONS),
    EventSpec::hw("CPU_CLK_UNHALTED_CORE", HW_CPU_CYCLES),
    EventSpec::hw("CPU_CLK_UNHALTED_REF", HW_REF_CPU_CYCLES),
    EventSpec::raw("FP_ARITH_INST_RETIRED_512B_PACKED_DOUBLE", 0x40c7),
    EventSpec::raw("FP_ARITH_INST_RETIRED_256B_PACKED_DOUBLE", 0x10c7),
    EventSpec::raw("FP_ARITH_INST_RETIRED_SCALAR_DOUBLE", 0x01c7),
    EventSpec::raw("L2_LINES_IN_ALL", 0x1f25),
    EventSpec::raw("MEMORY_ACTIVITY_STALLS_L3_MISS", 0x0900_0947),
    EventSpec::raw("BR_MISP_RETIRED_ALL_BRANCHES", 0x00c5),
];

// AMD ZEN 4 -- event[7:0] | umask << 8 | event[11:8] << 32
static AMD_EVENTS: [EventSpec; 8] = [
    EventSpec::raw("EX_RET_INSTR", 0x00c0),
    EventSpec::raw("LS_NOT_HALTED_CYC", 0x0076),
    EventSpec::raw("LS_NOT_HALTED_P0_CYC", 0x1_0000_0120),
    EventSpec::raw("FP_RET_SSE_AVX_OPS_ALL", 0xff03),
    EventSpec::raw("LS_ANY_FILLS_FROM_SYS_DRAM_IO_NEAR", 0x0844),
    EventSpec::raw("LS_ANY_FILLS_FROM_SYS_DRAM_IO_FAR", 0x4044),
    EventSpec::raw("DE_NO_DISPATCH_PER_SLOT_BACKEND_STALLS", 0x1_0000_1ea0),
    EventSpec::raw("EX_RET_BRN_MISP", 0x00c3),
];

// ref-cycles IS UNMAPPED ON ARM AND AMD/HYGON, stalled-cycles-backend ON
// RECENT INTEL. BOTH OPTIONAL SO ANY PMU WITH THE FOUR BASICS CAN RUN.
static GENERIC_EVENTS: [EventSpec; 6] = [
    EventSpec::hw("instructions", HW_INSTRUCTIONS),
    EventSpec::hw("cycles", HW_CPU_CYCLES),
    EventSpec::hw("ref-cycles", HW_REF_CPU_CYCLES).optional(),
    EventSpec::hw("cache-misses", HW_CACHE_MISSES),
    EventSpec::hw("branch-misses", HW_BRANCH_MISSES),
    EventSpec::hw("stalled-cycles-backend", HW_STALLED_CYCLES_BACKEND).optional(),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VendorProfile {
    IntelGoldenCove,
    AmdZen4,
    Generic,
}

impl VendorProfile {
    pub fn from_vendor_id(vendor: &str) -> Self {
        match vendor {
            "GenuineIntel" => Self::IntelGoldenCove,
            "AuthenticAMD" => Self::AmdZen4,
            _ => Self::Generic,
        }
    }

    // FIRST vendor_id LINE WINS. NO LINE -> GENERIC.
    pub fn from_cpuinfo(cpuinfo: &str) -> Self {
        static VENDOR: OnceLock<Regex> = OnceLock::new();
        let re = VENDOR.get_or_init(|| {
            Regex::new(r"(?m)^vendor_id\s*:\s*(\S+)").expect("vendor_id pattern")
        });
        re.captures(cpuinfo)
            .map(|c| Self::from_vendor_id(&c[1]))
            .unwrap_or(Self::Generic)
    }

    pub fn detect() -> Self {
        std::fs::read_to_string(CPUINFO_PATH)
            .map(|s| Self::from_cpuinfo(&s))
            .unwrap_or(Self::Generic)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::IntelGoldenCove => "INTEL_GOLDEN_COVE",
            Self::AmdZen4 => "AMD_ZEN4",
            Self::Generic => "GENERIC",
        }
    }

    pub fn events(self) -> &'static [EventSpec] {
        match self {
            Self::IntelGoldenCove => &INTEL_EVENTS,
            Self::AmdZen4 => &AMD_EVENTS,
            Self::Generic => &GENERIC_EVENTS,
        }
    }

    pub fn group_name(self) -> &'static str {
        match self {
            Self::IntelGoldenCove => "HPC_DVFS_MODEL_INTEL",
            Self::AmdZen4 => "HPC_DVFS_MODEL_AMD",
            Self::Generic => "HPC_DVFS_MODEL",
        }
    }

    // THE AMD GROUP CARRIES NO EXTRA METRICS: ANYTHING BUT 7 MEANS A MISMATCHED DEFINITION
    pub fn metric_rule(self) -> MetricCountRule {
        match self {
            Self::IntelGoldenCove | Self::Generic => MetricCountRule::AtLeast(metrics::FEATURE_COUNT),
            Self::AmdZen4 => MetricCountRule::Exactly(metrics::FEATURE_COUNT),
        }
    }

    // RESOLVED ONCE; THE CONTROL LOOP CALLS THE RETURNED FN EVERY CYCLE
    pub fn deriver(self) -> Deriver {
        match self {
            Self::IntelGoldenCove => metrics::derive_intel,
            Self::AmdZen4 => metrics::derive_amd,
            Self::Generic => metrics::derive_generic,
        }
    }
}

impl std::str::FromStr for VendorProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "intel" => Ok(Self::IntelGoldenCove),
            "amd" => Ok(Self::AmdZen4),
            "generic" => Ok(Self::Generic),
            other => Err(format!("unknown vendor profile '{}' (intel, amd, generic)", other)),
        }
    }
}
