// PHASECTL LIBRARY
// WORKLOAD-PHASE-AWARE DVFS: SAMPLE COUNTERS, DERIVE FEATURES, CLASSIFY, SET FREQUENCY.
// THE BINARY AND THE INTEGRATION TESTS BOTH BUILD ON THESE MODULES.

pub mod classifier;
pub mod config;
pub mod controller;
pub mod counters;
pub mod error;
pub mod event;
pub mod metrics;
pub mod perf;
pub mod policy;
pub mod topology;
pub mod vendor;
