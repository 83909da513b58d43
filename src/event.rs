// PHASECTL EVENT LOG
// RECORDS ONE SNAPSHOT PER CONTROL CYCLE.
// PRE-ALLOCATED RING BUFFER. NO HEAP ALLOCATION DURING THE LOOP.
// WRAPS AROUND AT CAPACITY -- OLDEST ENTRIES OVERWRITTEN.

use crate::classifier::PhaseLevel;
use crate::metrics::FeatureVector;
use crate::policy::Outcome;

pub const MAX_SNAPSHOTS: usize = 8192;

// WHAT THE ACTUATION STEP DID THIS CYCLE
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Skipped,
    Unchanged,
    Applied,
    Failed,
}

impl Action {
    fn label(self) -> &'static str {
        match self {
            Self::Skipped => "SKIP",
            Self::Unchanged => "-",
            Self::Applied => "SET",
            Self::Failed => "FAIL",
        }
    }
}

impl From<Outcome> for Action {
    fn from(o: Outcome) -> Self {
        match o {
            Outcome::Unchanged(_) => Self::Unchanged,
            Outcome::Applied(_) => Self::Applied,
            Outcome::Failed(_) => Self::Failed,
        }
    }
}

#[derive(Clone, Copy)]
pub struct Snapshot {
    pub ts_ns:      u64,
    pub elapsed_ns: u64,
    pub level:      Option<PhaseLevel>,
    pub target_khz: u64,
    pub action:     Action,
    pub features:   FeatureVector,
}

const EMPTY: Snapshot = Snapshot {
    ts_ns: 0,
    elapsed_ns: 0,
    level: None,
    target_khz: 0,
    action: Action::Skipped,
    features: FeatureVector {
        cpi: 0.0,
        math_intensity: 0.0,
        stall_ratio: 0.0,
        bandwidth_proxy: 0.0,
        branch_mpki: 0.0,
        gflops_approx: 0.0,
        clock_ratio: 0.0,
    },
};

pub struct EventLog {
    snapshots: Vec<Snapshot>,
    head:      usize,
    len:       usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            snapshots: vec![EMPTY; MAX_SNAPSHOTS],
            head: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    // RECORD ONE CYCLE. OVERWRITES OLDEST ENTRY WHEN FULL.
    pub fn record(&mut self, elapsed_ns: u64, features: FeatureVector,
                  level: Option<PhaseLevel>, target_khz: u64, action: Action) {
        self.snapshots[self.head] = Snapshot {
            ts_ns: now_ns(),
            elapsed_ns,
            level,
            target_khz,
            action,
            features,
        };
        self.head = (self.head + 1) % MAX_SNAPSHOTS;
        if self.len < MAX_SNAPSHOTS {
            self.len += 1;
        }
    }

    // ITERATE SNAPSHOTS IN CHRONOLOGICAL ORDER
    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        let start = if self.len < MAX_SNAPSHOTS { 0 } else { self.head };
        (0..self.len).map(move |i| {
            &self.snapshots[(start + i) % MAX_SNAPSHOTS]
        })
    }

    // (LOW, MED, HIGH, UNKNOWN, UNCLASSIFIED)
    pub fn level_counts(&self) -> [u64; 5] {
        let mut counts = [0u64; 5];
        for s in self.iter() {
            let idx = match s.level {
                Some(PhaseLevel::Low) => 0,
                Some(PhaseLevel::Med) => 1,
                Some(PhaseLevel::High) => 2,
                Some(PhaseLevel::Unknown) => 3,
                None => 4,
            };
            counts[idx] += 1;
        }
        counts
    }

    // DUMP THE TIME SERIES AFTER EXECUTION
    pub fn dump(&self) {
        let mut iter = self.iter();
        let Some(first) = iter.next() else {
            return;
        };
        let base_ts = first.ts_ns;

        println!("\n{:<9} {:<8} {:<8} {:<8} {:<8} {:<9} {:<8} {:<8} {:<8} {:<11} {:<5}",
            "TIME_S", "CPI", "MATH_I", "STALL", "BW_GBS", "BR_MPKI", "GFLOPS", "CLK", "LEVEL", "TARGET_KHZ", "ACT");
        println!("{}", "-".repeat(100));

        for s in std::iter::once(first).chain(iter) {
            let elapsed_s = (s.ts_ns - base_ts) as f64 / 1_000_000_000.0;
            let f = &s.features;
            println!("{:<9.1} {:<8.3} {:<8.3} {:<8.3} {:<8.3} {:<9.3} {:<8.3} {:<8.3} {:<8} {:<11} {:<5}",
                elapsed_s, f.cpi, f.math_intensity, f.stall_ratio, f.bandwidth_proxy,
                f.branch_mpki, f.gflops_approx, f.clock_ratio,
                s.level.map(|l| l.label()).unwrap_or("NONE"), s.target_khz, s.action.label());
        }

        if self.len == MAX_SNAPSHOTS {
            println!("\n(RING BUFFER WRAPPED -- SHOWING MOST RECENT {} SNAPSHOTS)", MAX_SNAPSHOTS);
        }
        println!("TOTAL SNAPSHOTS: {}", self.len);
    }

    // SUMMARY STATISTICS
    pub fn summary(&self) {
        if self.len < 2 {
            return;
        }

        let snapshots: Vec<&Snapshot> = self.iter().collect();

        let applied = snapshots.iter().filter(|s| s.action == Action::Applied).count();
        let failed = snapshots.iter().filter(|s| s.action == Action::Failed).count();
        let skipped = snapshots.iter().filter(|s| s.action == Action::Skipped).count();
        let avg_cpi = snapshots.iter().map(|s| s.features.cpi).sum::<f64>() / snapshots.len() as f64;
        let peak_gflops = snapshots.iter().map(|s| s.features.gflops_approx).fold(0.0f64, f64::max);
        let peak_bw = snapshots.iter().map(|s| s.features.bandwidth_proxy).fold(0.0f64, f64::max);

        let (Some(first), Some(last)) = (snapshots.first(), snapshots.last()) else {
            return;
        };
        let elapsed_s = (last.ts_ns - first.ts_ns) as f64 / 1_000_000_000.0;

        println!("\n{}", "=".repeat(50));
        println!("PHASECTL SUMMARY");
        println!("{}", "=".repeat(50));
        println!("  CYCLES:            {}", self.len);
        println!("  FREQ CHANGES:      {}", applied);
        println!("  FAILED CHANGES:    {}", failed);
        println!("  UNCLASSIFIED:      {}", skipped);
        println!("  AVG CPI:           {:.3}", avg_cpi);
        println!("  PEAK GFLOPS:       {:.3}", peak_gflops);
        println!("  PEAK BW (GB/S):    {:.3}", peak_bw);

        let c = self.level_counts();
        let classified = c[0] + c[1] + c[2] + c[3];
        if classified > 0 {
            let pct = |n: u64| n as f64 / classified as f64 * 100.0;
            println!("  PHASES:            LOW {:.1}% / MED {:.1}% / HIGH {:.1}% / UNKNOWN {:.1}%",
                pct(c[0]), pct(c[1]), pct(c[2]), pct(c[3]));
        }
        println!("  ELAPSED:           {:.1}s", elapsed_s);
    }
}

fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}
