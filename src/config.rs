// PHASECTL FREQUENCY CONFIGURATION
// THREE THRESHOLDS (kHz), LOADED ONCE AT STARTUP, IMMUTABLE AFTERWARD.
//
// FILE FORMAT: ONE "<KEY> <UNSIGNED>" PER LINE. '#' AND BLANK LINES SKIPPED.
// UNKNOWN KEYS IGNORED. DUPLICATES: LAST WRITE WINS.
// MISSING OR UNREADABLE FILE: WARN AND KEEP BUILT-IN DEFAULTS.

use std::path::Path;
use std::sync::OnceLock;

use log::{info, warn};
use regex::Regex;

use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_PATH: &str = "dvfs_settings.conf";

pub const DEFAULT_LOW_FREQ_KHZ: u64  = 800_000;
pub const DEFAULT_MED_FREQ_KHZ: u64  = 1_800_000;
pub const DEFAULT_HIGH_FREQ_KHZ: u64 = 2_500_000;

const KEY_LOW: &str  = "LOW_FREQ_KHZ";
const KEY_MED: &str  = "MED_FREQ_KHZ";
const KEY_HIGH: &str = "HIGH_FREQ_KHZ";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreqConfig {
    pub low_freq_khz: u64,
    pub med_freq_khz: u64,
    pub high_freq_khz: u64,
}

impl Default for FreqConfig {
    fn default() -> Self {
        Self {
            low_freq_khz: DEFAULT_LOW_FREQ_KHZ,
            med_freq_khz: DEFAULT_MED_FREQ_KHZ,
            high_freq_khz: DEFAULT_HIGH_FREQ_KHZ,
        }
    }
}

// KEY TOKEN, WHITESPACE, LEADING DIGITS. TRAILING TEXT AFTER THE DIGITS IS IGNORED.
fn line_pattern() -> &'static Regex {
    static LINE: OnceLock<Regex> = OnceLock::new();
    LINE.get_or_init(|| Regex::new(r"^\s*(\S+)\s+(\d+)").expect("config line pattern"))
}

impl FreqConfig {
    // DEFAULTS OVERRIDDEN BY EVERY RECOGNIZED LINE, IN ORDER
    pub fn parse(text: &str) -> Self {
        let mut cfg = Self::default();
        for line in text.lines() {
            if line.starts_with('#') || line.is_empty() {
                continue;
            }
            let Some(caps) = line_pattern().captures(line) else {
                continue;
            };
            let Ok(value) = caps[2].parse::<u64>() else {
                warn!("CONFIG: VALUE OUT OF RANGE, LINE SKIPPED: {}", line.trim());
                continue;
            };
            match &caps[1] {
                KEY_LOW => cfg.low_freq_khz = value,
                KEY_MED => cfg.med_freq_khz = value,
                KEY_HIGH => cfg.high_freq_khz = value,
                _ => {}
            }
        }
        cfg
    }

    // NON-FATAL: AN UNREADABLE FILE LEAVES THE DEFAULTS IN EFFECT
    pub fn load(path: &Path) -> Self {
        // LOSSY DECODE: A NON-UTF-8 BYTE ANYWHERE MUST NOT DISCARD THE OTHER LINES
        let cfg = match std::fs::read(path) {
            Ok(bytes) => {
                let cfg = Self::parse(&String::from_utf8_lossy(&bytes));
                info!(
                    "CONFIG: LOADED {} (low={} med={} high={} kHz)",
                    path.display(), cfg.low_freq_khz, cfg.med_freq_khz, cfg.high_freq_khz,
                );
                cfg
            }
            Err(e) => {
                warn!("CONFIG: COULD NOT READ {} ({}), USING DEFAULTS", path.display(), e);
                Self::default()
            }
        };
        if let Err(e) = cfg.validate() {
            warn!("CONFIG: {}", e);
        }
        cfg
    }

    // ORDERING IS EXPECTED, NOT ENFORCED. CALLERS DECIDE WHETHER TO REFUSE.
    pub fn validate(&self) -> Result<()> {
        if self.low_freq_khz <= self.med_freq_khz && self.med_freq_khz <= self.high_freq_khz {
            Ok(())
        } else {
            Err(Error::ThresholdOrder {
                low: self.low_freq_khz,
                med: self.med_freq_khz,
                high: self.high_freq_khz,
            })
        }
    }
}
