// PHASECTL ERROR TAXONOMY
// FATAL: STARTUP CONFIG, ACQUISITION (MID-LOOP). RECOVERABLE: ACTUATION,
// CLASSIFIER UNAVAILABLE. ZERO DENOMINATORS ARE CLAMPED, NEVER AN ERROR.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // INVALID CONTEXT, TOPOLOGY OR COUNTER SETUP FAILURE. FATAL BEFORE THE LOOP.
    #[error("startup configuration error: {0}")]
    StartupConfig(String),

    // COUNTER START/STOP/READ FAILED MID-LOOP. ENDS THE SESSION.
    #[error("counter acquisition failed: {0}")]
    Acquisition(String),

    // FREQUENCY-SET CALL FAILED. LOGGED, LOOP CONTINUES.
    #[error("failed to set frequency to {khz} kHz: {reason}")]
    Actuation { khz: u64, reason: String },

    // NO CLASSIFIER BOUND. CYCLE SKIPPED.
    #[error("no phase classifier registered")]
    ClassifierUnavailable,

    // EXPECTED low <= med <= high. WARNED, NOT ENFORCED.
    #[error("frequency thresholds out of order: low={low} med={med} high={high} kHz")]
    ThresholdOrder { low: u64, med: u64, high: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    // FATAL ERRORS END THE SESSION; EVERYTHING ELSE IS LOGGED AND SKIPPED
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StartupConfig(_) | Self::Acquisition(_) | Self::Io(_))
    }
}
