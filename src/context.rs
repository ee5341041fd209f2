//! The run context: every process-wide parameter, constructed once at
//! startup and passed explicitly to the components that need it.

use std::sync::Arc;

use crate::control::ControlFile;
use crate::vex::Vex;

/// Immutable parameters shared by every node of a run.
///
/// The original design kept these as process-wide singletons (run
/// parameters, station parameters, the random seed); collapsing them into
/// one value makes runs, and especially tests, deterministic.
#[derive(Debug)]
pub struct RunContext {
    /// The parsed control file
    pub control: ControlFile,
    /// The parsed observation metadata
    pub vex: Vex,
    /// Seed for the header-replacement bit generator
    pub seed: u32,
    /// Deterministic dispatch: visit correlators in rank order instead of
    /// serving the ready queue
    pub deterministic: bool,
    /// Verify the declared byte count of a short slice against the measured
    /// count and abort on mismatch
    pub strict_slice_accounting: bool,
    /// Interpret unit-less clock rates as µs/s (the historical convention)
    pub clock_rate_unitless_usec_per_sec: bool,
    /// Re-validate frame headers and track statistics every this many frames
    pub check_interval: u32,
}

impl RunContext {
    /// A context with the conventional policy switches.
    pub fn new(control: ControlFile, vex: Vex, seed: u32) -> Arc<Self> {
        Arc::new(Self {
            control,
            vex,
            seed,
            deterministic: false,
            strict_slice_accounting: false,
            clock_rate_unitless_usec_per_sec: true,
            check_interval: 100,
        })
    }
}
