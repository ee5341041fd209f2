//! A distributed software FX correlator for very-long-baseline
//! interferometry.
//!
//! Radio telescopes record bit-packed baseband samples of the same sources
//! onto disk; `fxcorr` reads those recordings, aligns them in time with
//! sub-sample precision from per-station delay models, splits the signal
//! into frequency channels, and computes cross- and auto-spectra integrated
//! over short intervals.
//!
//! The process set is a manager, a log node, an output node, one input node
//! per station datastream, and a pool of correlator nodes, communicating
//! over point-to-point TCP links; see the module docs of [`manager`],
//! [`input`], [`corr`], [`output`] and [`transport`] for the pieces.

pub mod cal;
pub mod cluster;
pub mod context;
pub mod control;
pub mod corr;
pub mod delay;
pub mod error;
pub mod input;
pub mod log_node;
pub mod manager;
pub mod msg;
pub mod node;
pub mod output;
pub mod time;
pub mod transport;
pub mod vex;
pub mod window;

#[doc(hidden)]
pub mod test_common;

pub use context::RunContext;
pub use control::ControlFile;
pub use error::FxcorrError;
pub use time::{Time, TimeDelta};
pub use vex::Vex;
