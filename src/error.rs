//! Errors that can occur in fxcorr

use thiserror::Error;

/// An enum of all the errors possible in fxcorr
#[derive(Error, Debug)]
pub enum FxcorrError {
    #[error(transparent)]
    /// Error derived from [`crate::control::ControlError`]
    Control(#[from] crate::control::ControlError),

    #[error(transparent)]
    /// Error derived from [`crate::vex::VexError`]
    Vex(#[from] crate::vex::VexError),

    #[error(transparent)]
    /// Error derived from [`crate::input::extractor::FormatError`]
    Format(#[from] crate::input::extractor::FormatError),

    #[error(transparent)]
    /// Error derived from [`crate::transport::TransportError`]
    Transport(#[from] crate::transport::TransportError),

    #[error(transparent)]
    /// Error derived from [`crate::delay::DelayError`]
    Delay(#[from] crate::delay::DelayError),

    #[error(transparent)]
    /// Error derived from [`crate::cal::CalError`]
    Cal(#[from] crate::cal::CalError),

    #[error(transparent)]
    /// Error derived from [`crate::output::OutputError`]
    Output(#[from] crate::output::OutputError),

    #[error(transparent)]
    /// Error derived from [`crate::corr::correlation::CorrError`]
    Corr(#[from] crate::corr::correlation::CorrError),

    #[error(transparent)]
    /// Error derived from [`clap::Error`]
    Clap(#[from] clap::Error),

    #[error(transparent)]
    /// Generic IO error
    IO(#[from] std::io::Error),

    /// A node reported a fatal condition and the run was terminated.
    #[error("rank {rank} raised an assertion: {message}")]
    AssertionRaised {
        /// The rank that raised the assertion
        rank: u16,
        /// The message it sent with it
        message: String,
    },
}
