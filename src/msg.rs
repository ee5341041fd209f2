//! Typed control messages.
//!
//! Every control-plane exchange is one of these records, addressed to a
//! peer rank and carried by the transport layer. Recipients switch on the
//! variant, one handler per variant, and must not assume any ordering
//! between different variants from the same sender.

use serde::{Deserialize, Serialize};

use crate::delay::DelayTable;
use crate::time::{Time, TimeDelta};
use crate::vex::{DataFormat, Sideband};
use crate::window::WindowFunction;

/// A node's advertised data endpoint: candidate addresses in preference
/// order (fastest interface first, hostname last), one port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    /// Candidate addresses, tried in order
    pub addrs: Vec<String>,
    /// TCP port of the data listener
    pub port: u16,
}

/// Track selection for one output channel of an input node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelParameters {
    /// Channel name from the frequency setup
    pub channel_name: String,
    /// Bit positions of the sign tracks, fan-out order
    pub sign_tracks: Vec<u32>,
    /// Bit positions of the magnitude tracks, fan-out order; empty for 1-bit
    pub magnitude_tracks: Vec<u32>,
}

/// Everything an input node needs to extract channels for one scan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputNodeParameters {
    /// The recording format
    pub frame_format: DataFormat,
    /// Channels to extract, in channel-index order
    pub channels: Vec<ChannelParameters>,
    /// Sample rate of the recording, samples/s
    pub sample_rate: u64,
    /// Bits per sample (1 or 2)
    pub bits_per_sample: u8,
    /// Reader offset from the clock model: the cursor is shifted by this
    /// before slicing, so only a sub-second residual enters the delay model
    pub reader_offset: TimeDelta,
    /// Reference date resolving truncated header timecodes (Mark4 carries
    /// one year digit, VLBA three MJD digits)
    pub ref_time: Time,
    /// Replace header sample positions with pseudo-random bits
    pub randomise_headers: bool,
}

/// One station stream of a correlation slice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StationStream {
    /// Input-node index the stream comes from
    pub station_stream: usize,
    /// Station name, for the output record
    pub station_name: String,
    /// Sample rate of this station's recording, samples/s
    pub sample_rate: u64,
    /// Bandwidth of the channel, Hz
    pub bandwidth_hz: f64,
    /// Net sideband of the channel
    pub sideband: Sideband,
    /// Channel sky frequency (band edge), Hz
    pub channel_freq_hz: f64,
    /// Polarisation of the channel
    pub polarisation: char,
    /// LO offset for this station and integration, Hz
    pub lo_offset_hz: f64,
    /// Extra fixed delay, seconds
    pub extra_delay_sec: f64,
    /// Bits per sample
    pub bits_per_sample: u8,
}

/// The work order for one (slice, channel) tuple.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrelationParameters {
    /// Integration number within the run
    pub integration_nr: i64,
    /// Dense output slice number
    pub slice_nr: i64,
    /// Sub-slice number within the integration
    pub sub_slice_nr: usize,
    /// Channel index being correlated
    pub channel_nr: usize,
    /// Cross-polarisation partner channel, when cross_polarize is on
    pub cross_channel_nr: Option<usize>,
    /// Start of the integration this slice belongs to
    pub integration_start: Time,
    /// Start of this slice
    pub slice_start: Time,
    /// Duration of this slice
    pub slice_time: TimeDelta,
    /// Sample rate the correlation runs at (the setup station's), samples/s
    pub sample_rate: u64,
    /// Sky frequency of the correlation band edge, Hz
    pub channel_freq_hz: f64,
    /// Bandwidth of the correlation band, Hz
    pub bandwidth_hz: f64,
    /// Net sideband of the correlation band
    pub sideband: Sideband,
    /// Samples per station consumed by this slice at `sample_rate`
    pub slice_size: usize,
    /// FFT size of the delay correction
    pub fft_size_delaycor: usize,
    /// FFT size of the correlation
    pub fft_size_correlation: usize,
    /// Output spectral channels
    pub number_channels: usize,
    /// Window applied before the correlation FFT
    pub window: WindowFunction,
    /// Source observed in this scan (the first, in multi-phase-centre runs)
    pub source: String,
    /// All sources of the scan, in phase-centre order (multi-phase-centre
    /// runs only; empty otherwise)
    pub phase_center_sources: Vec<String>,
    /// Number of phase centres to produce
    pub n_phase_centers: usize,
    /// Output streams of the whole run (pulsar bins or sources); every
    /// slice yields exactly one record per stream, zero-weight where the
    /// scan doesn't populate it
    pub n_output_streams: usize,
    /// Multi-phase-centre mode
    pub multi_phase_center: bool,
    /// Pulsar binning mode
    pub pulsar_binning: bool,
    /// Participating station streams for the primary channel
    pub station_streams: Vec<StationStream>,
    /// Station streams for the cross-polarisation channel, same order
    pub cross_streams: Vec<StationStream>,
}

/// Pulsar binning parameters broadcast to every correlator node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PulsarParameters {
    /// Pulsar name
    pub name: String,
    /// Phase interval covered by the on-pulse bins, in turns
    pub interval: [f64; 2],
    /// Number of on-pulse bins; bin `nbins` is the off-pulse bin
    pub nbins: usize,
    /// Reference MJD of the phase polynomial
    pub ref_mjd: f64,
    /// Phase at the reference time, turns
    pub ref_phase: f64,
    /// Rotation frequency at the reference time, Hz
    pub ref_f0: f64,
    /// Polynomial coefficients, TEMPO convention (minutes from ref time)
    pub coefficients: Vec<f64>,
}

/// A control message. The variant is the tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CtrlMsg {
    /// First message a node receives: become an input node
    SetInputNode {
        /// Input-node index (0-based, rank − 3)
        input_nr: usize,
        /// Station name
        station: String,
        /// Datastream name ("" for the single unnamed stream)
        datastream: String,
        /// Recording format
        format: DataFormat,
    },
    /// First message a node receives: become the output node
    SetOutputNode,
    /// First message a node receives: become the log node
    SetLogNode {
        /// Write diagnostics to this file instead of the process logger
        file: Option<String>,
    },
    /// First message a node receives: become a correlator node
    SetCorrelatorNode {
        /// Correlator index (0-based)
        corr_nr: usize,
        /// Input nodes in the run; cross-channel streams arrive on
        /// incoming stream indices offset by this
        n_inputs: usize,
    },
    /// Adjust the diagnostic verbosity of a node
    SetMessageLevel(i32),
    /// Drain and shut down; `error` when terminating after an assertion
    EndNode {
        /// Whether the run is ending in error
        error: bool,
    },

    /// Give an input node its recording (the concatenation of the sources)
    AddDataReaderFile {
        /// Recording URIs, concatenated in order
        sources: Vec<String>,
    },
    /// Give the output node a file for one output stream
    AddDataWriterFile {
        /// Output stream index (pulsar bin or source number)
        stream_nr: usize,
        /// Output URI
        path: String,
    },
    /// Command the writer side of a data edge to connect to a reader
    ConnectTo {
        /// The writer's outgoing stream index
        stream_nr: usize,
        /// The reader's advertised endpoint
        endpoint: Endpoint,
        /// The reader's rank (for the stream hello)
        peer_rank: u16,
        /// The reader's incoming stream index
        peer_stream: usize,
    },
    /// Writer → manager: the commanded connection is up
    ConnectionEstablished {
        /// The writer's outgoing stream index
        stream_nr: usize,
    },
    /// Node → manager: bootstrap complete
    NodeInitialised,

    /// Scan setup for an input node
    InputNodeSetParameters(InputNodeParameters),
    /// Manager → input: report the current read time
    InputNodeGetCurrentTime,
    /// Input → manager: the current read time
    InputNodeCurrentTime(Time),
    /// Reposition to `start`, produce until `stop`, exit after `leave_at`
    InputNodeSetTime {
        start: Time,
        stop: Time,
        leave_at: Time,
    },
    /// Append a work item to an input node's slice queue
    InputNodeAddTimeSlice {
        /// Channel index to extract
        channel: usize,
        /// Outgoing stream to write it to
        stream_nr: usize,
        /// Slice start
        start: Time,
        /// Slice stop
        stop: Time,
        /// Exact sample count the consumer expects
        slice_samples: u64,
    },

    /// Broadcast delay/UVW table for one station stream
    SetDelayTable {
        /// Input-node index the table belongs to
        input_nr: usize,
        /// Phase centre the table is for (0 = reference source)
        source_nr: usize,
        /// The table, clock offset composed
        table: DelayTable,
    },
    /// Broadcast the source list of the run
    SetSources(Vec<String>),
    /// Broadcast pulsar binning parameters
    SetPulsarParameters(PulsarParameters),
    /// Give a correlator node the calibration table path
    SetCalTable {
        /// CL table URI
        path: String,
    },

    /// Dispatch one slice to a correlator node
    CorrelatorParameters(Box<CorrelationParameters>),
    /// Correlator → manager: idle, ready for the next slice
    CorrelationReady {
        /// Correlator index
        corr_nr: usize,
    },

    /// Manager → output: the serialized global header, written before any record
    OutputGlobalHeader(Vec<u8>),
    /// Manager → output: no slice numbered ≥ this will ever arrive
    OutputFinalSlice {
        /// Total number of slices in the run
        n_slices: i64,
    },
    /// Output → manager: all slices written
    OutputFinished,

    /// Any → log node: one diagnostic line
    LogMessage {
        /// Rank the line originated from
        rank: u16,
        /// Verbosity level
        level: i32,
        /// The line
        text: String,
    },
    /// Any → manager: fatal condition; the manager terminates the run
    AssertionRaised {
        /// The message sent with the assertion
        message: String,
    },
}

/// The fixed header preceding each slice on a data stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SliceHeader {
    /// Channel index the samples belong to
    pub channel: u32,
    /// Slice start time
    pub start: Time,
    /// Sample count the producer was asked for
    pub samples_expected: u64,
    /// Sample count actually present (smaller on a short read)
    pub samples_sent: u64,
    /// The coarse delay shift, in samples, the producer already applied:
    /// the payload starts at recording time `start + shift / rate`. The
    /// consumer corrects only the residual per FFT window.
    pub applied_shift_samples: i64,
    /// Payload bytes following this header
    pub bytes: u64,
}
