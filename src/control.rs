//! The correlation control file.
//!
//! A run is parameterised once at startup by a JSON control document. This
//! module owns deserialisation, the defaulting rules that depend on other
//! options (window function, FFT sizes, sub-integration length), and the
//! validation pass that turns a malformed document into a configuration
//! error before any node is started.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time::{Time, TimeDelta};
use crate::window::WindowFunction;

/// Errors raised while loading or validating a control file
#[derive(Error, Debug)]
pub enum ControlError {
    /// The document could not be read from disk
    #[error("could not read control file {path}: {source}")]
    Unreadable {
        /// Path of the control file
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// The document is not valid JSON or is missing required fields
    #[error("could not parse control file {path}: {source}")]
    Parse {
        /// Path of the control file
        path: PathBuf,
        /// The serde error
        source: serde_json::Error,
    },

    /// A field failed validation
    #[error("ctrl-file: {0}")]
    Invalid(String),

    /// A date string could not be interpreted
    #[error("ctrl-file: cannot parse date \"{0}\"")]
    BadDate(String),
}

/// Data sources for one station: either a flat list of recording URIs or a
/// map of named datastreams, each with its own list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataSources {
    /// A single unnamed datastream
    Single(Vec<String>),
    /// Named datastreams
    Streams(BTreeMap<String, Vec<String>>),
}

impl DataSources {
    /// The datastream names for this station, in order. A single unnamed
    /// stream is reported as `[""]`.
    pub fn stream_names(&self) -> Vec<String> {
        match self {
            DataSources::Single(_) => vec![String::new()],
            DataSources::Streams(map) => map.keys().cloned().collect(),
        }
    }

    /// The recording URIs of the given datastream.
    pub fn sources(&self, stream: &str) -> &[String] {
        match self {
            DataSources::Single(v) => v,
            DataSources::Streams(map) => map.get(stream).map(Vec::as_slice).unwrap_or(&[]),
        }
    }
}

/// A per-station LO offset: a constant, or a [start, end, steps] sweep
/// stepped by integration number.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoOffset {
    /// Constant offset in Hz
    Constant(f64),
    /// Sweep: [start_hz, end_hz, steps]
    Sweep([f64; 3]),
}

/// Spectral masking setup: per-channel masks and weights applied by the
/// consumer tools, carried through the run unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaskParameters {
    /// Normalise the masked spectra
    #[serde(default)]
    pub normalize: bool,
    /// Per-station mask files
    #[serde(default)]
    pub mask_files: Vec<String>,
    /// Per-station weight files
    #[serde(default)]
    pub weight_files: Vec<String>,
}

/// One pulsar's binning setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulsarEntry {
    /// Pulse phase interval covered by the on-pulse bins, [start, stop] in turns
    pub interval: [f64; 2],
    /// Number of on-pulse bins
    pub nbins: usize,
    /// Polyco file describing the pulsar phase polynomial
    pub polyco_file: String,
}

/// The parsed control document.
///
/// Optional fields keep their `None` until [`ControlFile::apply_defaults`]
/// fills them; accessors unwrap only after that pass has run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlFile {
    /// Correlation window start, VEX date string or "now"
    pub start: String,
    /// Correlation window stop, VEX date string or "end"
    pub stop: String,
    /// Integration length in microseconds
    pub integr_time: f64,
    /// Sub-integration length in microseconds
    #[serde(default)]
    pub sub_integr_time: Option<f64>,
    /// Number of spectral channels in the output
    pub number_channels: usize,
    /// FFT size used for the delay correction
    #[serde(default)]
    pub fft_size_delaycor: Option<usize>,
    /// FFT size used for the correlation itself
    #[serde(default)]
    pub fft_size_correlation: Option<usize>,
    /// Window applied before the correlation FFT
    #[serde(default)]
    pub window_function: Option<WindowFunction>,
    /// Stations participating in the run
    pub stations: Vec<String>,
    /// The station used for deterministic per-channel setup lookups
    #[serde(default)]
    pub reference_station: Option<String>,
    /// The station whose mode setup defines the channel list
    #[serde(default)]
    pub setup_station: Option<String>,
    /// Recordings per station
    pub data_sources: BTreeMap<String, DataSources>,
    /// Directory holding (or receiving) the per-station delay tables
    pub delay_directory: String,
    /// Output file URI
    pub output_file: String,
    /// Phasecal extraction output, if any
    #[serde(default)]
    pub phasecal_file: Option<String>,
    /// Phasecal integration time in seconds
    #[serde(default)]
    pub phasecal_integr_time: Option<i64>,
    /// Tsys output, if any
    #[serde(default)]
    pub tsys_file: Option<String>,
    /// Station calibration (CL) table applied before accumulation
    #[serde(default)]
    pub cal_file: Option<String>,
    /// Tsys extraction frequency per station
    #[serde(default)]
    pub tsys_freq: BTreeMap<String, i64>,
    /// Correlate cross-polarisation products
    #[serde(default)]
    pub cross_polarize: bool,
    /// Pulsar binning mode
    #[serde(default)]
    pub pulsar_binning: bool,
    /// Per-pulsar binning setup, keyed by pulsar name
    #[serde(default)]
    pub pulsars: BTreeMap<String, PulsarEntry>,
    /// Phased-array mode (summation instead of correlation)
    #[serde(default)]
    pub phased_array: bool,
    /// Multiple phase centres per scan
    #[serde(default)]
    pub multi_phase_center: bool,
    /// Spectral masking setup
    #[serde(default)]
    pub mask: Option<MaskParameters>,
    /// Per-station LO offsets
    #[serde(default, rename = "LO_offset")]
    pub lo_offset: BTreeMap<String, LoOffset>,
    /// Per-station extra delay (seconds), keyed by channel name or polarisation
    #[serde(default)]
    pub extra_delay: BTreeMap<String, BTreeMap<String, f64>>,
    /// Job number carried into the output header
    #[serde(default)]
    pub job: i32,
    /// Subjob number carried into the output header
    #[serde(default)]
    pub subjob: i32,
    /// Diagnostic verbosity forwarded to the log node
    #[serde(default = "default_message_level")]
    pub message_level: i32,
    /// Abort the run when an input node has no data at all
    #[serde(default)]
    pub exit_on_empty_datastream: Option<bool>,
    /// Number of sub-slices per integration
    #[serde(default)]
    pub slices_per_integration: Option<usize>,
}

fn default_message_level() -> i32 {
    1
}

impl ControlFile {
    /// Read a control file from disk, fill in defaults and validate.
    pub fn from_file(path: &Path) -> Result<Self, ControlError> {
        let file = File::open(path).map_err(|source| ControlError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let mut ctrl: ControlFile =
            serde_json::from_reader(file).map_err(|source| ControlError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        ctrl.apply_defaults();
        ctrl.validate()?;
        Ok(ctrl)
    }

    /// Fill unset options from the ones that are set. The rules interlock:
    /// the window and the FFT sizes depend on the multi-phase-centre flag,
    /// and the delay-correction FFT may not exceed the correlation FFT.
    pub fn apply_defaults(&mut self) {
        if self.window_function.is_none() {
            self.window_function = Some(if self.multi_phase_center {
                WindowFunction::None
            } else {
                WindowFunction::Hann
            });
        }
        if self.fft_size_correlation.is_none() {
            let mut min_size = if self.multi_phase_center { 4096 } else { 256 };
            if let Some(delaycor) = self.fft_size_delaycor {
                min_size = min_size.max(delaycor);
            }
            self.fft_size_correlation = Some(min_size.max(self.number_channels));
        }
        if self.fft_size_delaycor.is_none() {
            self.fft_size_delaycor = Some(256.min(self.fft_size_correlation.unwrap()));
        }
        if self.sub_integr_time.is_none() {
            let integr_usec = self.integr_time.round();
            self.sub_integr_time = Some(if self.multi_phase_center {
                integr_usec.min(20480.)
            } else {
                integr_usec.min(125000.)
            });
        }
        if self.exit_on_empty_datastream.is_none() {
            self.exit_on_empty_datastream = Some(true);
        }
        if self.slices_per_integration.is_none() {
            self.slices_per_integration = Some(1);
        }
        if self.phasecal_integr_time.is_none() {
            self.phasecal_integr_time = Some(if self.phasecal_file.is_some() { 10 } else { 0 });
        }
    }

    /// Validate the document. Assumes [`ControlFile::apply_defaults`] ran.
    pub fn validate(&self) -> Result<(), ControlError> {
        let invalid = |msg: String| Err(ControlError::Invalid(msg));

        if self.integr_time <= 0. {
            return invalid(format!("integr_time is negative: {}", self.integr_time));
        }
        let sub = self.sub_integr_time.unwrap();
        if sub <= 0. {
            return invalid(format!("sub_integr_time is negative: {sub}"));
        }
        if self.integr_time < sub {
            return invalid(format!(
                "sub_integr_time ({sub} us) exceeds integr_time ({} us)",
                self.integr_time
            ));
        }
        let delaycor = self.fft_size_delaycor.unwrap();
        let correlation = self.fft_size_correlation.unwrap();
        if !delaycor.is_power_of_two() {
            return invalid(format!("fft_size_delaycor is not a power of two: {delaycor}"));
        }
        if !correlation.is_power_of_two() {
            return invalid(format!(
                "fft_size_correlation is not a power of two: {correlation}"
            ));
        }
        if correlation < self.number_channels {
            return invalid(format!(
                "fft_size_correlation ({correlation}) cannot be smaller than the number of channels ({})",
                self.number_channels
            ));
        }
        if correlation < delaycor {
            return invalid(format!(
                "fft_size_correlation ({correlation}) should not be smaller than fft_size_delaycor ({delaycor})"
            ));
        }
        if self.pulsar_binning && self.multi_phase_center {
            return invalid("pulsar_binning and multi_phase_center are mutually exclusive".into());
        }
        if self.phased_array && self.pulsar_binning {
            return invalid("phased_array and pulsar_binning are mutually exclusive".into());
        }
        if self.phased_array {
            return invalid("phased_array runs are not supported by this correlator".into());
        }
        if self.pulsar_binning {
            if self.pulsars.is_empty() {
                return invalid("no pulsars block in control file".into());
            }
            for (name, pulsar) in &self.pulsars {
                if pulsar.nbins == 0 {
                    return invalid(format!("pulsar {name} has zero bins"));
                }
            }
        }
        if self.stations.is_empty() {
            return invalid("no stations listed".into());
        }
        for station in &self.stations {
            if !self.data_sources.contains_key(station) {
                return invalid(format!("no data_sources entry for station {station}"));
            }
        }
        if let Some(reference) = &self.reference_station {
            if !self.stations.contains(reference) {
                return invalid(format!("reference_station {reference} is not a station"));
            }
        }
        // "now" and "end" resolve at start-up; anything else must parse.
        // Checked here so a bad window is a configuration error rather than
        // a mid-run surprise.
        if self.start != "now" && Time::parse_vex(&self.start).is_none() {
            return Err(ControlError::BadDate(self.start.clone()));
        }
        if self.stop != "end" && Time::parse_vex(&self.stop).is_none() {
            return Err(ControlError::BadDate(self.stop.clone()));
        }
        if let (Some(start), Some(stop)) =
            (Time::parse_vex(&self.start), Time::parse_vex(&self.stop))
        {
            if stop <= start {
                return invalid(format!(
                    "stop ({}) is not after start ({})",
                    self.stop, self.start
                ));
            }
        }
        Ok(())
    }

    /// The correlation window, resolved against the experiment span from the
    /// observation metadata ("now" → experiment start, "end" → last scan end).
    pub fn window(&self, exper_start: Time, exper_stop: Time) -> Result<(Time, Time), ControlError> {
        let start = if self.start == "now" {
            exper_start
        } else {
            Time::parse_vex(&self.start).ok_or_else(|| ControlError::BadDate(self.start.clone()))?
        };
        let stop = if self.stop == "end" {
            exper_stop
        } else {
            Time::parse_vex(&self.stop).ok_or_else(|| ControlError::BadDate(self.stop.clone()))?
        };
        if stop <= start {
            return Err(ControlError::Invalid(format!(
                "stop ({}) is not after start ({})",
                stop.date_string(),
                start.date_string()
            )));
        }
        Ok((start, stop))
    }

    /// Integration length.
    pub fn integration_time(&self) -> TimeDelta {
        TimeDelta::from_usec(self.integr_time.round() as i64)
    }

    /// Sub-integration length.
    pub fn sub_integration_time(&self) -> TimeDelta {
        TimeDelta::from_usec(self.sub_integr_time.unwrap().round() as i64)
    }

    /// Sub-slices per integration.
    pub fn slices_per_integration(&self) -> usize {
        self.slices_per_integration.unwrap()
    }

    /// The LO offset of a station at a given integration.
    pub fn lo_offset(&self, station: &str, integration_nr: i64) -> f64 {
        match self.lo_offset.get(station) {
            None => 0.,
            Some(LoOffset::Constant(v)) => *v,
            Some(LoOffset::Sweep([start, end, steps])) => {
                let nstep = *steps as i64;
                start + (integration_nr.rem_euclid(nstep)) as f64 * (end - start) / *steps
            }
        }
    }

    /// The extra delay of a station for a channel, in seconds. A channel-name
    /// entry wins over a polarisation entry.
    pub fn extra_delay(&self, station: &str, channel_name: &str, polarisation: char) -> f64 {
        let Some(per_station) = self.extra_delay.get(station) else {
            return 0.;
        };
        if let Some(delay) = per_station.get(channel_name) {
            return *delay;
        }
        per_station
            .get(&polarisation.to_string())
            .copied()
            .unwrap_or(0.)
    }

    /// Number of input nodes the run needs: one per station × datastream.
    pub fn number_inputs(&self) -> usize {
        self.stations
            .iter()
            .map(|s| self.data_sources[s].stream_names().len())
            .sum()
    }

    /// The (station, datastream) pair served by input node `n`, in the fixed
    /// enumeration order stations-major.
    pub fn input_assignment(&self, n: usize) -> Option<(String, String)> {
        let mut idx = 0;
        for station in &self.stations {
            for stream in self.data_sources[station].stream_names() {
                if idx == n {
                    return Some((station.clone(), stream));
                }
                idx += 1;
            }
        }
        None
    }

    /// Largest pulsar bin count over all configured pulsars, plus the
    /// off-pulse bin. At least two (one on-pulse, one off-pulse).
    pub fn max_pulsar_bins(&self) -> usize {
        self.pulsars
            .values()
            .map(|p| p.nbins + 1)
            .max()
            .unwrap_or(2)
            .max(2)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn minimal_control() -> ControlFile {
        serde_json::from_value(serde_json::json!({
            "start": "2015y181d12h00m00s",
            "stop": "2015y181d12h00m10s",
            "integr_time": 1_000_000.0,
            "number_channels": 256,
            "stations": ["Ef", "Wb"],
            "data_sources": {
                "Ef": ["file:///data/ef.m5b"],
                "Wb": ["file:///data/wb.m5b"]
            },
            "delay_directory": "file:///tmp/delays",
            "output_file": "file:///tmp/out.cor"
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults_plain() {
        let mut ctrl = minimal_control();
        ctrl.apply_defaults();
        assert_eq!(ctrl.window_function, Some(WindowFunction::Hann));
        assert_eq!(ctrl.fft_size_correlation, Some(256));
        assert_eq!(ctrl.fft_size_delaycor, Some(256));
        assert_eq!(ctrl.sub_integr_time, Some(125000.));
        assert_eq!(ctrl.slices_per_integration, Some(1));
        assert_eq!(ctrl.exit_on_empty_datastream, Some(true));
        ctrl.validate().unwrap();
    }

    #[test]
    fn test_defaults_multi_phase_center() {
        let mut ctrl = minimal_control();
        ctrl.multi_phase_center = true;
        ctrl.apply_defaults();
        assert_eq!(ctrl.window_function, Some(WindowFunction::None));
        assert_eq!(ctrl.fft_size_correlation, Some(4096));
        assert_eq!(ctrl.fft_size_delaycor, Some(256));
        assert_eq!(ctrl.sub_integr_time, Some(20480.));
    }

    #[test]
    fn test_stop_before_start_is_configuration_error() {
        let mut ctrl = minimal_control();
        ctrl.stop = "2015y181d11h00m00s".to_string();
        ctrl.apply_defaults();
        assert!(matches!(ctrl.validate(), Err(ControlError::Invalid(_))));
    }

    #[test]
    fn test_fft_sizes_validated() {
        let mut ctrl = minimal_control();
        ctrl.fft_size_delaycor = Some(300);
        ctrl.apply_defaults();
        assert!(ctrl.validate().is_err());

        let mut ctrl = minimal_control();
        ctrl.fft_size_correlation = Some(128);
        ctrl.apply_defaults();
        // 128 < number_channels (256)
        assert!(ctrl.validate().is_err());

        let mut ctrl = minimal_control();
        ctrl.fft_size_correlation = Some(256);
        ctrl.fft_size_delaycor = Some(1024);
        ctrl.apply_defaults();
        assert!(ctrl.validate().is_err());
    }

    #[test]
    fn test_pulsar_binning_needs_pulsars() {
        let mut ctrl = minimal_control();
        ctrl.pulsar_binning = true;
        ctrl.apply_defaults();
        assert!(ctrl.validate().is_err());

        ctrl.pulsars.insert(
            "B0329+54".to_string(),
            PulsarEntry {
                interval: [0., 1.],
                nbins: 16,
                polyco_file: "file:///tmp/polyco.dat".to_string(),
            },
        );
        ctrl.validate().unwrap();
        assert_eq!(ctrl.max_pulsar_bins(), 17);
    }

    #[test]
    fn test_lo_offset_sweep() {
        let mut ctrl = minimal_control();
        ctrl.lo_offset
            .insert("Ef".to_string(), LoOffset::Sweep([0., 100., 4.]));
        assert_eq!(ctrl.lo_offset("Ef", 0), 0.);
        assert_eq!(ctrl.lo_offset("Ef", 1), 25.);
        assert_eq!(ctrl.lo_offset("Ef", 5), 25.);
        assert_eq!(ctrl.lo_offset("Wb", 3), 0.);
    }

    #[test]
    fn test_extra_delay_channel_beats_polarisation() {
        let mut ctrl = minimal_control();
        let mut per_station = BTreeMap::new();
        per_station.insert("CH01".to_string(), 1e-6);
        per_station.insert("R".to_string(), 2e-6);
        ctrl.extra_delay.insert("Ef".to_string(), per_station);
        assert_eq!(ctrl.extra_delay("Ef", "CH01", 'R'), 1e-6);
        assert_eq!(ctrl.extra_delay("Ef", "CH02", 'R'), 2e-6);
        assert_eq!(ctrl.extra_delay("Ef", "CH02", 'L'), 0.);
    }

    #[test]
    fn test_input_assignment_enumeration() {
        let mut ctrl = minimal_control();
        let mut streams = BTreeMap::new();
        streams.insert("ds1".to_string(), vec!["file:///a".to_string()]);
        streams.insert("ds2".to_string(), vec!["file:///b".to_string()]);
        ctrl.data_sources
            .insert("Ef".to_string(), DataSources::Streams(streams));
        assert_eq!(ctrl.number_inputs(), 3);
        assert_eq!(ctrl.input_assignment(0), Some(("Ef".to_string(), "ds1".to_string())));
        assert_eq!(ctrl.input_assignment(1), Some(("Ef".to_string(), "ds2".to_string())));
        assert_eq!(ctrl.input_assignment(2), Some(("Wb".to_string(), String::new())));
        assert_eq!(ctrl.input_assignment(3), None);
    }
}
