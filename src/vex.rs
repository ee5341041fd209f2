//! Observation metadata.
//!
//! The VEX parser itself is an external collaborator; this module consumes a
//! pre-parsed JSON rendering of the VEX tree and answers the queries the
//! correlator needs: which scans exist, which stations and channels
//! participate in a scan, how a station's recording is formatted, and what
//! its clock model is.
//!
//! Two vocabulary versions are in the wild. Under version ≥ 2.0 the data
//! format follows from which block a mode references (DATASTREAMS → VDIF,
//! BITSTREAMS → Mark5B, TRACKS → whatever `track_frame_format` says), and
//! the sample rate lives in that block. Under version ≤ 1.5 the format is
//! inferred from the DAS rack/recorder combination and the sample rate lives
//! in the $FREQ block.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time::{Time, TimeDelta};

/// Errors raised while interrogating the observation metadata
#[derive(Error, Debug)]
pub enum VexError {
    /// The document could not be read or parsed
    #[error("could not parse vex file: {0}")]
    Parse(#[from] serde_json::Error),

    /// A cross-reference points at a section entry that does not exist
    #[error("cannot find ${section} reference {name}")]
    DanglingReference {
        /// The section being referenced
        section: &'static str,
        /// The name that was looked up
        name: String,
    },

    /// No scan covers the requested time
    #[error("cannot find scan corresponding to {0}")]
    NoScan(String),

    /// The data format of a station cannot be determined
    #[error("cannot determine data format for {station} in mode {mode}")]
    UnknownDataFormat {
        /// The station
        station: String,
        /// The mode
        mode: String,
    },

    /// No clock_early entry covers the scan
    #[error("clock doesn't cover scan {scan} for station {station}")]
    ClockNotCovered {
        /// The scan name
        scan: String,
        /// The station
        station: String,
    },

    /// A required per-station mapping is missing from a mode
    #[error("mode {mode} has no ${section} mapping for station {station}")]
    MissingMapping {
        /// The mode name
        mode: String,
        /// The section
        section: &'static str,
        /// The station
        station: String,
    },
}

/// The recording format of one station datastream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFormat {
    Mark4,
    Vlba,
    Mark5b,
    Vdif,
}

/// Upper or lower sideband.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sideband {
    #[serde(rename = "L")]
    Lower,
    #[serde(rename = "U")]
    Upper,
}

/// One entry of a station's piecewise-linear clock model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockEarly {
    /// Validity start, VEX date string
    pub valid_from: String,
    /// Clock offset in seconds at the rate epoch
    pub clock_early_sec: f64,
    /// Rate epoch, VEX date string; required when a rate is given
    #[serde(default)]
    pub epoch: Option<String>,
    /// Clock rate; the unit handling is historical, see [`ClockRate`]
    #[serde(default)]
    pub rate: Option<ClockRate>,
}

/// A clock rate as it appears in the document: either a dimensioned string
/// ("1.2e-13 sec/sec") or a bare number. Bare numbers would sensibly be
/// dimensionless, but historical practice forces the µs/s reading; the run
/// context can switch that off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClockRate {
    WithUnits(String),
    Unitless(f64),
}

impl ClockRate {
    /// The rate in s/s.
    pub fn sec_per_sec(&self, unitless_is_usec_per_sec: bool) -> f64 {
        match self {
            ClockRate::WithUnits(s) => s
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.),
            ClockRate::Unitless(v) => {
                if unitless_is_usec_per_sec {
                    v * 1e-6
                } else {
                    *v
                }
            }
        }
    }
}

/// A resolved clock model for one station over one scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockModel {
    /// Offset in seconds
    pub offset_sec: f64,
    /// Rate in s/s
    pub rate: f64,
    /// Epoch the rate is referenced to
    pub epoch: Time,
}

/// A station's participation in a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanStation {
    /// Station name
    pub station: String,
    /// Seconds after scan start at which this station is on source
    #[serde(default)]
    pub data_start_sec: f64,
    /// Seconds after scan start at which this station stops recording
    pub data_stop_sec: f64,
}

/// One scheduled scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scan {
    /// Scan start, VEX date string
    pub start: String,
    /// Mode reference
    pub mode: String,
    /// Sources observed (more than one in multi-phase-centre experiments)
    pub sources: Vec<String>,
    /// Participating stations
    pub stations: Vec<ScanStation>,
}

/// Per-station section references of one mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mode {
    /// station → $FREQ def
    pub freq: BTreeMap<String, String>,
    /// station → $BBC def
    #[serde(default)]
    pub bbc: BTreeMap<String, String>,
    /// station → $IF def
    #[serde(default, rename = "if")]
    pub if_: BTreeMap<String, String>,
    /// station → $TRACKS def
    #[serde(default)]
    pub tracks: BTreeMap<String, String>,
    /// station → $BITSTREAMS def
    #[serde(default)]
    pub bitstreams: BTreeMap<String, String>,
    /// station → $DATASTREAMS def
    #[serde(default)]
    pub datastreams: BTreeMap<String, String>,
}

/// One channel of a $FREQ def.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreqChannel {
    /// Channel name, e.g. "CH01"
    pub name: String,
    /// Sky frequency at the band edge, Hz
    pub sky_freq_hz: f64,
    /// Bandwidth, Hz
    pub bandwidth_hz: f64,
    /// Net sideband
    pub sideband: Sideband,
    /// BBC reference, resolved through $BBC → $IF for the polarisation
    pub bbc: String,
}

/// A $FREQ def.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreqDef {
    /// Channels in definition order
    pub channels: Vec<FreqChannel>,
    /// Sample rate in samples/s; authoritative only under vocabulary ≤ 1.5
    #[serde(default)]
    pub sample_rate: Option<f64>,
}

/// A $BBC def: bbc name → if name.
pub type BbcDef = BTreeMap<String, String>;

/// A $IF def: if name → polarisation.
pub type IfDef = BTreeMap<String, char>;

/// One fanout line of a $TRACKS def: the track bit positions carrying one
/// channel's sign (and optionally magnitude) bits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutDef {
    /// Channel name
    pub channel: String,
    /// Sign-bit track positions
    pub sign_tracks: Vec<u32>,
    /// Magnitude-bit track positions (empty for 1-bit data)
    #[serde(default)]
    pub magnitude_tracks: Vec<u32>,
}

/// A $TRACKS def.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracksDef {
    /// "Mark4", "VLBA" or "Mark5B"; decides the format under vocabulary ≥ 2.0
    #[serde(default)]
    pub track_frame_format: Option<String>,
    /// Sample rate in samples/s
    #[serde(default)]
    pub sample_rate: Option<f64>,
    /// Bits per sample
    #[serde(default)]
    pub bits_per_sample: Option<u8>,
    /// Fanout definitions, one per channel
    pub fanout: Vec<FanoutDef>,
}

/// One stream of a $BITSTREAMS def.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitstreamDef {
    /// Channel name
    pub channel: String,
    /// Bit position of the sign stream within the 32-bit word
    pub sign_bit: u32,
    /// Bit position of the magnitude stream, if 2-bit
    #[serde(default)]
    pub magnitude_bit: Option<u32>,
}

/// A $BITSTREAMS def (Mark5B recordings).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitstreamsDef {
    /// Streams in definition order
    pub streams: Vec<BitstreamDef>,
    /// Sample rate in samples/s
    #[serde(default)]
    pub sample_rate: Option<f64>,
}

/// Channel assignment within one VDIF thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VdifChannelAssign {
    /// Channel name
    pub channel: String,
    /// Index of the channel within the thread's frames
    pub channel_index: u32,
}

/// One thread of a $DATASTREAMS def.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VdifThreadDef {
    /// VDIF thread id
    pub thread_id: u32,
    /// Datastream name the thread belongs to
    #[serde(default)]
    pub datastream: String,
    /// Channels carried by the thread
    pub channels: Vec<VdifChannelAssign>,
    /// Sample rate in samples/s
    pub sample_rate: f64,
    /// Bits per sample
    pub bits_per_sample: u8,
}

/// A $DATASTREAMS def (VDIF recordings).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatastreamsDef {
    /// Threads in definition order
    pub threads: Vec<VdifThreadDef>,
}

/// A $DAS def, used for format inference under vocabulary ≤ 1.5.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DasDef {
    /// Recorder type, e.g. "Mark5A"
    #[serde(default)]
    pub record_transport_type: String,
    /// Rack type, e.g. "VLBA4"
    #[serde(default)]
    pub electronics_rack_type: String,
}

/// Per-station definitions: which $CLOCK and $DAS defs apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationDef {
    /// $CLOCK reference
    pub clock: String,
    /// $DAS reference
    #[serde(default)]
    pub das: Option<String>,
}

/// The experiment block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exper {
    /// Experiment name, carried into the output header
    pub name: String,
    /// Nominal experiment start, VEX date string
    pub start: String,
}

/// The pre-parsed observation metadata document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vex {
    /// Vocabulary version; 1.5 and 2.0 differ in where things live
    pub version: f64,
    /// $EXPER
    pub exper: Exper,
    /// $SCHED, keyed by scan name, in schedule order (BTreeMap: scan names
    /// sort chronologically by convention, NoXXXX)
    pub sched: BTreeMap<String, Scan>,
    /// $MODE
    pub modes: BTreeMap<String, Mode>,
    /// $STATION
    pub stations: BTreeMap<String, StationDef>,
    /// $FREQ
    pub freq: BTreeMap<String, FreqDef>,
    /// $BBC
    #[serde(default)]
    pub bbcs: BTreeMap<String, BbcDef>,
    /// $IF
    #[serde(default)]
    pub ifs: BTreeMap<String, IfDef>,
    /// $TRACKS
    #[serde(default)]
    pub tracks: BTreeMap<String, TracksDef>,
    /// $BITSTREAMS
    #[serde(default)]
    pub bitstreams: BTreeMap<String, BitstreamsDef>,
    /// $DATASTREAMS
    #[serde(default)]
    pub datastreams: BTreeMap<String, DatastreamsDef>,
    /// $CLOCK
    pub clocks: BTreeMap<String, Vec<ClockEarly>>,
    /// $DAS
    #[serde(default)]
    pub das: BTreeMap<String, DasDef>,
}

/// One channel as the correlator sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMeta {
    /// Channel name
    pub name: String,
    /// Sky frequency at the band edge, Hz
    pub sky_freq_hz: f64,
    /// Bandwidth, Hz
    pub bandwidth_hz: f64,
    /// Net sideband
    pub sideband: Sideband,
    /// Polarisation, 'R'/'L' (or 'X'/'Y')
    pub polarisation: char,
}

impl Vex {
    /// Parse the JSON rendering of a VEX document.
    pub fn from_json(json: &str) -> Result<Self, VexError> {
        Ok(serde_json::from_str(json)?)
    }

    fn scan(&self, name: &str) -> Result<&Scan, VexError> {
        self.sched.get(name).ok_or_else(|| VexError::DanglingReference {
            section: "SCHED",
            name: name.to_string(),
        })
    }

    /// Scan names in schedule order.
    pub fn scan_names(&self) -> Vec<&str> {
        self.sched.keys().map(String::as_str).collect()
    }

    /// The scan whose span contains `t`, or the first scan starting after it.
    pub fn scan_containing(&self, t: Time) -> Result<&str, VexError> {
        for (name, _) in self.sched.iter() {
            let stop = self.scan_stop(name)?;
            if t < stop {
                return Ok(name);
            }
        }
        Err(VexError::NoScan(t.date_string()))
    }

    /// Scan start time.
    pub fn scan_start(&self, name: &str) -> Result<Time, VexError> {
        let scan = self.scan(name)?;
        Time::parse_vex(&scan.start).ok_or_else(|| VexError::NoScan(scan.start.clone()))
    }

    /// Scan stop time: the latest per-station data stop.
    pub fn scan_stop(&self, name: &str) -> Result<Time, VexError> {
        let scan = self.scan(name)?;
        let start = self.scan_start(name)?;
        let longest = scan
            .stations
            .iter()
            .map(|s| s.data_stop_sec)
            .fold(0.0, f64::max);
        Ok(start + TimeDelta::from_seconds(longest))
    }

    /// The mode a scan uses.
    pub fn scan_mode(&self, name: &str) -> Result<&str, VexError> {
        Ok(&self.scan(name)?.mode)
    }

    /// The sources of a scan.
    pub fn scan_sources(&self, name: &str) -> Result<&[String], VexError> {
        Ok(&self.scan(name)?.sources)
    }

    /// Whether a station participates in a scan.
    pub fn station_in_scan(&self, scan: &str, station: &str) -> bool {
        self.scan(scan)
            .map(|s| s.stations.iter().any(|st| st.station == station))
            .unwrap_or(false)
    }

    /// A station's recording stop time within a scan.
    pub fn station_stop_time(&self, scan: &str, station: &str) -> Result<Time, VexError> {
        let s = self.scan(scan)?;
        let start = self.scan_start(scan)?;
        let st = s
            .stations
            .iter()
            .find(|st| st.station == station)
            .ok_or_else(|| VexError::DanglingReference {
                section: "SCHED",
                name: station.to_string(),
            })?;
        Ok(start + TimeDelta::from_seconds(st.data_stop_sec))
    }

    /// Sources over all scans intersecting [start, stop), in first-seen order.
    pub fn sources_in_window(&self, start: Time, stop: Time) -> Result<Vec<String>, VexError> {
        let mut sources: Vec<String> = Vec::new();
        for name in self.sched.keys() {
            let scan_start = self.scan_start(name)?;
            let scan_stop = self.scan_stop(name)?;
            if scan_stop <= start || scan_start >= stop {
                continue;
            }
            for source in self.scan_sources(name)? {
                if !sources.contains(source) {
                    sources.push(source.clone());
                }
            }
        }
        Ok(sources)
    }

    /// Experiment span: first scan start to last scan stop.
    pub fn experiment_window(&self) -> Result<(Time, Time), VexError> {
        let first = self.sched.keys().next().ok_or_else(|| {
            VexError::NoScan("empty schedule".to_string())
        })?;
        let last = self.sched.keys().next_back().unwrap();
        Ok((self.scan_start(first)?, self.scan_stop(last)?))
    }

    fn mode(&self, name: &str) -> Result<&Mode, VexError> {
        self.modes.get(name).ok_or_else(|| VexError::DanglingReference {
            section: "MODE",
            name: name.to_string(),
        })
    }

    /// The data format of a station under a mode.
    ///
    /// Vocabulary ≥ 2.0: decided by which block the mode references.
    /// Vocabulary ≤ 1.5: the DAS rack/recorder heuristic of the original.
    pub fn data_format(&self, mode_name: &str, station: &str) -> Result<DataFormat, VexError> {
        let mode = self.mode(mode_name)?;
        let unknown = || VexError::UnknownDataFormat {
            station: station.to_string(),
            mode: mode_name.to_string(),
        };
        if self.version > 1.5 {
            if mode.datastreams.contains_key(station) {
                return Ok(DataFormat::Vdif);
            }
            if mode.bitstreams.contains_key(station) {
                return Ok(DataFormat::Mark5b);
            }
            if let Some(tracks_name) = mode.tracks.get(station) {
                let tracks =
                    self.tracks
                        .get(tracks_name)
                        .ok_or_else(|| VexError::DanglingReference {
                            section: "TRACKS",
                            name: tracks_name.clone(),
                        })?;
                return match tracks.track_frame_format.as_deref() {
                    Some("Mark4") => Ok(DataFormat::Mark4),
                    Some("VLBA") => Ok(DataFormat::Vlba),
                    Some("Mark5B") => Ok(DataFormat::Mark5b),
                    _ => Err(unknown()),
                };
            }
            return Err(unknown());
        }

        let das_name = self
            .stations
            .get(station)
            .and_then(|s| s.das.clone())
            .ok_or_else(unknown)?;
        let das = self.das.get(&das_name).ok_or_else(unknown)?;
        let recorder = das.record_transport_type.as_str();
        let rack = das.electronics_rack_type.as_str();
        match recorder {
            "Mark5A" => {
                if rack == "VLBA4" {
                    Ok(DataFormat::Mark4)
                } else if rack == "VLBA" {
                    Ok(DataFormat::Vlba)
                } else if rack == "Mark4" {
                    Ok(DataFormat::Mark4)
                } else {
                    Err(unknown())
                }
            }
            "Mark5B" => {
                if matches!(rack, "DVP" | "RDBE2" | "WIDAR") {
                    Ok(DataFormat::Vdif)
                } else {
                    Ok(DataFormat::Mark5b)
                }
            }
            "Mark5C" => {
                if matches!(rack, "DBBC" | "DVP" | "RDBE2" | "WIDAR") {
                    Ok(DataFormat::Vdif)
                } else {
                    Err(unknown())
                }
            }
            "Mark6" => Ok(DataFormat::Vdif),
            "None" => {
                if rack == "DBBC" {
                    Ok(DataFormat::Vdif)
                } else {
                    Err(unknown())
                }
            }
            _ => Err(unknown()),
        }
    }

    /// The sample rate of a station under a mode, in samples/s.
    pub fn sample_rate(&self, mode_name: &str, station: &str) -> Result<f64, VexError> {
        let mode = self.mode(mode_name)?;
        // The rate in the $TRACKS, $BITSTREAMS or $DATASTREAMS block wins;
        // mandatory there for vocabulary ≥ 2.0.
        if let Some(name) = mode.datastreams.get(station) {
            if let Some(def) = self.datastreams.get(name) {
                if let Some(thread) = def.threads.first() {
                    return Ok(thread.sample_rate);
                }
            }
        }
        if let Some(name) = mode.bitstreams.get(station) {
            if let Some(rate) = self.bitstreams.get(name).and_then(|d| d.sample_rate) {
                return Ok(rate);
            }
        }
        if let Some(name) = mode.tracks.get(station) {
            if let Some(rate) = self.tracks.get(name).and_then(|d| d.sample_rate) {
                return Ok(rate);
            }
        }
        let freq_name = mode.freq.get(station).ok_or(VexError::MissingMapping {
            mode: mode_name.to_string(),
            section: "FREQ",
            station: station.to_string(),
        })?;
        self.freq
            .get(freq_name)
            .and_then(|f| f.sample_rate)
            .ok_or(VexError::MissingMapping {
                mode: mode_name.to_string(),
                section: "FREQ",
                station: station.to_string(),
            })
    }

    /// Bits per sample of a station under a mode.
    pub fn bits_per_sample(&self, mode_name: &str, station: &str) -> Result<u8, VexError> {
        let mode = self.mode(mode_name)?;
        if let Some(name) = mode.datastreams.get(station) {
            if let Some(thread) = self.datastreams.get(name).and_then(|d| d.threads.first()) {
                return Ok(thread.bits_per_sample);
            }
        }
        if let Some(name) = mode.bitstreams.get(station) {
            if let Some(def) = self.bitstreams.get(name) {
                let two_bit = def.streams.iter().any(|s| s.magnitude_bit.is_some());
                return Ok(if two_bit { 2 } else { 1 });
            }
        }
        if let Some(name) = mode.tracks.get(station) {
            if let Some(def) = self.tracks.get(name) {
                if let Some(bits) = def.bits_per_sample {
                    return Ok(bits);
                }
                let two_bit = def.fanout.iter().any(|f| !f.magnitude_tracks.is_empty());
                return Ok(if two_bit { 2 } else { 1 });
            }
        }
        Err(VexError::MissingMapping {
            mode: mode_name.to_string(),
            section: "TRACKS",
            station: station.to_string(),
        })
    }

    /// The channels a station records under a mode, with polarisation
    /// resolved through $BBC → $IF.
    pub fn channels(&self, mode_name: &str, station: &str) -> Result<Vec<ChannelMeta>, VexError> {
        let mode = self.mode(mode_name)?;
        let freq_name = mode.freq.get(station).ok_or(VexError::MissingMapping {
            mode: mode_name.to_string(),
            section: "FREQ",
            station: station.to_string(),
        })?;
        let freq = self
            .freq
            .get(freq_name)
            .ok_or_else(|| VexError::DanglingReference {
                section: "FREQ",
                name: freq_name.clone(),
            })?;
        let bbc_map = mode.bbc.get(station).and_then(|n| self.bbcs.get(n));
        let if_map = mode.if_.get(station).and_then(|n| self.ifs.get(n));
        freq.channels
            .iter()
            .map(|ch| {
                let polarisation = bbc_map
                    .and_then(|bbcs| bbcs.get(&ch.bbc))
                    .and_then(|if_name| if_map.and_then(|ifs| ifs.get(if_name)))
                    .copied()
                    .unwrap_or('R');
                Ok(ChannelMeta {
                    name: ch.name.clone(),
                    sky_freq_hz: ch.sky_freq_hz,
                    bandwidth_hz: ch.bandwidth_hz,
                    sideband: ch.sideband,
                    polarisation,
                })
            })
            .collect()
    }

    /// Whether a station channel matches a setup-station channel. Mixed
    /// recorded bandwidths (16/32/64 MHz) are allowed when either band
    /// contains the other; sky frequency, sideband and polarisation must
    /// agree exactly.
    pub fn channels_match(a: &ChannelMeta, b: &ChannelMeta) -> bool {
        if a.polarisation != b.polarisation || a.sideband != b.sideband {
            return false;
        }
        let (a0, a1) = (a.sky_freq_hz, a.sky_freq_hz + a.bandwidth_hz);
        let (b0, b1) = (b.sky_freq_hz, b.sky_freq_hz + b.bandwidth_hz);
        (a0 <= b0 && b1 <= a1) || (b0 <= a0 && a1 <= b1)
    }

    /// The name of the station channel matching setup channel `idx` of the
    /// setup station, or `None` when the station doesn't record it.
    pub fn matching_channel(
        &self,
        mode_name: &str,
        setup_station: &str,
        idx: usize,
        station: &str,
    ) -> Result<Option<String>, VexError> {
        let setup_channels = self.channels(mode_name, setup_station)?;
        let Some(wanted) = setup_channels.get(idx) else {
            return Ok(None);
        };
        let station_channels = self.channels(mode_name, station)?;
        Ok(station_channels
            .iter()
            .find(|ch| Self::channels_match(wanted, ch))
            .map(|ch| ch.name.clone()))
    }

    /// The index of the cross-polarisation partner of setup channel `idx`:
    /// the channel with the same band but opposite polarisation.
    pub fn cross_channel(
        &self,
        mode_name: &str,
        setup_station: &str,
        idx: usize,
    ) -> Result<Option<usize>, VexError> {
        let channels = self.channels(mode_name, setup_station)?;
        let Some(wanted) = channels.get(idx) else {
            return Ok(None);
        };
        Ok(channels.iter().position(|ch| {
            ch.sky_freq_hz == wanted.sky_freq_hz
                && ch.bandwidth_hz == wanted.bandwidth_hz
                && ch.sideband == wanted.sideband
                && ch.polarisation != wanted.polarisation
        }))
    }

    /// The clock model of a station at a scan start: the clock_early entry
    /// with the latest validity start not after the scan start.
    pub fn clock_early(
        &self,
        station: &str,
        scan: &str,
        scan_start: Time,
        unitless_is_usec_per_sec: bool,
    ) -> Result<ClockModel, VexError> {
        let clock_name = self
            .stations
            .get(station)
            .map(|s| s.clock.clone())
            .ok_or_else(|| VexError::DanglingReference {
                section: "STATION",
                name: station.to_string(),
            })?;
        let entries = self
            .clocks
            .get(&clock_name)
            .ok_or_else(|| VexError::DanglingReference {
                section: "CLOCK",
                name: clock_name.clone(),
            })?;
        let mut best: Option<(Time, &ClockEarly)> = None;
        for entry in entries {
            let Some(valid_from) = Time::parse_vex(&entry.valid_from) else {
                continue;
            };
            if valid_from > scan_start {
                continue;
            }
            if best.map(|(t, _)| valid_from >= t).unwrap_or(true) {
                best = Some((valid_from, entry));
            }
        }
        let (valid_from, entry) = best.ok_or_else(|| VexError::ClockNotCovered {
            scan: scan.to_string(),
            station: station.to_string(),
        })?;
        let rate = entry
            .rate
            .as_ref()
            .map(|r| r.sec_per_sec(unitless_is_usec_per_sec))
            .unwrap_or(0.);
        let epoch = entry
            .epoch
            .as_deref()
            .and_then(Time::parse_vex)
            .unwrap_or(valid_from);
        Ok(ClockModel {
            offset_sec: entry.clock_early_sec,
            rate,
            epoch,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn two_station_vex(version: f64) -> Vex {
        let json = serde_json::json!({
            "version": version,
            "exper": { "name": "N23L1", "start": "2015y181d12h00m00s" },
            "sched": {
                "No0001": {
                    "start": "2015y181d12h00m00s",
                    "mode": "sess123",
                    "sources": ["J1159+2914"],
                    "stations": [
                        { "station": "Ef", "data_stop_sec": 300.0 },
                        { "station": "Wb", "data_stop_sec": 300.0 }
                    ]
                },
                "No0002": {
                    "start": "2015y181d12h05m00s",
                    "mode": "sess123",
                    "sources": ["3C84"],
                    "stations": [
                        { "station": "Ef", "data_stop_sec": 300.0 }
                    ]
                }
            },
            "modes": {
                "sess123": {
                    "freq": { "Ef": "freqA", "Wb": "freqB" },
                    "bbc": { "Ef": "bbcA", "Wb": "bbcA" },
                    "if": { "Ef": "ifA", "Wb": "ifA" },
                    "bitstreams": { "Ef": "bsA", "Wb": "bsA" }
                }
            },
            "stations": {
                "Ef": { "clock": "Ef", "das": "dasA" },
                "Wb": { "clock": "Wb", "das": "dasA" }
            },
            "freq": {
                "freqA": {
                    "channels": [
                        { "name": "CH01", "sky_freq_hz": 1642.25e6, "bandwidth_hz": 16e6,
                          "sideband": "U", "bbc": "BBC01" },
                        { "name": "CH02", "sky_freq_hz": 1642.25e6, "bandwidth_hz": 16e6,
                          "sideband": "U", "bbc": "BBC02" }
                    ]
                },
                "freqB": {
                    "channels": [
                        { "name": "CH01", "sky_freq_hz": 1642.25e6, "bandwidth_hz": 32e6,
                          "sideband": "U", "bbc": "BBC01" }
                    ]
                }
            },
            "bbcs": { "bbcA": { "BBC01": "IF_R", "BBC02": "IF_L" } },
            "ifs": { "ifA": { "IF_R": "R", "IF_L": "L" } },
            "bitstreams": {
                "bsA": {
                    "sample_rate": 32e6,
                    "streams": [
                        { "channel": "CH01", "sign_bit": 0, "magnitude_bit": 1 },
                        { "channel": "CH02", "sign_bit": 2, "magnitude_bit": 3 }
                    ]
                }
            },
            "clocks": {
                "Ef": [
                    { "valid_from": "2015y181d00h00m00s", "clock_early_sec": 1.000001,
                      "epoch": "2015y181d00h00m00s", "rate": 0.0 }
                ],
                "Wb": [
                    { "valid_from": "2015y180d00h00m00s", "clock_early_sec": -2.5e-6 },
                    { "valid_from": "2015y181d06h00m00s", "clock_early_sec": -2.6e-6,
                      "epoch": "2015y181d06h00m00s", "rate": 0.012 }
                ]
            },
            "das": {
                "dasA": { "record_transport_type": "Mark5B", "electronics_rack_type": "VLBA" }
            }
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_data_format_v2_block_presence() {
        let vex = two_station_vex(2.0);
        assert_eq!(vex.data_format("sess123", "Ef").unwrap(), DataFormat::Mark5b);
    }

    #[test]
    fn test_data_format_v2_tracks_frame_format() {
        let mut vex = two_station_vex(2.0);
        let mode = vex.modes.get_mut("sess123").unwrap();
        mode.bitstreams.clear();
        mode.tracks.insert("Ef".to_string(), "trA".to_string());
        vex.tracks.insert(
            "trA".to_string(),
            TracksDef {
                track_frame_format: Some("Mark4".to_string()),
                sample_rate: Some(16e6),
                bits_per_sample: Some(2),
                fanout: vec![],
            },
        );
        assert_eq!(vex.data_format("sess123", "Ef").unwrap(), DataFormat::Mark4);
    }

    #[test]
    fn test_data_format_v1_das_heuristic() {
        let mut vex = two_station_vex(1.5);
        assert_eq!(vex.data_format("sess123", "Ef").unwrap(), DataFormat::Mark5b);
        vex.das.get_mut("dasA").unwrap().electronics_rack_type = "DVP".to_string();
        assert_eq!(vex.data_format("sess123", "Ef").unwrap(), DataFormat::Vdif);
        let das = vex.das.get_mut("dasA").unwrap();
        das.record_transport_type = "Mark5A".to_string();
        das.electronics_rack_type = "VLBA4".to_string();
        assert_eq!(vex.data_format("sess123", "Ef").unwrap(), DataFormat::Mark4);
        vex.das.get_mut("dasA").unwrap().electronics_rack_type = "VLBA".to_string();
        assert_eq!(vex.data_format("sess123", "Ef").unwrap(), DataFormat::Vlba);
    }

    #[test]
    fn test_channels_resolve_polarisation() {
        let vex = two_station_vex(2.0);
        let channels = vex.channels("sess123", "Ef").unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].polarisation, 'R');
        assert_eq!(channels[1].polarisation, 'L');
    }

    #[test]
    fn test_cross_channel_pairs_opposite_polarisation() {
        let vex = two_station_vex(2.0);
        assert_eq!(vex.cross_channel("sess123", "Ef", 0).unwrap(), Some(1));
        assert_eq!(vex.cross_channel("sess123", "Ef", 1).unwrap(), Some(0));
    }

    #[test]
    fn test_bandwidth_contained_in_matching() {
        let vex = two_station_vex(2.0);
        // Wb records 32 MHz containing Ef's 16 MHz band: matches.
        assert_eq!(
            vex.matching_channel("sess123", "Ef", 0, "Wb").unwrap(),
            Some("CH01".to_string())
        );
        // Opposite polarisation never matches.
        assert_eq!(vex.matching_channel("sess123", "Ef", 1, "Wb").unwrap(), None);
    }

    #[test]
    fn test_clock_early_latest_entry_wins() {
        let vex = two_station_vex(2.0);
        let scan_start = vex.scan_start("No0001").unwrap();
        let clock = vex.clock_early("Wb", "No0001", scan_start, true).unwrap();
        assert_eq!(clock.offset_sec, -2.6e-6);
        // Unit-less 0.012 read as µs/s.
        assert!((clock.rate - 1.2e-8).abs() < 1e-20);
    }

    #[test]
    fn test_clock_early_none_before_scan_is_error() {
        let mut vex = two_station_vex(2.0);
        vex.clocks.get_mut("Ef").unwrap()[0].valid_from = "2016y001d00h00m00s".to_string();
        let scan_start = vex.scan_start("No0001").unwrap();
        assert!(matches!(
            vex.clock_early("Ef", "No0001", scan_start, true),
            Err(VexError::ClockNotCovered { .. })
        ));
    }

    #[test]
    fn test_scan_lookup_by_time() {
        let vex = two_station_vex(2.0);
        let t = Time::parse_vex("2015y181d12h02m00s").unwrap();
        assert_eq!(vex.scan_containing(t).unwrap(), "No0001");
        let t = Time::parse_vex("2015y181d12h06m00s").unwrap();
        assert_eq!(vex.scan_containing(t).unwrap(), "No0002");
    }

    #[test]
    fn test_sources_in_window() {
        let vex = two_station_vex(2.0);
        let (start, stop) = vex.experiment_window().unwrap();
        assert_eq!(vex.sources_in_window(start, stop).unwrap(), vec!["J1159+2914", "3C84"]);
    }
}
