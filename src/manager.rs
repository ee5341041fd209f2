//! The manager: drives the run from start time to stop time.
//!
//! The manager owns the schedule. It partitions the correlation window into
//! a grid of (integration, sub-slice, channel) work units, dispatches each
//! unit to an idle correlator node, and simultaneously instructs every
//! participating input node to push the matching sample slice to that
//! correlator. Scan boundaries reload the delay models and the channel
//! layout. The state machine is cooperative: every transition happens
//! between messages, and the only blocking points are the waits for a ready
//! correlator or for the output node to finish.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};

use crate::context::RunContext;
use crate::corr::pulsar::parse_polyco;
use crate::delay::{ensure_delay_table, split_clock_offset, ClockOffset, DelayTable};
use crate::error::FxcorrError;
use crate::input::reader::uri_to_path;
use crate::msg::{
    ChannelParameters, CorrelationParameters, CtrlMsg, InputNodeParameters, StationStream,
};
use crate::node::{MessageResult, Node};
use crate::output::{GlobalHeader, OUTPUT_FORMAT_VERSION};
use crate::time::{Time, TimeDelta};
use crate::transport::{correlator_rank, input_rank, ControlServer, Envelope, RANK_LOG, RANK_OUTPUT};
use crate::vex::{ChannelMeta, DataFormat};

/// The manager's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StartNewScan,
    StartCorrelationTimeSlice,
    StartCorrelatorNodesForTimeSlice,
    GotoNextTimeslice,
    StopCorrelating,
    WaitForOutputNode,
    EndNode,
}

/// Per-scan, per-input channel setup.
#[derive(Debug, Clone, Default)]
struct ScanSetup {
    /// Whether each input participates
    input_in_scan: Vec<bool>,
    /// `station_ch_number[channel][input]`: the input-local channel index
    station_ch_number: Vec<Vec<Option<usize>>>,
    /// Station channel metadata per (setup channel, input)
    station_channel: Vec<Vec<Option<ChannelMeta>>>,
    /// Setup-station channel metadata
    setup_channels: Vec<ChannelMeta>,
    /// Channels with at least one participating input, in index order
    channels_in_scan: Vec<usize>,
    is_channel_in_scan: Vec<bool>,
    /// Sample rate and bit depth per input
    sample_rate: Vec<u64>,
    bits_per_sample: Vec<u8>,
    /// Sources of the scan
    n_sources: usize,
}

/// The manager node.
pub struct Manager {
    ctx: Arc<RunContext>,
    server: ControlServer,
    vex_path: PathBuf,
    n_inputs: usize,
    n_corr: usize,
    /// (station, datastream) per input node
    assignments: Vec<(String, String)>,

    state: State,
    start_time: Time,
    stop_time: Time,
    stop_time_scan: Time,
    scan_start: Time,
    current_scan: usize,
    scan_names: Vec<String>,
    integration_nr: i64,
    slice_nr: usize,
    channel_idx: usize,
    output_slice_nr: i64,
    setup: ScanSetup,
    sources: Vec<String>,

    /// Ready-queue dispatch (FIFO of idle correlators)
    ready_correlators: VecDeque<usize>,
    /// Deterministic dispatch (flags visited in rank order)
    correlator_ready: Vec<bool>,
    current_correlator: usize,

    /// Counters for blocking waits
    acks_pending: usize,
    inits_pending: usize,
    input_times: HashMap<usize, Time>,
    output_finished: bool,

    progress: ProgressBar,
}

impl Manager {
    pub fn new(ctx: Arc<RunContext>, server: ControlServer, vex_path: PathBuf) -> Result<Self, FxcorrError> {
        let n_inputs = ctx.control.number_inputs();
        if server.n_peers() < n_inputs + 3 {
            return Err(crate::control::ControlError::Invalid(format!(
                "a run needs at least {} ranks (log, output, {n_inputs} inputs, one correlator); {} are up",
                n_inputs + 4,
                server.n_peers() + 1,
            ))
            .into());
        }
        let n_corr = server.n_peers() - n_inputs - 2;
        let assignments = (0..n_inputs)
            .map(|n| ctx.control.input_assignment(n).expect("input assignment"))
            .collect();
        let (exper_start, exper_stop) = ctx.vex.experiment_window()?;
        let (start_time, stop_time) = ctx.control.window(exper_start, exper_stop)?;
        let scan_names: Vec<String> = ctx.vex.scan_names().iter().map(|s| s.to_string()).collect();
        let n_integrations =
            (stop_time - start_time).div_floor(ctx.control.integration_time()) as u64;
        let progress = ProgressBar::with_draw_target(
            Some(n_integrations * ctx.control.slices_per_integration() as u64),
            if log::log_enabled!(log::Level::Info) {
                ProgressDrawTarget::stderr()
            } else {
                ProgressDrawTarget::hidden()
            },
        );
        progress.set_style(
            ProgressStyle::with_template(
                "{msg:12}: [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len}",
            )
            .unwrap()
            .progress_chars("=> "),
        );
        progress.set_message("correlating");
        Ok(Self {
            ctx,
            server,
            vex_path,
            n_inputs,
            n_corr,
            assignments,
            state: State::StartNewScan,
            start_time,
            stop_time,
            stop_time_scan: stop_time,
            scan_start: start_time,
            current_scan: 0,
            scan_names,
            integration_nr: 0,
            slice_nr: 0,
            channel_idx: 0,
            output_slice_nr: 0,
            setup: ScanSetup::default(),
            sources: Vec::new(),
            ready_correlators: VecDeque::new(),
            correlator_ready: vec![false; n_corr],
            current_correlator: 0,
            acks_pending: 0,
            inits_pending: 0,
            input_times: HashMap::new(),
            output_finished: false,
            progress,
        })
    }

    fn integration_time(&self) -> TimeDelta {
        self.ctx.control.integration_time()
    }

    fn slices_per_integration(&self) -> usize {
        self.ctx.control.slices_per_integration()
    }

    fn integration_start(&self) -> Time {
        self.start_time + self.integration_time() * self.integration_nr
    }

    /// Block until `counter` pending acknowledgements have drained.
    fn wait_for_acks(&mut self) -> Result<(), FxcorrError> {
        while self.acks_pending > 0 {
            if self.check_and_process_message()? == MessageResult::Disconnected {
                break;
            }
        }
        Ok(())
    }

    /// Bootstrap every node, wire the data plane, and open the output.
    pub fn initialise(&mut self) -> Result<(), FxcorrError> {
        info!("starting nodes");
        self.server.send(RANK_LOG, CtrlMsg::SetLogNode { file: None })?;
        self.server.send(RANK_OUTPUT, CtrlMsg::SetOutputNode)?;
        self.inits_pending = 2 + self.n_inputs + self.n_corr;
        for (n, (station, datastream)) in self.assignments.clone().into_iter().enumerate() {
            let scan = &self.scan_names[0];
            let mode = self.ctx.vex.scan_mode(scan)?.to_string();
            let format = self.ctx.vex.data_format(&mode, &station)?;
            self.server.send(
                input_rank(n),
                CtrlMsg::SetInputNode {
                    input_nr: n,
                    station: station.clone(),
                    datastream: datastream.clone(),
                    format,
                },
            )?;
        }
        for c in 0..self.n_corr {
            self.server.send(
                correlator_rank(c, self.n_inputs),
                CtrlMsg::SetCorrelatorNode {
                    corr_nr: c,
                    n_inputs: self.n_inputs,
                },
            )?;
        }
        while self.inits_pending > 0 {
            if self.check_and_process_message()? == MessageResult::Disconnected {
                break;
            }
        }
        for level_rank in 1..self.server.n_peers() as u16 + 1 {
            self.server
                .send(level_rank, CtrlMsg::SetMessageLevel(self.ctx.control.message_level))?;
        }

        // Hand every input node its recording.
        for (n, (station, datastream)) in self.assignments.clone().into_iter().enumerate() {
            let sources = self.ctx.control.data_sources[&station]
                .sources(&datastream)
                .to_vec();
            self.server
                .send(input_rank(n), CtrlMsg::AddDataReaderFile { sources })?;
        }

        // Wire the data plane: every input to every correlator (twice when
        // cross-polarising), every correlator to the output node. The
        // writer side dials; each established edge is acknowledged before
        // work is dispatched.
        let cross = self.ctx.control.cross_polarize;
        for c in 0..self.n_corr {
            let corr_rank = correlator_rank(c, self.n_inputs);
            let corr_endpoint = self
                .server
                .data_endpoint(corr_rank)
                .expect("correlator data endpoint")
                .clone();
            for i in 0..self.n_inputs {
                self.server.send(
                    input_rank(i),
                    CtrlMsg::ConnectTo {
                        stream_nr: c,
                        endpoint: corr_endpoint.clone(),
                        peer_rank: corr_rank,
                        peer_stream: i,
                    },
                )?;
                self.acks_pending += 1;
                if cross {
                    self.server.send(
                        input_rank(i),
                        CtrlMsg::ConnectTo {
                            stream_nr: c + self.n_corr,
                            endpoint: corr_endpoint.clone(),
                            peer_rank: corr_rank,
                            peer_stream: i + self.n_inputs,
                        },
                    )?;
                    self.acks_pending += 1;
                }
            }
            let output_endpoint = self
                .server
                .data_endpoint(RANK_OUTPUT)
                .expect("output data endpoint")
                .clone();
            self.server.send(
                corr_rank,
                CtrlMsg::ConnectTo {
                    stream_nr: 0,
                    endpoint: output_endpoint,
                    peer_rank: RANK_OUTPUT,
                    peer_stream: c,
                },
            )?;
            self.acks_pending += 1;
        }
        self.wait_for_acks()?;
        info!("all connections are established");

        // The source list of the run, in first-seen order; it fixes the
        // output-stream numbering of multi-phase-centre runs.
        self.sources = self.ctx.vex.sources_in_window(self.start_time, self.stop_time)?;
        for c in 0..self.n_corr {
            self.server.send(
                correlator_rank(c, self.n_inputs),
                CtrlMsg::SetSources(self.sources.clone()),
            )?;
        }

        // Output files: one per pulsar bin, per source, or just the one.
        let base = self.ctx.control.output_file.clone();
        if self.ctx.control.pulsar_binning {
            for bin in 0..self.ctx.control.max_pulsar_bins() {
                self.server.send(
                    RANK_OUTPUT,
                    CtrlMsg::AddDataWriterFile {
                        stream_nr: bin,
                        path: format!("{base}.bin{bin}"),
                    },
                )?;
                self.acks_pending += 1;
            }
        } else if self.ctx.control.multi_phase_center {
            for (nr, source) in self.sources.clone().into_iter().enumerate() {
                self.server.send(
                    RANK_OUTPUT,
                    CtrlMsg::AddDataWriterFile {
                        stream_nr: nr,
                        path: format!("{base}_{source}"),
                    },
                )?;
                self.acks_pending += 1;
            }
        } else {
            self.server.send(
                RANK_OUTPUT,
                CtrlMsg::AddDataWriterFile {
                    stream_nr: 0,
                    path: base,
                },
            )?;
            self.acks_pending += 1;
        }
        self.wait_for_acks()?;

        // Pulsar binning setup.
        if self.ctx.control.pulsar_binning {
            for (name, entry) in self.ctx.control.pulsars.clone() {
                let polyco = parse_polyco(
                    &uri_to_path(&entry.polyco_file),
                    &name,
                    entry.interval,
                    entry.nbins,
                )
                .map_err(FxcorrError::IO)?;
                for c in 0..self.n_corr {
                    self.server.send(
                        correlator_rank(c, self.n_inputs),
                        CtrlMsg::SetPulsarParameters(polyco.clone()),
                    )?;
                }
            }
        }

        // Station calibration, when configured.
        if let Some(cal_file) = self.ctx.control.cal_file.clone() {
            for c in 0..self.n_corr {
                self.server.send(
                    correlator_rank(c, self.n_inputs),
                    CtrlMsg::SetCalTable {
                        path: cal_file.clone(),
                    },
                )?;
            }
        }

        self.send_global_header()?;

        // Find the first scan.
        self.current_scan = self
            .scan_names
            .iter()
            .position(|name| {
                self.ctx
                    .vex
                    .scan_stop(name)
                    .map(|stop| self.start_time < stop)
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                crate::vex::VexError::NoScan(self.start_time.date_string())
            })?;

        self.output_slice_nr = 0;
        info!("start_time: {}", self.start_time.date_string());
        info!("stop_time: {}", self.stop_time.date_string());
        Ok(())
    }

    fn send_global_header(&mut self) -> Result<(), FxcorrError> {
        let (start_year, start_day) = self.start_time.year_day();
        let polarisation_type = if self.ctx.control.cross_polarize {
            2
        } else {
            let scan = &self.scan_names[0];
            let mode = self.ctx.vex.scan_mode(scan)?.to_string();
            let setup = self.setup_station();
            let pols: std::collections::BTreeSet<char> = self
                .ctx
                .vex
                .channels(&mode, &setup)?
                .iter()
                .map(|ch| ch.polarisation)
                .collect();
            (pols.len() > 1) as u8
        };
        let version: u32 = env!("CARGO_PKG_VERSION")
            .split('.')
            .filter_map(|part| part.parse::<u32>().ok())
            .fold(0, |acc, part| acc * 100 + part);
        let header = GlobalHeader {
            experiment: self.ctx.vex.exper.name.clone(),
            start_year,
            start_day: start_day as i32,
            start_seconds: self.start_time.seconds_of_day() as i32,
            number_channels: self.ctx.control.number_channels as u32,
            integration_time_usec: self.integration_time().as_usec(),
            polarisation_type,
            output_format_version: OUTPUT_FORMAT_VERSION,
            correlator_version: version,
            job_nr: self.ctx.control.job,
            subjob_nr: self.ctx.control.subjob,
            stations: self.ctx.vex.stations.keys().cloned().collect(),
            sources: self.sources.clone(),
        };
        self.server
            .send(RANK_OUTPUT, CtrlMsg::OutputGlobalHeader(header.encode()))?;
        Ok(())
    }

    fn setup_station(&self) -> String {
        self.ctx
            .control
            .setup_station
            .clone()
            .or_else(|| self.ctx.control.reference_station.clone())
            .unwrap_or_else(|| self.ctx.control.stations[0].clone())
    }

    /// Track/bitstream/thread selection for one channel of one station.
    fn channel_parameters(
        &self,
        mode: &str,
        station: &str,
        channel_name: &str,
    ) -> Result<ChannelParameters, FxcorrError> {
        let vex = &self.ctx.vex;
        let missing = || {
            crate::vex::VexError::DanglingReference {
                section: "TRACKS",
                name: channel_name.to_string(),
            }
        };
        let mode_def = vex.modes.get(mode).ok_or_else(|| {
            crate::vex::VexError::DanglingReference {
                section: "MODE",
                name: mode.to_string(),
            }
        })?;
        match vex.data_format(mode, station)? {
            DataFormat::Mark4 | DataFormat::Vlba => {
                let tracks_name = mode_def.tracks.get(station).ok_or_else(missing)?;
                let tracks = vex.tracks.get(tracks_name).ok_or_else(missing)?;
                let fanout = tracks
                    .fanout
                    .iter()
                    .find(|f| f.channel == channel_name)
                    .ok_or_else(missing)?;
                Ok(ChannelParameters {
                    channel_name: channel_name.to_string(),
                    sign_tracks: fanout.sign_tracks.clone(),
                    magnitude_tracks: fanout.magnitude_tracks.clone(),
                })
            }
            DataFormat::Mark5b => {
                let bs_name = mode_def.bitstreams.get(station).ok_or_else(missing)?;
                let bitstreams = vex.bitstreams.get(bs_name).ok_or_else(missing)?;
                let stream = bitstreams
                    .streams
                    .iter()
                    .find(|s| s.channel == channel_name)
                    .ok_or_else(missing)?;
                Ok(ChannelParameters {
                    channel_name: channel_name.to_string(),
                    sign_tracks: vec![stream.sign_bit],
                    magnitude_tracks: stream.magnitude_bit.into_iter().collect(),
                })
            }
            DataFormat::Vdif => {
                let ds_name = mode_def.datastreams.get(station).ok_or_else(missing)?;
                let datastreams = vex.datastreams.get(ds_name).ok_or_else(missing)?;
                for thread in &datastreams.threads {
                    if let Some(assign) =
                        thread.channels.iter().find(|a| a.channel == channel_name)
                    {
                        return Ok(ChannelParameters {
                            channel_name: channel_name.to_string(),
                            sign_tracks: vec![thread.thread_id, assign.channel_index],
                            magnitude_tracks: vec![],
                        });
                    }
                }
                Err(missing().into())
            }
        }
    }

    /// Load the scan: delay models, channel layout, input parameters.
    fn initialise_scan(&mut self) -> Result<(), FxcorrError> {
        let scan = self.scan_names[self.current_scan].clone();
        let vex = &self.ctx.vex;
        self.scan_start = vex.scan_start(&scan)?;

        // Move the integration counter up to the scan start.
        if self.integration_start() < self.scan_start {
            let interval = self.scan_start - self.start_time;
            self.integration_nr = interval.div_floor(self.integration_time());
            if !(interval % self.integration_time()).is_zero() {
                self.integration_nr += 1;
            }
            self.slice_nr = 0;
        }

        // Clip the scan stop to the run stop and align it to the
        // integration grid.
        let mut stop_scan = vex.scan_stop(&scan)?.min(self.stop_time);
        stop_scan = stop_scan - (stop_scan - self.start_time) % self.integration_time();
        self.stop_time_scan = stop_scan;

        let mode = vex.scan_mode(&scan)?.to_string();
        let setup_station = self.setup_station();
        let setup_channels = vex.channels(&mode, &setup_station)?;
        let n_channels = setup_channels.len();

        let mut setup = ScanSetup {
            input_in_scan: vec![false; self.n_inputs],
            station_ch_number: vec![vec![None; self.n_inputs]; n_channels],
            station_channel: vec![vec![None; self.n_inputs]; n_channels],
            setup_channels,
            channels_in_scan: Vec::new(),
            is_channel_in_scan: vec![false; n_channels],
            sample_rate: vec![0; self.n_inputs],
            bits_per_sample: vec![0; self.n_inputs],
            n_sources: vex.scan_sources(&scan)?.len(),
        };

        // Which channels does each input carry, and under what local index?
        let mut input_channels: Vec<Vec<ChannelParameters>> = vec![Vec::new(); self.n_inputs];
        for (n, (station, _datastream)) in self.assignments.iter().enumerate() {
            if !vex.station_in_scan(&scan, station) {
                continue;
            }
            setup.sample_rate[n] = vex.sample_rate(&mode, station)? as u64;
            setup.bits_per_sample[n] = vex.bits_per_sample(&mode, station)?;
            let station_channels = vex.channels(&mode, station)?;
            for ch in 0..n_channels {
                let wanted = &setup.setup_channels[ch];
                let matched = station_channels
                    .iter()
                    .find(|c| crate::vex::Vex::channels_match(wanted, c));
                if let Some(matched) = matched {
                    setup.input_in_scan[n] = true;
                    setup.station_ch_number[ch][n] = Some(input_channels[n].len());
                    setup.station_channel[ch][n] = Some(matched.clone());
                    input_channels[n].push(self.channel_parameters(&mode, station, &matched.name)?);
                }
            }
        }
        for ch in 0..n_channels {
            if setup.station_ch_number[ch].iter().any(Option::is_some) {
                setup.channels_in_scan.push(ch);
                setup.is_channel_in_scan[ch] = true;
            }
        }

        // Delay models: generate when missing, compose the clock, split
        // large offsets into a whole-second reader offset.
        let delay_dir = uri_to_path(&self.ctx.control.delay_directory);
        for (n, (station, _)) in self.assignments.clone().into_iter().enumerate() {
            if !setup.input_in_scan[n] {
                continue;
            }
            let table_path = ensure_delay_table(&delay_dir, &station, &self.vex_path)?;
            let mut table = DelayTable::open(&table_path, self.scan_start, self.stop_time_scan)?;
            let clock = self.ctx.vex.clock_early(
                &station,
                &scan,
                self.scan_start,
                self.ctx.clock_rate_unitless_usec_per_sec,
            )?;
            let (reader_offset, residual) = split_clock_offset(clock.offset_sec);
            table.set_clock_offset(ClockOffset {
                offset: residual,
                rate: clock.rate,
                epoch: clock.epoch,
            });
            debug!(
                "station {station}: clock offset {} s (reader offset {}), rate {} s/s",
                clock.offset_sec, reader_offset, clock.rate
            );

            self.server.send(
                input_rank(n),
                CtrlMsg::InputNodeSetParameters(InputNodeParameters {
                    frame_format: self.ctx.vex.data_format(&mode, &station)?,
                    channels: input_channels[n].clone(),
                    sample_rate: setup.sample_rate[n],
                    bits_per_sample: setup.bits_per_sample[n],
                    reader_offset,
                    ref_time: self.scan_start,
                    randomise_headers: true,
                }),
            )?;
            self.server.send(
                input_rank(n),
                CtrlMsg::SetDelayTable {
                    input_nr: n,
                    source_nr: 0,
                    table: table.clone(),
                },
            )?;

            // Every correlator gets the tables too, one per phase centre.
            let n_centres = if self.ctx.control.multi_phase_center {
                setup.n_sources
            } else {
                1
            };
            for source_nr in 0..n_centres {
                let per_source = if source_nr == 0 {
                    table.clone()
                } else {
                    // A per-source table when the generator produced one;
                    // the reference table otherwise.
                    let source = &self.ctx.vex.scan_sources(&scan)?[source_nr];
                    let path = delay_dir.join(format!("{station}_{source}.del"));
                    if path.exists() {
                        let mut t =
                            DelayTable::open(&path, self.scan_start, self.stop_time_scan)?;
                        t.set_clock_offset(table.clock_offset());
                        t
                    } else {
                        table.clone()
                    }
                };
                for c in 0..self.n_corr {
                    self.server.send(
                        correlator_rank(c, self.n_inputs),
                        CtrlMsg::SetDelayTable {
                            input_nr: n,
                            source_nr,
                            table: per_source.clone(),
                        },
                    )?;
                }
            }
        }

        self.setup = setup;
        Ok(())
    }

    /// Dispatch the next (slice, channel) unit to a correlator.
    fn start_next_timeslice_on_node(&mut self, corr_nr: usize) -> Result<(), FxcorrError> {
        let scan = self.scan_names[self.current_scan].clone();
        let mode = self.ctx.vex.scan_mode(&scan)?.to_string();
        let setup_station = self.setup_station();
        let current_channel = self.setup.channels_in_scan[self.channel_idx];
        let cross_channel = if self.ctx.control.cross_polarize {
            match self.ctx.vex.cross_channel(&mode, &setup_station, current_channel)? {
                Some(partner)
                    if self.setup.is_channel_in_scan[partner] && partner > current_channel =>
                {
                    Some(partner)
                }
                _ => None,
            }
        } else {
            None
        };

        let integration_start = self.integration_start();
        let rate = self.setup.sample_rate[self
            .setup
            .station_ch_number[current_channel]
            .iter()
            .position(Option::is_some)
            .expect("channel has a station")];
        // The correlation runs at the setup station's rate when it
        // participates, else at the first participating station's.
        let setup_idx = self
            .assignments
            .iter()
            .position(|(s, _)| *s == setup_station)
            .filter(|&n| self.setup.input_in_scan[n]);
        let rate = setup_idx.map(|n| self.setup.sample_rate[n]).unwrap_or(rate);

        let n_c = self.ctx.control.fft_size_correlation.unwrap();
        let (slice_start, slice_time, slice_size) = slice_geometry(
            integration_start,
            self.integration_time(),
            self.slices_per_integration(),
            self.slice_nr,
            rate,
            n_c,
        );

        let meta = &self.setup.setup_channels[current_channel];
        info!(
            "start {}, slice {}, channel {}{} to correlation node {corr_nr}",
            slice_start.date_string(),
            self.slice_nr,
            current_channel,
            cross_channel
                .map(|c| format!(",{c}"))
                .unwrap_or_default(),
        );

        let build_streams = |mgr: &Self, channel: usize| -> Vec<StationStream> {
            (0..mgr.n_inputs)
                .filter_map(|n| {
                    mgr.setup.station_ch_number[channel][n]?;
                    let meta = mgr.setup.station_channel[channel][n].as_ref()?;
                    let (station, _) = &mgr.assignments[n];
                    Some(StationStream {
                        station_stream: n,
                        station_name: station.clone(),
                        sample_rate: mgr.setup.sample_rate[n],
                        bandwidth_hz: meta.bandwidth_hz,
                        sideband: meta.sideband,
                        channel_freq_hz: meta.sky_freq_hz,
                        polarisation: meta.polarisation,
                        lo_offset_hz: mgr.ctx.control.lo_offset(station, mgr.integration_nr),
                        extra_delay_sec: mgr.ctx.control.extra_delay(
                            station,
                            &meta.name,
                            meta.polarisation,
                        ),
                        bits_per_sample: mgr.setup.bits_per_sample[n],
                    })
                })
                .collect()
        };
        let station_streams = build_streams(self, current_channel);
        let cross_streams = cross_channel
            .map(|partner| build_streams(self, partner))
            .unwrap_or_default();

        let params = CorrelationParameters {
            integration_nr: self.integration_nr,
            slice_nr: self.output_slice_nr,
            sub_slice_nr: self.slice_nr,
            channel_nr: current_channel,
            cross_channel_nr: cross_channel,
            integration_start,
            slice_start,
            slice_time,
            sample_rate: rate,
            channel_freq_hz: meta.sky_freq_hz,
            bandwidth_hz: meta.bandwidth_hz,
            sideband: meta.sideband,
            slice_size,
            fft_size_delaycor: self.ctx.control.fft_size_delaycor.unwrap(),
            fft_size_correlation: n_c,
            number_channels: self.ctx.control.number_channels,
            window: self.ctx.control.window_function.unwrap(),
            source: self.ctx.vex.scan_sources(&scan)?[0].clone(),
            phase_center_sources: if self.ctx.control.multi_phase_center {
                self.ctx.vex.scan_sources(&scan)?.to_vec()
            } else {
                Vec::new()
            },
            n_phase_centers: if self.ctx.control.multi_phase_center {
                self.setup.n_sources
            } else {
                1
            },
            n_output_streams: if self.ctx.control.pulsar_binning {
                self.ctx.control.max_pulsar_bins()
            } else if self.ctx.control.multi_phase_center {
                self.sources.len()
            } else {
                1
            },
            multi_phase_center: self.ctx.control.multi_phase_center,
            pulsar_binning: self.ctx.control.pulsar_binning,
            station_streams,
            cross_streams,
        };
        self.server.send(
            correlator_rank(corr_nr, self.n_inputs),
            CtrlMsg::CorrelatorParameters(Box::new(params)),
        )?;

        // Command every participating input to push the matching slices.
        for n in 0..self.n_inputs {
            if let Some(local_channel) = self.setup.station_ch_number[current_channel][n] {
                let slice_samples =
                    slice_size as u64 * self.setup.sample_rate[n] / rate;
                self.server.send(
                    input_rank(n),
                    CtrlMsg::InputNodeAddTimeSlice {
                        channel: local_channel,
                        stream_nr: corr_nr,
                        start: slice_start,
                        stop: slice_start + slice_time,
                        slice_samples,
                    },
                )?;
            }
            if let Some(partner) = cross_channel {
                if let Some(local_channel) = self.setup.station_ch_number[partner][n] {
                    let slice_samples =
                        slice_size as u64 * self.setup.sample_rate[n] / rate;
                    self.server.send(
                        input_rank(n),
                        CtrlMsg::InputNodeAddTimeSlice {
                            channel: local_channel,
                            stream_nr: corr_nr + self.n_corr,
                            start: slice_start,
                            stop: slice_start + slice_time,
                            slice_samples,
                        },
                    )?;
                }
            }
        }

        // Advance the channel cursor, skipping partners that were already
        // correlated as the cross channel of an earlier one.
        self.channel_idx += 1;
        while self.ctx.control.cross_polarize
            && self.channel_idx < self.setup.channels_in_scan.len()
        {
            let candidate = self.setup.channels_in_scan[self.channel_idx];
            match self.ctx.vex.cross_channel(&mode, &setup_station, candidate)? {
                Some(partner) if partner < candidate && self.setup.is_channel_in_scan[partner] => {
                    self.channel_idx += 1;
                }
                _ => break,
            }
        }
        if self.ctx.deterministic {
            self.current_correlator = (self.current_correlator + 1) % self.n_corr;
        }
        self.output_slice_nr += 1;
        Ok(())
    }

    /// Run the state machine to completion.
    pub fn run(&mut self) -> Result<(), FxcorrError> {
        self.initialise()?;
        self.state = State::StartNewScan;
        while self.state != State::EndNode {
            self.process_all_waiting_messages()?;
            match self.state {
                State::StartNewScan => {
                    self.initialise_scan()?;
                    if self.setup.channels_in_scan.is_empty() {
                        // Nothing participates: skip to the end of the scan.
                        let interval = self.stop_time_scan - self.start_time;
                        self.integration_nr =
                            interval.div_floor(self.integration_time()) - 1;
                        if !(interval % self.integration_time()).is_zero() {
                            self.integration_nr += 1;
                            self.slice_nr = 0;
                        }
                        if self.ctx.control.exit_on_empty_datastream.unwrap_or(true) {
                            warn!(
                                "no station participates in scan {}",
                                self.scan_names[self.current_scan]
                            );
                        }
                        self.state = State::GotoNextTimeslice;
                        continue;
                    }

                    // Move the integration counter past the slowest input.
                    self.input_times.clear();
                    let mut expected = 0;
                    for n in 0..self.n_inputs {
                        if self.setup.input_in_scan[n] {
                            self.server
                                .send(input_rank(n), CtrlMsg::InputNodeGetCurrentTime)?;
                            expected += 1;
                        }
                    }
                    while self.input_times.len() < expected {
                        if self.check_and_process_message()? == MessageResult::Disconnected {
                            break;
                        }
                    }
                    for (&n, &station_time) in &self.input_times {
                        if station_time > self.integration_start() {
                            let interval = station_time - self.start_time;
                            self.integration_nr =
                                interval.div_floor(self.integration_time());
                            if !(interval % self.integration_time()).is_zero() {
                                self.integration_nr += 1;
                            }
                            self.slice_nr = 0;
                            debug!(
                                "input {n} starts late; first integration moved to {}",
                                self.integration_start().date_string()
                            );
                        }
                    }

                    info!("START_TIME: {}", self.integration_start().date_string());
                    if self.stop_time <= self.integration_start() {
                        self.state = State::StopCorrelating;
                        continue;
                    }

                    for n in 0..self.n_inputs {
                        if self.setup.input_in_scan[n] {
                            let scan = &self.scan_names[self.current_scan];
                            let station = &self.assignments[n].0;
                            let station_stop =
                                self.ctx.vex.station_stop_time(scan, station)?;
                            self.server.send(
                                input_rank(n),
                                CtrlMsg::InputNodeSetTime {
                                    start: self.integration_start(),
                                    stop: self.stop_time_scan,
                                    leave_at: station_stop.min(self.stop_time_scan),
                                },
                            )?;
                        }
                    }
                    self.state = State::StartCorrelationTimeSlice;
                }
                State::StartCorrelationTimeSlice => {
                    self.channel_idx = 0;
                    self.state = State::StartCorrelatorNodesForTimeSlice;
                }
                State::StartCorrelatorNodesForTimeSlice => {
                    let next = if self.ctx.deterministic {
                        if self.correlator_ready[self.current_correlator] {
                            self.correlator_ready[self.current_correlator] = false;
                            Some(self.current_correlator)
                        } else {
                            None
                        }
                    } else {
                        self.ready_correlators.pop_front()
                    };
                    match next {
                        Some(corr_nr) => {
                            self.start_next_timeslice_on_node(corr_nr)?;
                            if self.channel_idx == self.setup.channels_in_scan.len() {
                                self.state = State::GotoNextTimeslice;
                            }
                        }
                        None => {
                            // No idle correlator: wait for the next message.
                            if self.check_and_process_message()?
                                == MessageResult::Disconnected
                            {
                                self.state = State::EndNode;
                            }
                        }
                    }
                }
                State::GotoNextTimeslice => {
                    self.slice_nr += 1;
                    self.progress.inc(1);
                    if self.slice_nr >= self.slices_per_integration() {
                        self.integration_nr += 1;
                        self.slice_nr = 0;
                    }
                    let next_end =
                        self.start_time + self.integration_time() * (self.integration_nr + 1);
                    if next_end > self.stop_time {
                        self.state = State::StopCorrelating;
                    } else if next_end > self.stop_time_scan {
                        self.current_scan += 1;
                        if self.current_scan == self.scan_names.len() {
                            self.state = State::StopCorrelating;
                        } else {
                            self.state = State::StartNewScan;
                        }
                    } else {
                        self.state = State::StartCorrelationTimeSlice;
                    }
                }
                State::StopCorrelating => {
                    self.server.send(
                        RANK_OUTPUT,
                        CtrlMsg::OutputFinalSlice {
                            n_slices: self.output_slice_nr,
                        },
                    )?;
                    self.state = State::WaitForOutputNode;
                }
                State::WaitForOutputNode => {
                    if self.output_finished {
                        self.state = State::EndNode;
                    } else if self.check_and_process_message()? == MessageResult::Disconnected {
                        self.state = State::EndNode;
                    }
                }
                State::EndNode => {}
            }
        }
        self.progress.finish();
        info!("terminating nodes");
        for rank in 1..=self.server.n_peers() as u16 {
            let _ = self.server.send(rank, CtrlMsg::EndNode { error: false });
        }
        Ok(())
    }

    /// Broadcast termination after a node raised an assertion.
    fn terminate_after_assertion(&mut self, from: u16, message: &str) -> FxcorrError {
        warn!("rank {from} raised an assertion: {message}");
        for rank in 1..=self.server.n_peers() as u16 {
            if rank != from {
                let _ = self.server.send(rank, CtrlMsg::EndNode { error: true });
            }
        }
        FxcorrError::AssertionRaised {
            rank: from,
            message: message.to_string(),
        }
    }
}

/// The span of sub-slice `slice_nr` within an integration: its start, its
/// duration and its sample count. A slice is always a whole number of FFT
/// windows; the final sub-slice absorbs whatever the nominal division left
/// over, clipped down to the window grid.
fn slice_geometry(
    integration_start: Time,
    integration_time: TimeDelta,
    slices_per_integration: usize,
    slice_nr: usize,
    sample_rate: u64,
    fft_size: usize,
) -> (Time, TimeDelta, usize) {
    let nominal = TimeDelta::from_ticks(integration_time.ticks() / slices_per_integration as i64);
    let slice_start = integration_start + nominal * slice_nr as i64;
    let slice_time = if slice_nr == slices_per_integration - 1 {
        (integration_start + integration_time) - slice_start
    } else {
        nominal
    };
    let n_ffts = (slice_time.samples(sample_rate) as usize) / fft_size;
    let slice_size = n_ffts * fft_size;
    (
        slice_start,
        TimeDelta::from_samples(slice_size as i64, sample_rate),
        slice_size,
    )
}

impl Node for Manager {
    fn receiver(&self) -> Receiver<Envelope> {
        self.server.inbox().clone()
    }

    fn handle_message(&mut self, envelope: Envelope) -> Result<(), FxcorrError> {
        if envelope.to != crate::transport::RANK_MANAGER {
            // Rank-based addressing: the manager relays node-to-node
            // control traffic.
            self.server.relay(envelope)?;
            return Ok(());
        }
        match envelope.msg {
            CtrlMsg::NodeInitialised => {
                self.inits_pending = self.inits_pending.saturating_sub(1);
            }
            CtrlMsg::ConnectionEstablished { .. } => {
                self.acks_pending = self.acks_pending.saturating_sub(1);
            }
            CtrlMsg::CorrelationReady { corr_nr } => {
                if self.ctx.deterministic {
                    self.correlator_ready[corr_nr] = true;
                } else {
                    self.ready_correlators.push_back(corr_nr);
                }
            }
            CtrlMsg::InputNodeCurrentTime(time) => {
                let n = (envelope.from - input_rank(0)) as usize;
                self.input_times.insert(n, time);
            }
            CtrlMsg::OutputFinished => {
                self.output_finished = true;
            }
            CtrlMsg::AssertionRaised { message } => {
                return Err(self.terminate_after_assertion(envelope.from, &message));
            }
            other => {
                debug!("manager ignoring unexpected message {other:?}");
            }
        }
        Ok(())
    }

    fn is_terminated(&self) -> bool {
        self.state == State::EndNode
    }
}
