//! The correlator node.
//!
//! A correlator node owns one incoming data stream per input node (two per
//! input when cross-polarisation is on) and one outgoing stream to the
//! output node, all established at startup on the manager's command. Each
//! work order names a (slice, channel) tuple; the node consumes the
//! matching slice from every participating station stream, runs the
//! correlation core, ships the resulting record(s), and reports ready.

pub mod correlation;
pub mod pulsar;

use std::collections::HashMap;

use crossbeam_channel::Receiver;
use log::{debug, info, warn};

use crate::cal::CalTable;
use crate::delay::DelayTable;
use crate::error::FxcorrError;
use crate::input::extractor::unpack_samples;
use crate::input::reader::uri_to_path;
use crate::msg::{CorrelationParameters, CtrlMsg, PulsarParameters, StationStream};
use crate::node::Node;
use crate::transport::{
    ControlClient, DataListener, DataReader, DataWriter, Envelope, TransportError, RANK_LOG,
    RANK_MANAGER,
};

use correlation::{correlate_slice, LegData};

/// The correlator node.
pub struct CorrelatorNode {
    rank: u16,
    corr_nr: usize,
    n_inputs: usize,
    client: ControlClient,
    inbox: Receiver<Envelope>,
    listener: DataListener,
    /// Incoming station streams, keyed by reader stream index
    readers: HashMap<usize, DataReader>,
    /// The stream to the output node
    output: Option<DataWriter>,
    /// Delay tables keyed by (input node, phase centre)
    delay_tables: HashMap<(usize, usize), DelayTable>,
    sources: Vec<String>,
    pulsars: HashMap<String, PulsarParameters>,
    cal_path: Option<String>,
    cal: Option<CalTable>,
    terminated: bool,
}

impl CorrelatorNode {
    pub fn new(
        rank: u16,
        corr_nr: usize,
        n_inputs: usize,
        client: ControlClient,
        listener: DataListener,
    ) -> Self {
        info!("correlator node rank {rank}: worker {corr_nr}");
        let inbox = client.inbox().clone();
        Self {
            rank,
            corr_nr,
            n_inputs,
            client,
            inbox,
            listener,
            readers: HashMap::new(),
            output: None,
            delay_tables: HashMap::new(),
            sources: Vec::new(),
            pulsars: HashMap::new(),
            cal_path: None,
            cal: None,
            terminated: false,
        }
    }

    pub fn run(&mut self) -> Result<(), FxcorrError> {
        // Announce idleness once; every processed slice renews it.
        self.client.send(
            RANK_MANAGER,
            CtrlMsg::CorrelationReady {
                corr_nr: self.corr_nr,
            },
        )?;
        self.run_to_completion()
    }

    /// Run, and on a fatal error notify the manager and drain the inbox
    /// until the termination broadcast arrives.
    pub fn run_reporting(&mut self) {
        if let Err(e) = self.run() {
            warn!("correlator {} failed: {e}", self.corr_nr);
            let _ = self.client.send(
                RANK_MANAGER,
                CtrlMsg::AssertionRaised {
                    message: e.to_string(),
                },
            );
            while !self.terminated {
                match self.check_and_process_message() {
                    Ok(crate::node::MessageResult::Disconnected) | Err(_) => break,
                    _ => {}
                }
            }
        }
    }

    /// The reader stream index a leg arrives on.
    fn stream_key(&self, stream: &StationStream, cross: bool) -> usize {
        stream.station_stream + if cross { self.n_inputs } else { 0 }
    }

    /// Pull accepted data connections until `key` is present.
    fn wait_for_stream(&mut self, key: usize) -> Result<(), FxcorrError> {
        while !self.readers.contains_key(&key) {
            let conn = self
                .listener
                .incoming()
                .recv()
                .map_err(|_| TransportError::Closed { rank: self.rank })?;
            debug!(
                "correlator {}: stream {} connected from rank {}",
                self.corr_nr, conn.stream_nr, conn.from_rank
            );
            self.readers.insert(conn.stream_nr, DataReader::new(conn.stream));
        }
        Ok(())
    }

    /// Read one leg's slice and decode it.
    fn read_leg(
        &mut self,
        params: &CorrelationParameters,
        stream: &StationStream,
        cross: bool,
    ) -> Result<LegData, FxcorrError> {
        let key = self.stream_key(stream, cross);
        self.wait_for_stream(key)?;
        let reader = self.readers.get_mut(&key).unwrap();
        let ratio = (stream.sample_rate / params.sample_rate).max(1) as usize;
        let expected = params.slice_size * ratio;
        let (header, payload) = match reader.read_slice()? {
            Some(slice) => slice,
            None => {
                // The input closed the stream: an empty, zero-weight leg.
                warn!(
                    "correlator {}: station stream {key} ended before slice {}",
                    self.corr_nr, params.slice_nr
                );
                (
                    crate::msg::SliceHeader {
                        channel: 0,
                        start: params.slice_start,
                        samples_expected: expected as u64,
                        samples_sent: 0,
                        applied_shift_samples: 0,
                        bytes: 0,
                    },
                    Vec::new(),
                )
            }
        };
        if header.start != params.slice_start {
            return Err(TransportError::Protocol {
                what: format!(
                    "slice for {} arrived on a stream positioned at {}",
                    params.slice_start.date_string(),
                    header.start.date_string()
                ),
            }
            .into());
        }
        let valid = header.samples_sent as usize;
        let mut samples = unpack_samples(&payload, valid.min(expected), stream.bits_per_sample);
        samples.resize(expected, 0.0);
        let delays = (0..params.n_phase_centers.max(1))
            .map(|source| {
                self.delay_tables
                    .get(&(stream.station_stream, source))
                    .cloned()
            })
            .collect();
        Ok(LegData {
            stream: stream.clone(),
            samples,
            valid_samples: valid.min(expected),
            applied_shift: header.applied_shift_samples,
            delays,
        })
    }

    fn ensure_cal(&mut self, params: &CorrelationParameters) -> Result<(), FxcorrError> {
        if self.cal.is_some() {
            return Ok(());
        }
        if let Some(path) = &self.cal_path {
            let table = CalTable::open(
                &uri_to_path(path),
                params.fft_size_correlation / 2,
            )
            .map_err(FxcorrError::from)?;
            self.cal = Some(table);
        }
        Ok(())
    }

    fn process_slice(&mut self, params: &CorrelationParameters) -> Result<(), FxcorrError> {
        let mut legs = Vec::new();
        for stream in &params.station_streams {
            legs.push(self.read_leg(params, stream, false)?);
        }
        if params.cross_channel_nr.is_some() {
            for stream in &params.cross_streams {
                legs.push(self.read_leg(params, stream, true)?);
            }
        }
        self.ensure_cal(params)?;
        let pulsar = params
            .pulsar_binning
            .then(|| {
                self.pulsars
                    .get(&params.source)
                    .or_else(|| self.pulsars.values().next())
            })
            .flatten();
        let records = correlate_slice(params, &legs, self.cal.as_ref(), pulsar, &self.sources)?;
        let output = self.output.as_mut().ok_or(TransportError::Protocol {
            what: "slice dispatched before the output stream was connected".to_string(),
        })?;
        for record in &records {
            output.write_block(&record.encode())?;
        }
        debug!(
            "correlator {}: slice {} channel {} done ({} records)",
            self.corr_nr,
            params.slice_nr,
            params.channel_nr,
            records.len()
        );
        self.client.send(
            RANK_LOG,
            CtrlMsg::LogMessage {
                rank: self.rank,
                level: 2,
                text: format!(
                    "slice {} channel {} correlated at {}",
                    params.slice_nr,
                    params.channel_nr,
                    params.slice_start.date_string()
                ),
            },
        )?;
        Ok(())
    }
}

impl Node for CorrelatorNode {
    fn receiver(&self) -> Receiver<Envelope> {
        self.inbox.clone()
    }

    fn handle_message(&mut self, envelope: Envelope) -> Result<(), FxcorrError> {
        match envelope.msg {
            CtrlMsg::ConnectTo {
                stream_nr,
                endpoint,
                peer_rank,
                peer_stream,
            } => {
                let writer = DataWriter::connect(&endpoint, self.rank, peer_stream)?;
                debug!(
                    "correlator {}: output stream {stream_nr} connected to rank {peer_rank}",
                    self.corr_nr
                );
                self.output = Some(writer);
                self.client
                    .send(RANK_MANAGER, CtrlMsg::ConnectionEstablished { stream_nr })?;
            }
            CtrlMsg::SetDelayTable {
                input_nr,
                source_nr,
                table,
            } => {
                self.delay_tables.insert((input_nr, source_nr), table);
            }
            CtrlMsg::SetSources(sources) => {
                self.sources = sources;
            }
            CtrlMsg::SetPulsarParameters(pulsar) => {
                self.pulsars.insert(pulsar.name.clone(), pulsar);
            }
            CtrlMsg::SetCalTable { path } => {
                self.cal_path = Some(path);
                self.cal = None;
            }
            CtrlMsg::CorrelatorParameters(params) => {
                self.process_slice(&params)?;
                self.client.send(
                    RANK_MANAGER,
                    CtrlMsg::CorrelationReady {
                        corr_nr: self.corr_nr,
                    },
                )?;
            }
            CtrlMsg::SetMessageLevel(_) => {}
            CtrlMsg::EndNode { error } => {
                if error {
                    debug!("correlator {} terminating after error", self.corr_nr);
                }
                self.readers.clear();
                self.output = None;
                self.terminated = true;
            }
            other => {
                debug!("correlator {} ignoring unexpected message {other:?}", self.corr_nr);
            }
        }
        Ok(())
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}
