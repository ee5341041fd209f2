//! The input node: one per station datastream.
//!
//! An input node owns one recording, runs it through the channel extractor,
//! and serves time slices into any number of outgoing streams on demand.
//! The pipeline is reader thread → extractor → per-channel sample queues →
//! stream writers; the reader advances only as fast as the slowest consumer
//! drains its queue, and all state changes happen on the node's event loop.
//!
//! Delay handling is split across two levels, as the alignment contract
//! requires: the input node applies the coarse, byte-aligned part of the
//! geometric delay when it cuts a slice out of the sample stream (recorded
//! in the slice header), and the correlator corrects the residual per FFT
//! window. A short retention tail behind the read point absorbs the few
//! samples of backwards drift between consecutive slices.

pub mod extractor;
pub mod reader;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use log::{debug, info, warn};

use crate::context::RunContext;
use crate::delay::DelayTable;
use crate::error::FxcorrError;
use crate::msg::{CtrlMsg, InputNodeParameters, SliceHeader};
use crate::node::Node;
use crate::time::{Time, TimeDelta};
use crate::transport::{ControlClient, DataWriter, Envelope, RANK_LOG, RANK_MANAGER};
use crate::vex::DataFormat;

use extractor::{new_extractor, ChannelExtractor, FormatError};
use reader::{BlockPipeline, Recording};

/// Samples extracted per pipeline step.
const EXTRACT_CHUNK: usize = 1 << 16;

/// Bytes kept behind the read point of each channel queue, so a slightly
/// smaller delay shift on the next slice can reach back.
const RETAIN_BYTES: usize = 4096;

/// One queued slice request.
#[derive(Debug, Clone)]
struct SliceRequest {
    channel: usize,
    stream_nr: usize,
    start: Time,
    stop: Time,
    slice_samples: u64,
}

/// Extracted samples of one channel, timestamped at the first buffered
/// sample.
struct ChannelQueue {
    bytes: Vec<u8>,
    start_time: Time,
}

impl ChannelQueue {
    fn samples(&self, bits: u8) -> u64 {
        self.bytes.len() as u64 * 8 / bits as u64
    }
}

/// The input node.
pub struct InputNode {
    ctx: Arc<RunContext>,
    rank: u16,
    input_nr: usize,
    station: String,
    client: ControlClient,
    inbox: Receiver<Envelope>,
    sources: Option<Vec<String>>,
    params: Option<InputNodeParameters>,
    extractor: Option<Box<dyn ChannelExtractor>>,
    delay: Option<DelayTable>,
    queues: Vec<ChannelQueue>,
    writers: HashMap<usize, DataWriter>,
    slice_queue: VecDeque<SliceRequest>,
    /// Produce no sample at or after this time
    window_stop: Option<Time>,
    /// Terminate production once the cursor passes this time
    leave_at: Option<Time>,
    /// The recording held no usable frame and the run tolerates that;
    /// every slice is served empty
    empty_datastream: bool,
    eof: bool,
    terminated: bool,
}

impl InputNode {
    pub fn new(
        ctx: Arc<RunContext>,
        rank: u16,
        input_nr: usize,
        station: String,
        datastream: String,
        format: DataFormat,
        client: ControlClient,
    ) -> Self {
        info!(
            "input node rank {rank}: station {station}{}{} ({format:?})",
            if datastream.is_empty() { "" } else { ":" },
            datastream,
        );
        let inbox = client.inbox().clone();
        Self {
            ctx,
            rank,
            input_nr,
            station,
            client,
            inbox,
            sources: None,
            params: None,
            extractor: None,
            delay: None,
            queues: Vec::new(),
            writers: HashMap::new(),
            slice_queue: VecDeque::new(),
            window_stop: None,
            leave_at: None,
            empty_datastream: false,
            eof: false,
            terminated: false,
        }
    }

    /// The main loop: drain control messages, then service one slice; block
    /// on the inbox when there is nothing to do.
    pub fn run(&mut self) -> Result<(), FxcorrError> {
        while !self.terminated {
            self.process_all_waiting_messages()?;
            if self.terminated {
                break;
            }
            if self.serviceable() {
                self.service_next_slice()?;
                // Past the leave time no further sample can be needed.
                if let Some(leave_at) = self.leave_at {
                    if self.extractor.is_some() && self.current_time() >= leave_at {
                        self.eof = true;
                    }
                }
            } else if self.check_and_process_message()?
                == crate::node::MessageResult::Disconnected
            {
                break;
            }
        }
        Ok(())
    }

    /// Run, and on a fatal error notify the manager and drain the inbox
    /// until the termination broadcast arrives.
    pub fn run_reporting(&mut self) {
        if let Err(e) = self.run() {
            warn!("input node {} failed: {e}", self.rank);
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

    fn serviceable(&self) -> bool {
        match self.slice_queue.front() {
            Some(req) => {
                (self.extractor.is_some() || self.empty_datastream)
                    && self.writers.contains_key(&req.stream_nr)
            }
            None => false,
        }
    }

    fn bits(&self) -> u8 {
        self.params.as_ref().map(|p| p.bits_per_sample).unwrap_or(2)
    }

    fn reader_offset(&self) -> TimeDelta {
        self.params
            .as_ref()
            .map(|p| p.reader_offset)
            .unwrap_or_else(|| TimeDelta::from_ticks(0))
    }

    /// The nominal read time: the extractor cursor with the clock reader
    /// offset removed.
    fn current_time(&self) -> Time {
        match &self.extractor {
            Some(ex) => ex.current_time() - self.reader_offset(),
            None => Time::from_ticks(0),
        }
    }

    fn build_extractor(&mut self) -> Result<(), FxcorrError> {
        let (Some(sources), Some(params)) = (&self.sources, &self.params) else {
            return Ok(());
        };
        let pipeline = BlockPipeline::spawn(Recording::new(sources));
        let extractor = match new_extractor(
            Box::new(pipeline),
            params,
            self.ctx.seed,
            self.ctx.check_interval,
        ) {
            Ok(extractor) => extractor,
            Err(e @ FormatError::SyncNotFound { .. })
                if !self.ctx.control.exit_on_empty_datastream.unwrap_or(true) =>
            {
                warn!(
                    "input node {} ({}): no usable data, serving empty slices: {e}",
                    self.rank, self.station
                );
                self.empty_datastream = true;
                self.extractor = None;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let start = extractor.current_time() - params.reader_offset;
        self.queues = (0..params.channels.len())
            .map(|_| ChannelQueue {
                bytes: Vec::new(),
                start_time: start,
            })
            .collect();
        self.extractor = Some(extractor);
        self.eof = false;
        debug!(
            "input node {}: extractor up for {} channels, recording starts {}",
            self.rank,
            self.queues.len(),
            start.date_string()
        );
        Ok(())
    }

    /// Extract one chunk for every channel. Returns false at end of data.
    fn extract_chunk(&mut self) -> Result<bool, FxcorrError> {
        let Some(extractor) = &mut self.extractor else {
            return Ok(false);
        };
        let mut buffers: Vec<Vec<u8>> = vec![Vec::new(); self.queues.len()];
        let produced = extractor.extract(EXTRACT_CHUNK, &mut buffers)?;
        for (queue, buffer) in self.queues.iter_mut().zip(buffers) {
            queue.bytes.extend(buffer);
        }
        if produced < EXTRACT_CHUNK {
            self.eof = true;
        }
        Ok(produced > 0)
    }

    /// The coarse delay shift for a slice starting at `t`: the geometric +
    /// clock-residual delay rounded to whole bytes of samples.
    fn coarse_shift_samples(&self, t: Time, sample_rate: u64, bits: u8) -> i64 {
        let align = (8 / bits) as i64;
        match &self.delay {
            Some(table) if table.covers(t) => {
                let raw = (table.eval(t).delay * sample_rate as f64).round() as i64;
                raw.div_euclid(align) * align
            }
            _ => 0,
        }
    }

    fn service_next_slice(&mut self) -> Result<(), FxcorrError> {
        let req = self.slice_queue.pop_front().expect("serviceable slice");
        if self.empty_datastream {
            let header = SliceHeader {
                channel: req.channel as u32,
                start: req.start,
                samples_expected: req.slice_samples,
                samples_sent: 0,
                applied_shift_samples: 0,
                bytes: 0,
            };
            let writer = self.writers.get_mut(&req.stream_nr).expect("connected stream");
            return writer.write_slice(&header, &[]).map_err(FxcorrError::from);
        }
        let bits = self.bits();
        let sample_rate = self.params.as_ref().unwrap().sample_rate;

        let shift = self.coarse_shift_samples(req.start, sample_rate, bits);
        let desired_start = req.start + TimeDelta::from_samples(shift, sample_rate);

        // Clip the request to the window stop (nominal times).
        let mut wanted = req.slice_samples;
        if let Some(stop) = self.window_stop {
            if req.start >= stop {
                wanted = 0;
            } else if req.stop > stop {
                wanted = wanted.min((stop - req.start).samples(sample_rate) as u64);
            }
        }

        // Fill the channel queue until it covers the shifted request, or
        // the data ends.
        loop {
            let queue = &self.queues[req.channel];
            let offset = (desired_start - queue.start_time).samples(sample_rate);
            let have = queue.samples(bits) as i64 - offset.max(0);
            if have >= wanted as i64 || self.eof {
                break;
            }
            self.extract_chunk()?;
        }

        let queue = &mut self.queues[req.channel];
        let mut offset = (desired_start - queue.start_time).samples(sample_rate);
        if offset < 0 {
            // The retention tail was not deep enough for this shift; serve
            // from what is left and let the consumer see the misalignment
            // in the header times.
            warn!(
                "input node {}: slice at {} reaches {} samples behind the retained stream",
                self.rank,
                req.start.date_string(),
                -offset
            );
            offset = 0;
        }
        let offset_bytes = offset as usize * bits as usize / 8;
        let avail = queue.samples(bits).saturating_sub(offset as u64);
        let sent = wanted.min(avail);
        let n_bytes = sent as usize * bits as usize / 8;
        let payload: Vec<u8> = if n_bytes == 0 {
            Vec::new()
        } else {
            queue.bytes[offset_bytes..offset_bytes + n_bytes].to_vec()
        };

        // Trim consumed bytes, keeping the retention tail. The data may
        // have ended before the request, so clamp to what is there.
        let consumed = (offset_bytes + n_bytes).min(queue.bytes.len());
        let trim = consumed.saturating_sub(RETAIN_BYTES);
        if trim > 0 {
            queue.bytes.drain(..trim);
            queue.start_time = queue.start_time
                + TimeDelta::from_samples((trim * 8 / bits as usize) as i64, sample_rate);
        }

        if sent < req.slice_samples {
            debug!(
                "input node {}: short slice on stream {} ({sent}/{} samples)",
                self.rank, req.stream_nr, req.slice_samples
            );
            self.client.send(
                RANK_LOG,
                CtrlMsg::LogMessage {
                    rank: self.rank,
                    level: 1,
                    text: format!(
                        "short slice at {}: {sent} of {} samples",
                        req.start.date_string(),
                        req.slice_samples
                    ),
                },
            )?;
            if self.ctx.strict_slice_accounting && sent < wanted {
                return Err(FxcorrError::Format(FormatError::SliceAccounting {
                    declared: wanted,
                    measured: sent,
                }));
            }
        }

        let header = SliceHeader {
            channel: req.channel as u32,
            start: req.start,
            samples_expected: req.slice_samples,
            samples_sent: sent,
            applied_shift_samples: shift,
            bytes: payload.len() as u64,
        };
        let writer = self.writers.get_mut(&req.stream_nr).expect("connected stream");
        writer.write_slice(&header, &payload).map_err(FxcorrError::from)
    }
}

impl Node for InputNode {
    fn receiver(&self) -> Receiver<Envelope> {
        self.inbox.clone()
    }

    fn handle_message(&mut self, envelope: Envelope) -> Result<(), FxcorrError> {
        match envelope.msg {
            CtrlMsg::AddDataReaderFile { sources } => {
                self.sources = Some(sources);
                self.build_extractor()?;
            }
            CtrlMsg::InputNodeSetParameters(params) => {
                self.params = Some(params);
                self.build_extractor()?;
            }
            CtrlMsg::ConnectTo {
                stream_nr,
                endpoint,
                peer_rank,
                peer_stream,
            } => {
                let writer = DataWriter::connect(&endpoint, self.rank, peer_stream)?;
                debug!(
                    "input node {}: stream {stream_nr} connected to rank {peer_rank}[{peer_stream}]",
                    self.rank
                );
                self.writers.insert(stream_nr, writer);
                self.client
                    .send(RANK_MANAGER, CtrlMsg::ConnectionEstablished { stream_nr })?;
            }
            CtrlMsg::InputNodeGetCurrentTime => {
                let now = self.current_time();
                self.client
                    .send(RANK_MANAGER, CtrlMsg::InputNodeCurrentTime(now))?;
            }
            CtrlMsg::InputNodeSetTime {
                start,
                stop,
                leave_at,
            } => {
                let offset = self.reader_offset();
                if let Some(extractor) = &mut self.extractor {
                    extractor.goto_time(start + offset)?;
                }
                for queue in &mut self.queues {
                    queue.bytes.clear();
                    queue.start_time = start;
                }
                self.window_stop = Some(stop);
                self.leave_at = Some(leave_at);
                self.eof = false;
            }
            CtrlMsg::InputNodeAddTimeSlice {
                channel,
                stream_nr,
                start,
                stop,
                slice_samples,
            } => {
                self.slice_queue.push_back(SliceRequest {
                    channel,
                    stream_nr,
                    start,
                    stop,
                    slice_samples,
                });
            }
            CtrlMsg::SetDelayTable {
                input_nr,
                source_nr,
                table,
            } => {
                if input_nr == self.input_nr && source_nr == 0 {
                    self.delay = Some(table);
                }
            }
            CtrlMsg::SetMessageLevel(_) => {}
            CtrlMsg::EndNode { error } => {
                if error {
                    debug!("input node {} terminating after error", self.rank);
                }
                self.writers.clear();
                self.terminated = true;
            }
            other => {
                debug!(
                    "input node {} ({}) ignoring unexpected message {other:?}",
                    self.rank, self.station
                );
            }
        }
        Ok(())
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_queue_sample_accounting() {
        let mut queue = ChannelQueue {
            bytes: Vec::new(),
            start_time: Time::from_mjd_seconds(57203, 0.0),
        };
        queue.bytes.extend(vec![0u8; 100]);
        assert_eq!(queue.samples(2), 400);
        assert_eq!(queue.samples(1), 800);
    }
}
