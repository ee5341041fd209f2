//! The output node and the correlation file format.
//!
//! The output file is a self-describing binary stream: one global header
//! (fixed little-endian struct plus NUL-terminated station and source
//! lists) followed by visibility records. Records arrive from the
//! correlator nodes in completion order; a reorder buffer bounded by the
//! worker count puts them back into dense `slice_nr` order before anything
//! is written. Pulsar-binning and multi-phase-centre runs write one file
//! per bin or source; every file gets the same global header.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::thread;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};
use num_complex::Complex;
use thiserror::Error;

use crate::error::FxcorrError;
use crate::input::reader::uri_to_path;
use crate::msg::CtrlMsg;
use crate::node::Node;
use crate::transport::{ControlClient, DataListener, DataReader, Envelope, RANK_MANAGER};

/// Magic number of a correlation file ("FXCR").
pub const OUTPUT_MAGIC: u32 = 0x4643_5852;

/// Version of the record layout.
pub const OUTPUT_FORMAT_VERSION: u32 = 3;

/// Errors raised while assembling or writing correlation output
#[derive(Error, Debug)]
pub enum OutputError {
    #[error(transparent)]
    /// Generic IO error
    IO(#[from] io::Error),

    /// A record arrived that does not decode
    #[error("undecodable visibility record ({0})")]
    BadRecord(String),

    /// A record arrived for an output stream with no file
    #[error("no output file for stream {stream_nr}")]
    NoWriter {
        /// The stream index the record named
        stream_nr: usize,
    },

    /// A slice number arrived twice for the same output stream
    #[error("duplicate record for slice {slice_nr}")]
    DuplicateSlice {
        /// The repeated slice number
        slice_nr: i64,
    },
}

/// The run-wide header written at the start of every output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalHeader {
    /// Experiment name
    pub experiment: String,
    /// Start year of the correlation
    pub start_year: i32,
    /// Start day of year
    pub start_day: i32,
    /// Start seconds since midnight
    pub start_seconds: i32,
    /// Spectral channels per record
    pub number_channels: u32,
    /// Integration time in microseconds
    pub integration_time_usec: i64,
    /// 0 = single polarisation, 1 = parallel pairs, 2 = full cross
    pub polarisation_type: u8,
    /// Record layout version
    pub output_format_version: u32,
    /// Build id of the correlator that produced the file
    pub correlator_version: u32,
    /// Job and subjob numbers from the control file
    pub job_nr: i32,
    pub subjob_nr: i32,
    /// Stations of the experiment, in header order
    pub stations: Vec<String>,
    /// Sources of the run, in output-stream order
    pub sources: Vec<String>,
}

impl GlobalHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(OUTPUT_MAGIC).unwrap();
        let mut exper = self.experiment.as_bytes().to_vec();
        exper.resize(32, 0);
        out.extend_from_slice(&exper);
        out.write_i32::<LittleEndian>(self.start_year).unwrap();
        out.write_i32::<LittleEndian>(self.start_day).unwrap();
        out.write_i32::<LittleEndian>(self.start_seconds).unwrap();
        out.write_u32::<LittleEndian>(self.number_channels).unwrap();
        out.write_i64::<LittleEndian>(self.integration_time_usec).unwrap();
        out.write_u8(self.polarisation_type).unwrap();
        out.extend_from_slice(&[0u8; 3]);
        out.write_u32::<LittleEndian>(self.output_format_version).unwrap();
        out.write_u32::<LittleEndian>(self.correlator_version).unwrap();
        out.write_i32::<LittleEndian>(self.job_nr).unwrap();
        out.write_i32::<LittleEndian>(self.subjob_nr).unwrap();
        out.write_u32::<LittleEndian>(self.stations.len() as u32).unwrap();
        out.write_u32::<LittleEndian>(self.sources.len() as u32).unwrap();
        for name in self.stations.iter().chain(&self.sources) {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        out
    }

    pub fn decode(mut r: impl Read) -> Result<Self, OutputError> {
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != OUTPUT_MAGIC {
            return Err(OutputError::BadRecord(format!("bad magic {magic:#010x}")));
        }
        let mut exper = [0u8; 32];
        r.read_exact(&mut exper)?;
        let experiment = String::from_utf8_lossy(&exper)
            .trim_end_matches('\0')
            .to_string();
        let start_year = r.read_i32::<LittleEndian>()?;
        let start_day = r.read_i32::<LittleEndian>()?;
        let start_seconds = r.read_i32::<LittleEndian>()?;
        let number_channels = r.read_u32::<LittleEndian>()?;
        let integration_time_usec = r.read_i64::<LittleEndian>()?;
        let polarisation_type = r.read_u8()?;
        let mut pad = [0u8; 3];
        r.read_exact(&mut pad)?;
        let output_format_version = r.read_u32::<LittleEndian>()?;
        let correlator_version = r.read_u32::<LittleEndian>()?;
        let job_nr = r.read_i32::<LittleEndian>()?;
        let subjob_nr = r.read_i32::<LittleEndian>()?;
        let n_stations = r.read_u32::<LittleEndian>()?;
        let n_sources = r.read_u32::<LittleEndian>()?;
        let read_string = |r: &mut dyn Read| -> Result<String, OutputError> {
            let mut bytes = Vec::new();
            loop {
                let mut byte = [0u8; 1];
                r.read_exact(&mut byte)?;
                if byte[0] == 0 {
                    break;
                }
                bytes.push(byte[0]);
            }
            Ok(String::from_utf8_lossy(&bytes).to_string())
        };
        let stations = (0..n_stations)
            .map(|_| read_string(&mut r))
            .collect::<Result<_, _>>()?;
        let sources = (0..n_sources)
            .map(|_| read_string(&mut r))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            experiment,
            start_year,
            start_day,
            start_seconds,
            number_channels,
            integration_time_usec,
            polarisation_type,
            output_format_version,
            correlator_version,
            job_nr,
            subjob_nr,
            stations,
            sources,
        })
    }
}

/// One baseline's integrated spectrum within a record.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineSpectrum {
    /// First station (input-node index)
    pub station1: u16,
    /// Second station; equal to `station1` for an autocorrelation
    pub station2: u16,
    /// Polarisations of the product
    pub pol1: char,
    pub pol2: char,
    /// Fraction of the slice that contributed (0 when a station was absent)
    pub weight: f32,
    /// The integrated spectrum, `number_channels` bins
    pub spectrum: Vec<Complex<f32>>,
}

/// One correlated slice.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibilityRecord {
    /// Dense output position
    pub slice_nr: i64,
    /// Integration the slice belongs to
    pub integration_nr: i64,
    /// Channel index
    pub channel_nr: u32,
    /// Output stream: pulsar bin or source number
    pub stream_nr: u32,
    /// Source name
    pub source: String,
    /// Baseline spectra, autos included
    pub baselines: Vec<BaselineSpectrum>,
}

impl VisibilityRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_i64::<LittleEndian>(self.slice_nr).unwrap();
        out.write_i64::<LittleEndian>(self.integration_nr).unwrap();
        out.write_u32::<LittleEndian>(self.channel_nr).unwrap();
        out.write_u32::<LittleEndian>(self.stream_nr).unwrap();
        out.write_u16::<LittleEndian>(self.source.len() as u16).unwrap();
        out.extend_from_slice(self.source.as_bytes());
        out.write_u32::<LittleEndian>(self.baselines.len() as u32).unwrap();
        for baseline in &self.baselines {
            out.write_u16::<LittleEndian>(baseline.station1).unwrap();
            out.write_u16::<LittleEndian>(baseline.station2).unwrap();
            out.write_u8(baseline.pol1 as u8).unwrap();
            out.write_u8(baseline.pol2 as u8).unwrap();
            out.write_f32::<LittleEndian>(baseline.weight).unwrap();
            out.write_u32::<LittleEndian>(baseline.spectrum.len() as u32).unwrap();
            for value in &baseline.spectrum {
                out.write_f32::<LittleEndian>(value.re).unwrap();
                out.write_f32::<LittleEndian>(value.im).unwrap();
            }
        }
        out
    }

    pub fn decode(mut r: impl Read) -> Result<Self, OutputError> {
        let slice_nr = r.read_i64::<LittleEndian>()?;
        let integration_nr = r.read_i64::<LittleEndian>()?;
        let channel_nr = r.read_u32::<LittleEndian>()?;
        let stream_nr = r.read_u32::<LittleEndian>()?;
        let source_len = r.read_u16::<LittleEndian>()? as usize;
        let mut source = vec![0u8; source_len];
        r.read_exact(&mut source)?;
        let n_baselines = r.read_u32::<LittleEndian>()?;
        let mut baselines = Vec::with_capacity(n_baselines as usize);
        for _ in 0..n_baselines {
            let station1 = r.read_u16::<LittleEndian>()?;
            let station2 = r.read_u16::<LittleEndian>()?;
            let pol1 = r.read_u8()? as char;
            let pol2 = r.read_u8()? as char;
            let weight = r.read_f32::<LittleEndian>()?;
            let n_bins = r.read_u32::<LittleEndian>()? as usize;
            if n_bins > 1 << 24 {
                return Err(OutputError::BadRecord(format!("absurd bin count {n_bins}")));
            }
            let mut spectrum = Vec::with_capacity(n_bins);
            for _ in 0..n_bins {
                let re = r.read_f32::<LittleEndian>()?;
                let im = r.read_f32::<LittleEndian>()?;
                spectrum.push(Complex::new(re, im));
            }
            baselines.push(BaselineSpectrum {
                station1,
                station2,
                pol1,
                pol2,
                weight,
                spectrum,
            });
        }
        Ok(Self {
            slice_nr,
            integration_nr,
            channel_nr,
            stream_nr,
            source: String::from_utf8_lossy(&source).to_string(),
            baselines,
        })
    }
}

/// The output node.
pub struct OutputNode {
    client: ControlClient,
    inbox: Receiver<Envelope>,
    listener: DataListener,
    records_rx: Receiver<Result<VisibilityRecord, OutputError>>,
    records_tx: Sender<Result<VisibilityRecord, OutputError>>,
    writers: BTreeMap<usize, BufWriter<File>>,
    header: Option<Vec<u8>>,
    header_written: bool,
    /// Records waiting for their slice number to come up
    reorder: BTreeMap<i64, Vec<VisibilityRecord>>,
    next_slice: i64,
    /// Total slices in the run, once the manager announces it
    final_slices: Option<i64>,
    finished_sent: bool,
    terminated: bool,
}

impl OutputNode {
    pub fn new(client: ControlClient, listener: DataListener) -> Self {
        let inbox = client.inbox().clone();
        let (records_tx, records_rx) = bounded(256);
        Self {
            client,
            inbox,
            listener,
            records_rx,
            records_tx,
            writers: BTreeMap::new(),
            header: None,
            header_written: false,
            reorder: BTreeMap::new(),
            next_slice: 0,
            final_slices: None,
            finished_sent: false,
            terminated: false,
        }
    }

    /// Records per slice: one per output stream.
    fn records_per_slice(&self) -> usize {
        self.writers.len().max(1)
    }

    pub fn run(&mut self) -> Result<(), FxcorrError> {
        let inbox = self.inbox.clone();
        let incoming = self.listener.incoming().clone();
        let records_rx = self.records_rx.clone();
        while !self.terminated {
            crossbeam_channel::select! {
                recv(inbox) -> envelope => match envelope {
                    Ok(envelope) => self.handle_message(envelope)?,
                    Err(_) => break,
                },
                recv(incoming) -> conn => {
                    let Ok(conn) = conn else { break };
                    debug!("output node: correlator rank {} connected", conn.from_rank);
                    let tx = self.records_tx.clone();
                    let mut reader = DataReader::new(conn.stream);
                    thread::Builder::new()
                        .name(format!("vis-rx-{}", conn.from_rank))
                        .spawn(move || loop {
                            match reader.read_block() {
                                Ok(Some(block)) => {
                                    let record = VisibilityRecord::decode(&block[..]);
                                    if tx.send(record).is_err() {
                                        return;
                                    }
                                }
                                Ok(None) => return,
                                Err(e) => {
                                    warn!("visibility stream errored: {e}");
                                    return;
                                }
                            }
                        })
                        .expect("spawn visibility reader");
                }
                recv(records_rx) -> record => {
                    let record = record.map_err(|_| {
                        FxcorrError::Output(OutputError::BadRecord("record channel closed".into()))
                    })??;
                    self.accept_record(record)?;
                }
            }
            self.maybe_finish()?;
        }
        Ok(())
    }

    /// Run, and on a fatal error notify the manager and drain the inbox
    /// until the termination broadcast arrives.
    pub fn run_reporting(&mut self) {
        if let Err(e) = self.run() {
            warn!("output node failed: {e}");
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

    fn accept_record(&mut self, record: VisibilityRecord) -> Result<(), FxcorrError> {
        if record.slice_nr < self.next_slice {
            return Err(OutputError::DuplicateSlice {
                slice_nr: record.slice_nr,
            }
            .into());
        }
        let pending = self.reorder.entry(record.slice_nr).or_default();
        if pending
            .iter()
            .any(|r| r.stream_nr == record.stream_nr)
        {
            return Err(OutputError::DuplicateSlice {
                slice_nr: record.slice_nr,
            }
            .into());
        }
        pending.push(record);
        self.flush_ready()?;
        Ok(())
    }

    /// Write out every complete slice at the head of the reorder buffer.
    fn flush_ready(&mut self) -> Result<(), FxcorrError> {
        let per_slice = self.records_per_slice();
        while let Some(pending) = self.reorder.get(&self.next_slice) {
            if pending.len() < per_slice {
                break;
            }
            let mut records = self.reorder.remove(&self.next_slice).unwrap();
            records.sort_by_key(|r| r.stream_nr);
            for record in records {
                let stream_nr = record.stream_nr as usize;
                let writer = self
                    .writers
                    .get_mut(&stream_nr)
                    .ok_or(OutputError::NoWriter { stream_nr })?;
                writer.write_all(&record.encode()).map_err(OutputError::IO)?;
            }
            self.next_slice += 1;
        }
        Ok(())
    }

    fn maybe_finish(&mut self) -> Result<(), FxcorrError> {
        if self.finished_sent {
            return Ok(());
        }
        if let Some(final_slices) = self.final_slices {
            if self.next_slice >= final_slices {
                for writer in self.writers.values_mut() {
                    writer.flush().map_err(OutputError::IO)?;
                }
                info!("output node: {final_slices} slices written");
                self.client.send(RANK_MANAGER, CtrlMsg::OutputFinished)?;
                self.finished_sent = true;
            }
        }
        Ok(())
    }
}

impl Node for OutputNode {
    fn receiver(&self) -> Receiver<Envelope> {
        self.inbox.clone()
    }

    fn handle_message(&mut self, envelope: Envelope) -> Result<(), FxcorrError> {
        match envelope.msg {
            CtrlMsg::AddDataWriterFile { stream_nr, path } => {
                let path = uri_to_path(&path);
                let file = File::create(&path).map_err(OutputError::IO)?;
                let mut writer = BufWriter::new(file);
                if let Some(header) = &self.header {
                    writer.write_all(header).map_err(OutputError::IO)?;
                }
                debug!("output node: stream {stream_nr} -> {}", path.display());
                self.writers.insert(stream_nr, writer);
                self.client
                    .send(RANK_MANAGER, CtrlMsg::ConnectionEstablished { stream_nr })?;
            }
            CtrlMsg::OutputGlobalHeader(bytes) => {
                if !self.header_written {
                    for writer in self.writers.values_mut() {
                        writer.write_all(&bytes).map_err(OutputError::IO)?;
                    }
                    self.header_written = true;
                }
                self.header = Some(bytes);
            }
            CtrlMsg::OutputFinalSlice { n_slices } => {
                self.final_slices = Some(n_slices);
            }
            CtrlMsg::SetMessageLevel(_) => {}
            CtrlMsg::EndNode { .. } => {
                for writer in self.writers.values_mut() {
                    let _ = writer.flush();
                }
                self.terminated = true;
            }
            other => {
                debug!("output node ignoring unexpected message {other:?}");
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

    fn sample_record(slice_nr: i64, stream_nr: u32) -> VisibilityRecord {
        VisibilityRecord {
            slice_nr,
            integration_nr: slice_nr / 8,
            channel_nr: 2,
            stream_nr,
            source: "J1159+2914".to_string(),
            baselines: vec![BaselineSpectrum {
                station1: 0,
                station2: 1,
                pol1: 'R',
                pol2: 'R',
                weight: 0.96,
                spectrum: vec![Complex::new(1.0, -0.5); 16],
            }],
        }
    }

    #[test]
    fn test_record_codec_round_trip() {
        let record = sample_record(42, 3);
        let bytes = record.encode();
        let decoded = VisibilityRecord::decode(&bytes[..]).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_global_header_round_trip() {
        let header = GlobalHeader {
            experiment: "N23L1".to_string(),
            start_year: 2015,
            start_day: 181,
            start_seconds: 43_200,
            number_channels: 256,
            integration_time_usec: 1_000_000,
            polarisation_type: 2,
            output_format_version: OUTPUT_FORMAT_VERSION,
            correlator_version: 310,
            job_nr: 1234,
            subjob_nr: 1,
            stations: vec!["Ef".to_string(), "Wb".to_string()],
            sources: vec!["J1159+2914".to_string()],
        };
        let bytes = header.encode();
        let decoded = GlobalHeader::decode(&bytes[..]).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let bytes = vec![0u8; 128];
        assert!(matches!(
            GlobalHeader::decode(&bytes[..]),
            Err(OutputError::BadRecord(_))
        ));
    }

    #[test]
    fn test_record_decode_truncated() {
        let record = sample_record(1, 0);
        let bytes = record.encode();
        assert!(VisibilityRecord::decode(&bytes[..bytes.len() - 4]).is_err());
    }
}
