//! VDIF recordings: self-describing frames, multi-thread, multi-channel.
//!
//! Every frame carries a 32-byte header giving its length, channel count,
//! sample width, thread id and timestamp (seconds from a six-month
//! reference epoch plus a frame number within the second), so nothing about
//! the geometry needs a sync scan; the scan here only finds the first
//! plausible header in a stream that may start mid-frame. Frames from
//! different threads interleave; each configured channel names its thread
//! and its channel index within that thread's frames.
//!
//! VDIF 2-bit samples are offset-binary; they are remapped on extraction to
//! the crate-wide `magnitude | sign << 1` packing so every downstream
//! consumer sees one convention. Frames flagged invalid contribute
//! pseudo-random samples instead of their payload.

use byteorder::{ByteOrder, LittleEndian};

use crate::msg::InputNodeParameters;
use crate::time::{Time, TimeDelta};
use crate::vex::DataFormat;

use super::super::reader::ByteSource;
use super::demux::BitWriter;
use super::{ChannelExtractor, FormatError, HeaderRng, MAX_SYNC_SCAN_FRAMES};

/// Header bytes of a (non-legacy) VDIF frame.
pub const HEADER_BYTES: usize = 32;

/// Remap offset-binary 2-bit values to `magnitude | sign << 1`.
const OFFSET_TO_INTERNAL: [u8; 4] = [0b01, 0b00, 0b10, 0b11];

/// Decoded VDIF header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VdifHeader {
    /// Seconds from the reference epoch
    pub seconds: u32,
    /// Payload marked invalid
    pub invalid: bool,
    /// Frame number within the second
    pub frame_in_second: u32,
    /// Reference epoch: six-month periods since 2000-01-01
    pub ref_epoch: u8,
    /// Total frame length in bytes (header included)
    pub frame_bytes: usize,
    /// Channels per frame
    pub nchan: u32,
    /// Bits per sample
    pub bits_per_sample: u8,
    /// Thread id
    pub thread_id: u16,
}

/// Encode a header (the inverse of [`decode_header`]); shared with the
/// synthetic-recording generator.
pub fn encode_header(header: &VdifHeader) -> [u8; HEADER_BYTES] {
    let mut out = [0u8; HEADER_BYTES];
    let w0 = (header.seconds & 0x3FFF_FFFF) | ((header.invalid as u32) << 31);
    LittleEndian::write_u32(&mut out[0..4], w0);
    let w1 = (header.frame_in_second & 0x00FF_FFFF) | ((header.ref_epoch as u32) << 24);
    LittleEndian::write_u32(&mut out[4..8], w1);
    let w2 = ((header.frame_bytes / 8) as u32) & 0x00FF_FFFF
        | (header.nchan.trailing_zeros() << 24);
    LittleEndian::write_u32(&mut out[8..12], w2);
    let w3 = ((header.thread_id as u32) << 16) | (((header.bits_per_sample - 1) as u32) << 26);
    LittleEndian::write_u32(&mut out[12..16], w3);
    out
}

/// Decode a header. `None` when the fields are not self-consistent.
pub fn decode_header(bytes: &[u8]) -> Option<VdifHeader> {
    if bytes.len() < HEADER_BYTES {
        return None;
    }
    let w0 = LittleEndian::read_u32(&bytes[0..4]);
    let w1 = LittleEndian::read_u32(&bytes[4..8]);
    let w2 = LittleEndian::read_u32(&bytes[8..12]);
    let w3 = LittleEndian::read_u32(&bytes[12..16]);
    let legacy = w0 & (1 << 30) != 0;
    let frame_bytes = ((w2 & 0x00FF_FFFF) as usize) * 8;
    let log2_nchan = (w2 >> 24) & 0x1F;
    let version = w2 >> 29;
    if legacy || version != 0 || frame_bytes <= HEADER_BYTES || log2_nchan > 10 {
        return None;
    }
    Some(VdifHeader {
        seconds: w0 & 0x3FFF_FFFF,
        invalid: w0 & (1 << 31) != 0,
        frame_in_second: w1 & 0x00FF_FFFF,
        ref_epoch: ((w1 >> 24) & 0x3F) as u8,
        frame_bytes,
        nchan: 1 << log2_nchan,
        bits_per_sample: (((w3 >> 26) & 0x1F) + 1) as u8,
        thread_id: ((w3 >> 16) & 0x3FF) as u16,
    })
}

/// The start of a reference epoch: six-month periods since 2000-01-01.
pub fn epoch_start(ref_epoch: u8) -> Time {
    let year = 2000 + (ref_epoch / 2) as i32;
    let month = if ref_epoch % 2 == 0 { 1 } else { 7 };
    let date = chrono::NaiveDate::from_ymd_opt(year, month, 1).expect("valid vdif epoch");
    use chrono::Datelike;
    let mjd = date.num_days_from_ce() as i64 - 678_576;
    Time::from_mjd_seconds(mjd, 0.0)
}

/// The timestamp of a frame, at frame granularity.
pub fn header_time(header: &VdifHeader, samples_per_frame: usize, sample_rate: u64) -> Time {
    epoch_start(header.ref_epoch)
        + TimeDelta::from_seconds(header.seconds as f64)
        + TimeDelta::from_samples(
            header.frame_in_second as i64 * samples_per_frame as i64,
            sample_rate,
        )
}

/// One configured output channel.
struct VdifChannel {
    thread_id: u16,
    channel_index: u32,
}

pub struct VdifExtractor {
    source: Box<dyn ByteSource + Send>,
    pending: Vec<u8>,
    channels: Vec<VdifChannel>,
    sinks: Vec<BitWriter>,
    bits_per_sample: u8,
    sample_rate: u64,
    nchan_frame: u32,
    frame_bytes: usize,
    samples_per_frame: usize,
    /// Time up to which every channel has produced samples
    stream_time: Time,
    /// Samples at the head of arriving frames still to be discarded after a
    /// reposition
    drop_until: Option<Time>,
    /// Next expected frame index per thread, for continuity policing
    expected_next: Vec<(u16, u64)>,
    frame_nr: u64,
    rng: HeaderRng,
    eof: bool,
}

impl VdifExtractor {
    pub fn new(
        mut source: Box<dyn ByteSource + Send>,
        params: &InputNodeParameters,
        seed: u32,
        _check_interval: u32,
    ) -> Result<Self, FormatError> {
        let channels: Vec<VdifChannel> = params
            .channels
            .iter()
            .map(|ch| {
                if ch.sign_tracks.len() != 2 {
                    return Err(FormatError::BadTrackMap(format!(
                        "vdif channel {} needs [thread_id, channel_index], got {:?}",
                        ch.channel_name, ch.sign_tracks
                    )));
                }
                Ok(VdifChannel {
                    thread_id: ch.sign_tracks[0] as u16,
                    channel_index: ch.sign_tracks[1],
                })
            })
            .collect::<Result<_, _>>()?;

        // Find the first self-consistent header. A stream that starts
        // mid-frame is walked byte by byte until one is found whose
        // successor header, frame_bytes later, is consistent with it.
        let mut buf = Vec::new();
        let mut pos = 0usize;
        let probe_bytes = 1 << 16;
        let scan_limit = MAX_SYNC_SCAN_FRAMES * probe_bytes;
        let (header, frame, pending) = loop {
            while buf.len() < pos + 2 * probe_bytes {
                let old_len = buf.len();
                buf.resize(old_len + probe_bytes, 0);
                let got = source.read_into(&mut buf[old_len..])?;
                buf.truncate(old_len + got);
                if got == 0 {
                    break;
                }
            }
            if pos + HEADER_BYTES > buf.len() || pos >= scan_limit {
                return Err(FormatError::SyncNotFound {
                    format: DataFormat::Vdif,
                    scanned: pos,
                });
            }
            if let Some(header) = decode_header(&buf[pos..]) {
                let next = pos + header.frame_bytes;
                let confirmed = match decode_header(buf.get(next..next + HEADER_BYTES).unwrap_or(&[])) {
                    Some(successor) => {
                        successor.frame_bytes == header.frame_bytes
                            && successor.ref_epoch == header.ref_epoch
                            && successor.nchan == header.nchan
                    }
                    // A recording shorter than two frames gets the benefit
                    // of the doubt.
                    None => next >= buf.len(),
                };
                if confirmed && pos + header.frame_bytes <= buf.len() {
                    break (
                        header,
                        buf[pos..pos + header.frame_bytes].to_vec(),
                        buf[pos + header.frame_bytes..].to_vec(),
                    );
                }
            }
            pos += 1;
        };

        let payload_bits = (header.frame_bytes - HEADER_BYTES) * 8;
        let samples_per_frame =
            payload_bits / (header.nchan as usize * header.bits_per_sample as usize);
        if samples_per_frame * header.bits_per_sample as usize % 8 != 0 {
            return Err(FormatError::BadTrackMap(
                "vdif frame does not hold a whole number of sample bytes".to_string(),
            ));
        }
        for ch in &channels {
            if ch.channel_index >= header.nchan {
                return Err(FormatError::BadTrackMap(format!(
                    "channel index {} outside the frame's {} channels",
                    ch.channel_index, header.nchan
                )));
            }
        }
        let stream_time = header_time(&header, samples_per_frame, params.sample_rate);
        let n_channels = channels.len();
        let mut extractor = Self {
            source,
            pending,
            channels,
            sinks: vec![BitWriter::new(); n_channels],
            bits_per_sample: header.bits_per_sample,
            sample_rate: params.sample_rate,
            nchan_frame: header.nchan,
            frame_bytes: header.frame_bytes,
            samples_per_frame,
            stream_time,
            drop_until: None,
            expected_next: Vec::new(),
            frame_nr: 0,
            rng: HeaderRng::new(seed),
            eof: false,
        };
        extractor.ingest_frame(&header, &frame)?;
        Ok(extractor)
    }

    fn frames_per_second(&self) -> u64 {
        self.sample_rate / self.samples_per_frame as u64
    }

    /// Absolute frame index of a header (seconds × frames/s + frame#).
    fn absolute_frame_index(&self, header: &VdifHeader) -> u64 {
        header.seconds as u64 * self.frames_per_second() + header.frame_in_second as u64
    }

    /// Extract the configured channels of one frame into the sinks.
    fn ingest_frame(&mut self, header: &VdifHeader, frame: &[u8]) -> Result<(), FormatError> {
        // Continuity policing per thread.
        let index = self.absolute_frame_index(header);
        let fps = self.frames_per_second();
        match self
            .expected_next
            .iter_mut()
            .find(|(t, _)| *t == header.thread_id)
        {
            Some((_, expected)) => {
                if *expected != index {
                    return Err(FormatError::TimecodeJump {
                        frame_nr: self.frame_nr,
                        expected: format!("frame {expected} of thread {}", header.thread_id),
                        decoded: format!("frame {index} (second {}, #{}, {fps} fps)",
                            header.seconds, header.frame_in_second),
                    });
                }
                *expected += 1;
            }
            None => self.expected_next.push((header.thread_id, index + 1)),
        }

        let payload = &frame[HEADER_BYTES..];
        let drop = self
            .drop_until
            .map(|until| {
                let frame_start = header_time(header, self.samples_per_frame, self.sample_rate);
                ((until - frame_start).samples(self.sample_rate)).clamp(0, self.samples_per_frame as i64)
                    as usize
            })
            .unwrap_or(0);
        for (slot, ch) in self.channels.iter().enumerate() {
            if ch.thread_id != header.thread_id {
                continue;
            }
            let sink = &mut self.sinks[slot];
            let bits = self.bits_per_sample as usize;
            for s in drop..self.samples_per_frame {
                if header.invalid {
                    for _ in 0..bits {
                        sink.push_bit(self.rng.next_bit());
                    }
                    continue;
                }
                let bit_off = (s * self.nchan_frame as usize + ch.channel_index as usize) * bits;
                let byte = payload[bit_off / 8];
                let raw = (byte >> (bit_off % 8)) & ((1 << bits) - 1);
                let value = if bits == 2 {
                    OFFSET_TO_INTERNAL[raw as usize]
                } else {
                    raw
                };
                sink.push_bits(value as u64, bits);
            }
        }
        Ok(())
    }

    /// Load and ingest the next frame in stream order.
    fn load_next_frame(&mut self) -> Result<bool, FormatError> {
        let mut frame = vec![0u8; self.frame_bytes];
        let mut filled = 0usize;
        let take = self.pending.len().min(frame.len());
        if take > 0 {
            frame[..take].copy_from_slice(&self.pending[..take]);
            self.pending.drain(..take);
            filled = take;
        }
        while filled < frame.len() {
            let got = self.source.read_into(&mut frame[filled..])?;
            if got == 0 {
                self.eof = true;
                return Ok(false);
            }
            filled += got;
        }
        self.frame_nr += 1;
        let header = decode_header(&frame).ok_or(FormatError::CrcMismatch {
            frame_nr: self.frame_nr,
        })?;
        self.ingest_frame(&header, &frame)?;
        Ok(true)
    }

    /// Samples available in every configured channel.
    fn available(&self) -> usize {
        self.sinks
            .iter()
            .map(|s| s.n_bits() / self.bits_per_sample as usize)
            .min()
            .unwrap_or(0)
    }
}

impl ChannelExtractor for VdifExtractor {
    fn current_time(&self) -> Time {
        self.stream_time
    }

    fn goto_time(&mut self, t: Time) -> Result<(), FormatError> {
        if t < self.stream_time {
            return Err(FormatError::TimeInPast {
                requested: t.date_string(),
                cursor: self.stream_time.date_string(),
            });
        }
        // Every sink's content starts at stream_time; discard the span up
        // to the target from what is buffered, and drop the head of frames
        // still to arrive.
        let ahead_bits = (t - self.stream_time).samples(self.sample_rate) as usize
            * self.bits_per_sample as usize;
        for sink in &mut self.sinks {
            sink.discard_front_bits(ahead_bits);
        }
        self.drop_until = Some(t);
        self.stream_time = t;
        Ok(())
    }

    fn extract(&mut self, n_samples: usize, out: &mut [Vec<u8>]) -> Result<usize, FormatError> {
        while self.available() < n_samples {
            if !self.load_next_frame()? {
                break;
            }
        }
        let produced = self.available().min(n_samples);
        let bits = self.bits_per_sample as usize;
        for (sink, out) in self.sinks.iter_mut().zip(out.iter_mut()) {
            out.extend(sink.drain_front_bytes(produced * bits / 8));
        }
        self.stream_time =
            self.stream_time + TimeDelta::from_samples(produced as i64, self.sample_rate);
        self.drop_until = None;
        Ok(produced)
    }

    fn n_channels(&self) -> usize {
        self.sinks.len()
    }

    fn bits_per_sample(&self) -> u8 {
        self.bits_per_sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::extractor::{unpack_samples, DECODE_2BIT};
    use crate::test_common::vdif::{synthetic_recording, test_params, VdifTestConfig};
    use crate::test_common::MemSource;

    fn default_config() -> VdifTestConfig {
        VdifTestConfig {
            n_threads: 2,
            nchan_per_frame: 2,
            bits_per_sample: 2,
            sample_rate: 16_000_000,
            frame_bytes: 8032,
            // 2016-07-01 epoch (#33), 100 s in.
            ref_epoch: 33,
            seconds: 100,
            garbage_prefix: 0,
        }
    }

    fn build(
        cfg: &VdifTestConfig,
        n_frames_per_thread: usize,
        sample_of: impl Fn(usize, usize) -> u8,
    ) -> VdifExtractor {
        let data = synthetic_recording(cfg, n_frames_per_thread, &sample_of);
        let params = test_params(cfg);
        VdifExtractor::new(Box::new(MemSource::new(data)), &params, 7, 0).unwrap()
    }

    #[test]
    fn test_header_codec_round_trip() {
        let header = VdifHeader {
            seconds: 86_400 * 10 + 3,
            invalid: false,
            frame_in_second: 1_234,
            ref_epoch: 33,
            frame_bytes: 8032,
            nchan: 4,
            bits_per_sample: 2,
            thread_id: 7,
        };
        let bytes = encode_header(&header);
        assert_eq!(decode_header(&bytes), Some(header));
    }

    #[test]
    fn test_epoch_start() {
        // Epoch 33 = 2016-07-01 = MJD 57570.
        assert_eq!(epoch_start(33), Time::from_mjd_seconds(57_570, 0.0));
        // Epoch 0 = 2000-01-01 = MJD 51544.
        assert_eq!(epoch_start(0), Time::from_mjd_seconds(51_544, 0.0));
    }

    #[test]
    fn test_multi_thread_multi_channel_round_trip() {
        let cfg = default_config();
        // 4 logical channels: thread-major (t0c0, t0c1, t1c0, t1c1).
        let sample_of = |c: usize, i: usize| ((i * 3 + 2 * c) % 4) as u8;
        let mut extractor = build(&cfg, 3, sample_of);
        assert_eq!(extractor.n_channels(), 4);
        let spf = (cfg.frame_bytes - HEADER_BYTES) * 8
            / (cfg.nchan_per_frame * cfg.bits_per_sample as usize);
        let n = 2 * spf + 64;
        let mut out = vec![Vec::new(); 4];
        assert_eq!(extractor.extract(n, &mut out).unwrap(), n);
        for (c, packed) in out.iter().enumerate() {
            let samples = unpack_samples(packed, n, 2);
            for (i, &s) in samples.iter().enumerate() {
                assert_eq!(s, DECODE_2BIT[sample_of(c, i) as usize], "ch {c} sample {i}");
            }
        }
    }

    #[test]
    fn test_current_time_from_header() {
        let cfg = default_config();
        let extractor = build(&cfg, 2, |_, _| 0);
        let expected = epoch_start(cfg.ref_epoch) + TimeDelta::from_seconds(cfg.seconds as f64);
        assert_eq!(extractor.current_time(), expected);
    }

    #[test]
    fn test_goto_time_drops_head_samples() {
        let cfg = default_config();
        let sample_of = |c: usize, i: usize| ((i + c) % 4) as u8;
        let mut extractor = build(&cfg, 3, sample_of);
        let start = extractor.current_time();
        let skip = 1000usize;
        extractor
            .goto_time(start + TimeDelta::from_samples(skip as i64, cfg.sample_rate))
            .unwrap();
        let mut out = vec![Vec::new(); 4];
        assert_eq!(extractor.extract(256, &mut out).unwrap(), 256);
        let samples = unpack_samples(&out[1], 256, 2);
        for (k, &s) in samples.iter().enumerate() {
            assert_eq!(s, DECODE_2BIT[sample_of(1, skip + k) as usize]);
        }
    }

    #[test]
    fn test_invalid_frames_filled_with_prng() {
        let cfg = default_config();
        let data = crate::test_common::vdif::synthetic_recording_with_invalid(
            &cfg,
            3,
            &|_, _| 2,
            &[1],
        );
        let params = test_params(&cfg);
        let mut extractor =
            VdifExtractor::new(Box::new(MemSource::new(data)), &params, 7, 0).unwrap();
        let spf = (cfg.frame_bytes - HEADER_BYTES) * 8
            / (cfg.nchan_per_frame * cfg.bits_per_sample as usize);
        let mut out = vec![Vec::new(); 4];
        assert_eq!(extractor.extract(3 * spf, &mut out).unwrap(), 3 * spf);
        let samples = unpack_samples(&out[0], 3 * spf, 2);
        // Frames 0 and 2 carry the constant value; frame 1 was invalid and
        // must not.
        assert!(samples[..spf].iter().all(|&s| s == 1.0));
        assert!(samples[2 * spf..].iter().all(|&s| s == 1.0));
        assert!(samples[spf..2 * spf].iter().any(|&s| s != 1.0));
    }

    #[test]
    fn test_dropped_frame_is_a_timecode_jump() {
        let cfg = default_config();
        let mut data = synthetic_recording(&cfg, 4, &|_, _| 0);
        // Remove thread 0's second frame (frame set 1 starts after 2 frames).
        let start = 2 * cfg.frame_bytes;
        data.drain(start..start + cfg.frame_bytes);
        let params = test_params(&cfg);
        let mut extractor =
            VdifExtractor::new(Box::new(MemSource::new(data)), &params, 7, 0).unwrap();
        let spf = (cfg.frame_bytes - HEADER_BYTES) * 8
            / (cfg.nchan_per_frame * cfg.bits_per_sample as usize);
        let mut out = vec![Vec::new(); 4];
        assert!(matches!(
            extractor.extract(3 * spf, &mut out),
            Err(FormatError::TimecodeJump { .. })
        ));
    }

    #[test]
    fn test_garbage_prefix_scan() {
        let mut cfg = default_config();
        cfg.garbage_prefix = 4321;
        let extractor = build(&cfg, 2, |_, _| 0);
        let expected = epoch_start(cfg.ref_epoch) + TimeDelta::from_seconds(cfg.seconds as f64);
        assert_eq!(extractor.current_time(), expected);
    }
}
