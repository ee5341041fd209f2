//! Mark5B recordings: 32 parallel bitstreams, framed.
//!
//! A frame is a 16-byte header plus 10000 bytes of payload. Each payload
//! word is one time sample of all 32 bitstreams, so a frame carries 2500
//! samples per channel and the frame number within the second (from the
//! header) gives sub-second timestamps. The header carries the sync word
//! `0xABADDEED`, a VLBA-style BCD timecode (truncated MJD + seconds of
//! day + fractional seconds) and a CRC-16 over the timecode.
//!
//! Unlike Mark4/VLBA, the header is not part of the sample stream, so
//! nothing is replaced with pseudo-random bits.

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use crate::msg::InputNodeParameters;
use crate::time::{Time, TimeDelta};
use crate::vex::DataFormat;

use super::super::reader::ByteSource;
use super::demux::{make_demux, BitDemux, BitWriter, ChannelLayout};
use super::{crc16, ChannelExtractor, FormatError, TrackStats, MAX_SYNC_SCAN_FRAMES};

/// The Mark5B sync word.
pub const SYNC_WORD: u32 = 0xABAD_DEED;

/// Header bytes per frame.
pub const HEADER_BYTES: usize = 16;

/// Payload bytes per frame.
pub const PAYLOAD_BYTES: usize = 10_000;

/// Payload words (= samples per channel) per frame.
pub const FRAME_SAMPLES: usize = PAYLOAD_BYTES / 4;

/// Total frame bytes.
pub const FRAME_BYTES: usize = HEADER_BYTES + PAYLOAD_BYTES;

/// Decoded header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame number within the second
    pub frame_in_second: u32,
    /// Truncated MJD (3 digits)
    pub mjd_mod_1000: u32,
    /// Seconds of day
    pub seconds: u32,
    /// Fractional seconds in 0.1 ms units
    pub tenth_ms: u32,
}

fn bcd(value: u32, digits: u32) -> u32 {
    let mut out = 0u32;
    let mut v = value;
    for i in 0..digits {
        out |= (v % 10) << (4 * i);
        v /= 10;
    }
    out
}

fn unbcd(field: u32, digits: u32) -> u32 {
    let mut out = 0u32;
    for i in (0..digits).rev() {
        out = out * 10 + ((field >> (4 * i)) & 0xF);
    }
    out
}

/// Encode a header; the inverse of [`decode_header`]. Used by the
/// synthetic-recording generator and kept here so the two always agree.
pub fn encode_header(header: &FrameHeader) -> [u8; HEADER_BYTES] {
    let mut out = [0u8; HEADER_BYTES];
    LittleEndian::write_u32(&mut out[0..4], SYNC_WORD);
    LittleEndian::write_u32(&mut out[4..8], header.frame_in_second & 0x7FFF);
    let w2 = (bcd(header.mjd_mod_1000, 3) << 20) | bcd(header.seconds, 5);
    LittleEndian::write_u32(&mut out[8..12], w2);
    let frac = bcd(header.tenth_ms, 4) as u16;
    let mut crc_input = [0u8; 6];
    crc_input[..4].copy_from_slice(&out[8..12]);
    LittleEndian::write_u16(&mut crc_input[4..6], frac);
    let crc = crc16(&crc_input);
    LittleEndian::write_u32(&mut out[12..16], ((frac as u32) << 16) | crc as u32);
    out
}

/// Decode and CRC-check a header. `None` when the sync word or CRC is bad.
pub fn decode_header(bytes: &[u8]) -> Option<FrameHeader> {
    if LittleEndian::read_u32(&bytes[0..4]) != SYNC_WORD {
        return None;
    }
    let w1 = LittleEndian::read_u32(&bytes[4..8]);
    let w2 = LittleEndian::read_u32(&bytes[8..12]);
    let w3 = LittleEndian::read_u32(&bytes[12..16]);
    let frac = (w3 >> 16) as u16;
    let mut crc_input = [0u8; 6];
    crc_input[..4].copy_from_slice(&bytes[8..12]);
    LittleEndian::write_u16(&mut crc_input[4..6], frac);
    if crc16(&crc_input) != (w3 & 0xFFFF) as u16 {
        return None;
    }
    Some(FrameHeader {
        frame_in_second: w1 & 0x7FFF,
        mjd_mod_1000: unbcd(w2 >> 20, 3),
        seconds: unbcd(w2 & 0xF_FFFF, 5),
        tenth_ms: unbcd(frac as u32, 4),
    })
}

/// The time a header encodes, with the truncated MJD resolved against a
/// reference date.
pub fn header_time(header: &FrameHeader, ref_time: Time) -> Time {
    let ref_mjd = ref_time.mjd();
    let base = ref_mjd - ref_mjd.rem_euclid(1000) + header.mjd_mod_1000 as i64;
    let mjd = [base - 1000, base, base + 1000]
        .into_iter()
        .min_by_key(|m| (m - ref_mjd).abs())
        .unwrap();
    Time::from_mjd_seconds(mjd, 0.0)
        + TimeDelta::from_usec(header.seconds as i64 * 1_000_000 + header.tenth_ms as i64 * 100)
}

pub struct Mark5bExtractor {
    source: Box<dyn ByteSource + Send>,
    pending: Vec<u8>,
    frame: Vec<u8>,
    /// Sample (= payload word) position of the cursor within the frame
    cursor: usize,
    demux: Box<dyn BitDemux>,
    sinks: Vec<BitWriter>,
    bits_per_sample: u8,
    sample_rate: u64,
    ref_time: Time,
    anchor_time: Time,
    frame_nr: u64,
    stats: TrackStats,
    check_interval: u32,
    eof: bool,
}

impl Mark5bExtractor {
    pub fn new(
        mut source: Box<dyn ByteSource + Send>,
        params: &InputNodeParameters,
        _seed: u32,
        check_interval: u32,
    ) -> Result<Self, FormatError> {
        let mut layouts: Vec<ChannelLayout> = Vec::with_capacity(params.channels.len());
        for channel in &params.channels {
            let mut layout = ChannelLayout::new();
            if params.bits_per_sample > 1 {
                for (&magn, &sign) in channel.magnitude_tracks.iter().zip(&channel.sign_tracks) {
                    layout.push(magn);
                    layout.push(sign);
                }
            } else {
                layout.extend_from_slice(&channel.sign_tracks);
            }
            for &bit in &layout {
                if bit >= 32 {
                    return Err(FormatError::BadTrackMap(format!(
                        "bitstream {bit} outside the 32-bit word"
                    )));
                }
            }
            layouts.push(layout);
        }

        // Scan for the first frame whose sync and CRC both check out.
        let scan_limit = MAX_SYNC_SCAN_FRAMES * FRAME_BYTES;
        let mut buf = Vec::new();
        let mut pos = 0usize;
        let (frame, pending) = loop {
            while buf.len() < pos + FRAME_BYTES {
                let old_len = buf.len();
                if old_len >= scan_limit {
                    return Err(FormatError::SyncNotFound {
                        format: DataFormat::Mark5b,
                        scanned: old_len,
                    });
                }
                buf.resize(old_len + FRAME_BYTES, 0);
                let got = source.read_into(&mut buf[old_len..])?;
                buf.truncate(old_len + got);
                if got == 0 {
                    return Err(FormatError::SyncNotFound {
                        format: DataFormat::Mark5b,
                        scanned: buf.len(),
                    });
                }
            }
            if decode_header(&buf[pos..pos + HEADER_BYTES]).is_some() {
                break (
                    buf[pos..pos + FRAME_BYTES].to_vec(),
                    buf[pos + FRAME_BYTES..].to_vec(),
                );
            }
            pos += 1;
        };

        let header = decode_header(&frame[..HEADER_BYTES]).unwrap();
        let second_start = header_time(&header, params.ref_time);
        let frame_duration = TimeDelta::from_samples(FRAME_SAMPLES as i64, params.sample_rate);
        let anchor_time = second_start + frame_duration * header.frame_in_second as i64;

        Ok(Self {
            source,
            pending,
            frame,
            cursor: 0,
            demux: make_demux::<u32>(layouts),
            sinks: vec![BitWriter::new(); params.channels.len()],
            bits_per_sample: params.bits_per_sample,
            sample_rate: params.sample_rate,
            ref_time: params.ref_time,
            anchor_time,
            frame_nr: 0,
            stats: TrackStats::new(32),
            check_interval,
            eof: false,
        })
    }

    fn frame_duration(&self) -> TimeDelta {
        TimeDelta::from_samples(FRAME_SAMPLES as i64, self.sample_rate)
    }

    fn frame_time(&self) -> Time {
        self.anchor_time + self.frame_duration() * self.frame_nr as i64
    }

    fn fill_frame(&mut self) -> Result<usize, FormatError> {
        let mut filled = 0usize;
        let take = self.pending.len().min(self.frame.len());
        if take > 0 {
            self.frame[..take].copy_from_slice(&self.pending[..take]);
            self.pending.drain(..take);
            filled = take;
        }
        while filled < self.frame.len() {
            let got = self.source.read_into(&mut self.frame[filled..])?;
            if got == 0 {
                break;
            }
            filled += got;
        }
        Ok(filled)
    }

    fn load_next_frame(&mut self) -> Result<bool, FormatError> {
        let filled = self.fill_frame()?;
        if filled < self.frame.len() {
            self.eof = true;
            return Ok(false);
        }
        self.frame_nr += 1;
        self.cursor = 0;
        // The sync word is checked on every frame; the full header only
        // periodically.
        if LittleEndian::read_u32(&self.frame[0..4]) != SYNC_WORD {
            return Err(FormatError::CrcMismatch {
                frame_nr: self.frame_nr,
            });
        }
        if self.check_interval > 0 && self.frame_nr % self.check_interval as u64 == 0 {
            self.validate_frame()?;
        }
        Ok(true)
    }

    fn validate_frame(&mut self) -> Result<(), FormatError> {
        let Some(header) = decode_header(&self.frame[..HEADER_BYTES]) else {
            return Err(FormatError::CrcMismatch {
                frame_nr: self.frame_nr,
            });
        };
        let second_start = header_time(&header, self.ref_time);
        let decoded = second_start + self.frame_duration() * header.frame_in_second as i64;
        let expected = self.frame_time();
        let skew = expected - decoded;
        let tolerance = TimeDelta::from_usec(100);
        if skew > tolerance || -skew > tolerance {
            return Err(FormatError::TimecodeJump {
                frame_nr: self.frame_nr,
                expected: expected.date_string(),
                decoded: decoded.date_string(),
            });
        }
        self.stats.reset();
        for word in self.frame[HEADER_BYTES..].chunks_exact(4) {
            self.stats.record(LittleEndian::read_u32(word));
        }
        for (bit, freq) in self.stats.out_of_range() {
            warn!(
                "frame {}: bitstream {bit} frequency {freq:.3} outside [0.45, 0.55]",
                self.frame_nr
            );
        }
        Ok(())
    }

    fn flush_sinks(&mut self, out: &mut [Vec<u8>]) {
        for (sink, out) in self.sinks.iter_mut().zip(out.iter_mut()) {
            out.extend(sink.drain_whole_bytes());
        }
    }
}

impl ChannelExtractor for Mark5bExtractor {
    fn current_time(&self) -> Time {
        self.frame_time()
    }

    fn goto_time(&mut self, t: Time) -> Result<(), FormatError> {
        let cursor_time =
            self.frame_time() + TimeDelta::from_samples(self.cursor as i64, self.sample_rate);
        if t < cursor_time {
            return Err(FormatError::TimeInPast {
                requested: t.date_string(),
                cursor: cursor_time.date_string(),
            });
        }
        let frames_ahead = (t - self.frame_time()).div_floor(self.frame_duration());
        if frames_ahead > 1 {
            let to_skip = (frames_ahead - 1) as u64 * FRAME_BYTES as u64;
            let from_pending = self.pending.len().min(to_skip as usize);
            self.pending.drain(..from_pending);
            let remaining = to_skip - from_pending as u64;
            if self.source.skip(remaining)? < remaining {
                self.eof = true;
                return Ok(());
            }
            self.frame_nr += (frames_ahead - 1) as u64;
            if !self.load_next_frame()? {
                return Ok(());
            }
        } else if frames_ahead == 1 && !self.load_next_frame()? {
            return Ok(());
        }
        self.cursor = (t - self.frame_time()).samples(self.sample_rate) as usize;
        Ok(())
    }

    fn extract(&mut self, n_samples: usize, out: &mut [Vec<u8>]) -> Result<usize, FormatError> {
        let mut produced = 0usize;
        while produced < n_samples {
            if self.cursor == FRAME_SAMPLES && !self.load_next_frame()? {
                break;
            }
            let words = (FRAME_SAMPLES - self.cursor).min(n_samples - produced);
            let start = HEADER_BYTES + self.cursor * 4;
            self.demux
                .demux(&self.frame[start..start + words * 4], &mut self.sinks);
            self.cursor += words;
            produced += words;
        }
        self.flush_sinks(out);
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
    use crate::test_common::mark5b::{synthetic_recording, test_params, Mark5bTestConfig};
    use crate::test_common::MemSource;

    fn default_config() -> Mark5bTestConfig {
        Mark5bTestConfig {
            n_channels: 2,
            bits_per_sample: 2,
            sample_rate: 32_000_000,
            start: Time::from_mjd_seconds(57203, 43200.0),
            garbage_prefix: 0,
        }
    }

    fn build(
        cfg: &Mark5bTestConfig,
        n_frames: usize,
        sample_of: impl Fn(usize, usize) -> u8,
    ) -> Mark5bExtractor {
        let data = synthetic_recording(cfg, n_frames, &sample_of);
        let params = test_params(cfg);
        Mark5bExtractor::new(Box::new(MemSource::new(data)), &params, 7, 64).unwrap()
    }

    #[test]
    fn test_header_codec_round_trip() {
        let header = FrameHeader {
            frame_in_second: 12_345,
            mjd_mod_1000: 203,
            seconds: 43_200,
            tenth_ms: 9_876,
        };
        let bytes = encode_header(&header);
        assert_eq!(decode_header(&bytes), Some(header));
        // A flipped timecode bit must fail the CRC.
        let mut corrupt = bytes;
        corrupt[9] ^= 0x10;
        assert_eq!(decode_header(&corrupt), None);
    }

    #[test]
    fn test_sync_scan_with_garbage_prefix() {
        let mut cfg = default_config();
        cfg.garbage_prefix = 777;
        let extractor = build(&cfg, 2, |_, _| 0);
        assert_eq!(extractor.current_time(), cfg.start);
    }

    #[test]
    fn test_round_trip_samples() {
        let cfg = default_config();
        let sample_of = |c: usize, i: usize| ((i * 5 + c) % 4) as u8;
        let mut extractor = build(&cfg, 3, sample_of);
        let n = 2 * FRAME_SAMPLES + 100;
        let mut out = vec![Vec::new(), Vec::new()];
        assert_eq!(extractor.extract(n, &mut out).unwrap(), n);
        for (c, packed) in out.iter().enumerate() {
            let samples = unpack_samples(packed, n, 2);
            for (i, &s) in samples.iter().enumerate() {
                assert_eq!(s, DECODE_2BIT[sample_of(c, i) as usize], "ch {c} sample {i}");
            }
        }
    }

    #[test]
    fn test_frame_number_gives_subsecond_time() {
        let cfg = default_config();
        // Start mid-second: second 43200 + frame 640 of 12800.
        let data = {
            let mut shifted = cfg.clone();
            shifted.start = cfg.start + TimeDelta::from_samples(640 * FRAME_SAMPLES as i64, cfg.sample_rate);
            synthetic_recording(&shifted, 2, &|_, _| 0)
        };
        let params = test_params(&cfg);
        let extractor =
            Mark5bExtractor::new(Box::new(MemSource::new(data)), &params, 7, 64).unwrap();
        let expected =
            cfg.start + TimeDelta::from_samples(640 * FRAME_SAMPLES as i64, cfg.sample_rate);
        assert_eq!(extractor.current_time(), expected);
    }

    #[test]
    fn test_goto_time_mid_frame() {
        let cfg = default_config();
        let sample_of = |c: usize, i: usize| ((i + 2 * c) % 4) as u8;
        let mut extractor = build(&cfg, 4, sample_of);
        let target_sample = 3 * FRAME_SAMPLES + 17;
        let target = cfg.start + TimeDelta::from_samples(target_sample as i64, cfg.sample_rate);
        extractor.goto_time(target).unwrap();
        let mut out = vec![Vec::new(), Vec::new()];
        assert_eq!(extractor.extract(256, &mut out).unwrap(), 256);
        let samples = unpack_samples(&out[0], 256, 2);
        for (k, &s) in samples.iter().enumerate() {
            assert_eq!(s, DECODE_2BIT[sample_of(0, target_sample + k) as usize]);
        }
    }

    #[test]
    fn test_short_recording_reports_produced() {
        let cfg = default_config();
        let mut extractor = build(&cfg, 2, |_, _| 1);
        let mut out = vec![Vec::new(), Vec::new()];
        let got = extractor.extract(5 * FRAME_SAMPLES, &mut out).unwrap();
        assert_eq!(got, 2 * FRAME_SAMPLES);
        assert_eq!(out[0].len(), 2 * FRAME_SAMPLES / 4);
    }

    #[test]
    fn test_all_sync_broken_fails() {
        let cfg = default_config();
        let mut data = synthetic_recording(&cfg, 2, &|_, _| 0);
        data[0] ^= 0xFF;
        data[FRAME_BYTES] ^= 0xFF;
        // Corrupting both sync words leaves nothing to lock on to within
        // the two-frame recording.
        let params = test_params(&cfg);
        assert!(matches!(
            Mark5bExtractor::new(Box::new(MemSource::new(data)), &params, 7, 64),
            Err(FormatError::SyncNotFound { .. })
        ));
    }
}
