//! Mark4 and VLBA track-interleaved recordings.
//!
//! A frame is a fixed number of word positions; one word carries one bit of
//! every track, so the word width equals the track count (8, 16, 32 or 64).
//! The header occupies the first word positions of each frame: an auxiliary
//! field (Mark4 only), a sync word of all-ones positions, and a BCD
//! timecode with a per-track CRC-12. The sync scan identifies the track
//! count from the length of the all-ones run: 32 positions × (tracks/8)
//! bytes.
//!
//! The implementation is monomorphised over the word width via
//! [`TrackWord`], so the per-word loops see a compile-time width; the
//! constructor picks the variant the sync scan implies.

use chrono::{Datelike, NaiveDate};
use log::warn;

use crate::msg::InputNodeParameters;
use crate::time::{Time, TimeDelta};
use crate::vex::DataFormat;

use super::super::reader::ByteSource;
use super::demux::{make_demux, BitDemux, BitWriter, ChannelLayout};
use super::{crc12, ChannelExtractor, FormatError, HeaderRng, TrackStats, TrackWord,
            MAX_SYNC_SCAN_FRAMES};

/// Mark4 or VLBA frame geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeFlavour {
    Mark4,
    Vlba,
}

impl TapeFlavour {
    /// Word positions per frame.
    pub fn frame_words(self) -> usize {
        match self {
            TapeFlavour::Mark4 => 2500,
            TapeFlavour::Vlba => 2520,
        }
    }

    /// Auxiliary word positions before the sync word.
    fn pre_sync_words(self) -> usize {
        match self {
            TapeFlavour::Mark4 => 64,
            TapeFlavour::Vlba => 0,
        }
    }

    /// Word positions of the sync word.
    const SYNC_WORDS: usize = 32;

    /// Word positions of the timecode + CRC.
    const TIME_WORDS: usize = 64;

    /// Header word positions (the region whose samples are not real data).
    pub fn header_words(self) -> usize {
        self.pre_sync_words() + Self::SYNC_WORDS + Self::TIME_WORDS
    }

    fn format(self) -> DataFormat {
        match self {
            TapeFlavour::Mark4 => DataFormat::Mark4,
            TapeFlavour::Vlba => DataFormat::Vlba,
        }
    }
}

fn mjd_of_yday(year: i32, doy: u32) -> Option<i64> {
    let date = NaiveDate::from_yo_opt(year, doy)?;
    Some(date.num_days_from_ce() as i64 - 678_576)
}

/// Read the bit of `track` at word position `pos`.
#[inline]
fn track_bit<W: TrackWord>(frame: &[u8], pos: usize, track: u32) -> u8 {
    W::from_le_slice(&frame[pos * W::BYTES..pos * W::BYTES + W::BYTES]).bit(track)
}

/// Decode 13 BCD digits, MSB-first within each digit, from one track.
fn decode_digits<W: TrackWord>(frame: &[u8], time0: usize, track: u32) -> [u8; 13] {
    let mut digits = [0u8; 13];
    for (i, digit) in digits.iter_mut().enumerate() {
        for b in 0..4 {
            *digit = (*digit << 1) | track_bit::<W>(frame, time0 + 4 * i + b, track);
        }
    }
    digits
}

/// CRC-12 of the timecode bits of one track against the stored value.
fn timecode_crc_ok<W: TrackWord>(frame: &[u8], flavour: TapeFlavour, track: u32) -> bool {
    let time0 = flavour.pre_sync_words() + TapeFlavour::SYNC_WORDS;
    let message = (0..52).map(|i| track_bit::<W>(frame, time0 + i, track));
    let computed = crc12(message);
    let mut stored: u16 = 0;
    for i in 0..12 {
        stored = (stored << 1) | track_bit::<W>(frame, time0 + 52 + i, track) as u16;
    }
    computed == stored
}

/// Decode the header timecode of one track. The truncated fields (one year
/// digit for Mark4, MJD mod 1000 for VLBA) resolve against `ref_time`.
fn decode_timecode<W: TrackWord>(
    frame: &[u8],
    flavour: TapeFlavour,
    track: u32,
    ref_time: Time,
) -> Time {
    let time0 = flavour.pre_sync_words() + TapeFlavour::SYNC_WORDS;
    let d = decode_digits::<W>(frame, time0, track);
    match flavour {
        TapeFlavour::Mark4 => {
            let (ref_year, _) = ref_time.year_day();
            let decade = ref_year - ref_year.rem_euclid(10);
            // Nearest year with the decoded unit digit.
            let year = [decade - 10, decade, decade + 10]
                .into_iter()
                .map(|base| base + d[0] as i32)
                .min_by_key(|y| (y - ref_year).abs())
                .unwrap();
            let doy = d[1] as u32 * 100 + d[2] as u32 * 10 + d[3] as u32;
            let seconds = (d[4] as i64 * 10 + d[5] as i64) * 3600
                + (d[6] as i64 * 10 + d[7] as i64) * 60
                + d[8] as i64 * 10
                + d[9] as i64;
            let millis = d[10] as i64 * 100 + d[11] as i64 * 10 + d[12] as i64;
            let mjd = mjd_of_yday(year, doy).unwrap_or(0);
            Time::from_mjd_seconds(mjd, 0.0)
                + TimeDelta::from_usec(seconds * 1_000_000 + millis * 1000)
        }
        TapeFlavour::Vlba => {
            let truncated = d[0] as i64 * 100 + d[1] as i64 * 10 + d[2] as i64;
            let ref_mjd = ref_time.mjd();
            // Nearest MJD with the decoded low three digits.
            let base = ref_mjd - ref_mjd.rem_euclid(1000) + truncated;
            let mjd = [base - 1000, base, base + 1000]
                .into_iter()
                .min_by_key(|m| (m - ref_mjd).abs())
                .unwrap();
            let seconds = d[3] as i64 * 10_000
                + d[4] as i64 * 1000
                + d[5] as i64 * 100
                + d[6] as i64 * 10
                + d[7] as i64;
            // Fractional part in units of 0.1 ms.
            let tenth_ms =
                d[8] as i64 * 1000 + d[9] as i64 * 100 + d[10] as i64 * 10 + d[11] as i64;
            Time::from_mjd_seconds(mjd, 0.0)
                + TimeDelta::from_usec(seconds * 1_000_000 + tenth_ms * 100)
        }
    }
}

/// Scan result: word width in bytes, the first full frame, and bytes read
/// beyond it.
struct SyncScan {
    word_bytes: usize,
    frame: Vec<u8>,
    pending: Vec<u8>,
}

/// Locate a frame header by its all-ones sync run, validating the CRC
/// before accepting. The run length identifies the track count.
fn find_header(
    source: &mut dyn ByteSource,
    flavour: TapeFlavour,
) -> Result<SyncScan, FormatError> {
    let frame_words = flavour.frame_words();
    let scan_limit = MAX_SYNC_SCAN_FRAMES * frame_words * 8;
    let mut buf: Vec<u8> = Vec::new();
    let mut ones_run = 0usize;
    let mut scanned = 0usize;

    loop {
        // Top the buffer up one max-width frame at a time.
        let old_len = buf.len();
        buf.resize(old_len + frame_words * 8, 0);
        let got = source.read_into(&mut buf[old_len..])?;
        buf.truncate(old_len + got);
        if got == 0 {
            return Err(FormatError::SyncNotFound {
                format: flavour.format(),
                scanned,
            });
        }

        while scanned < buf.len() {
            let byte = buf[scanned];
            scanned += 1;
            if byte == 0xFF {
                ones_run += 1;
                continue;
            }
            if ones_run > 0 && ones_run % TapeFlavour::SYNC_WORDS == 0 {
                let word_bytes = ones_run / TapeFlavour::SYNC_WORDS;
                if matches!(word_bytes, 1 | 2 | 4 | 8) {
                    let run_start = scanned - 1 - ones_run;
                    let header_start = run_start as i64
                        - (flavour.pre_sync_words() * word_bytes) as i64;
                    if header_start >= 0 {
                        let header_start = header_start as usize;
                        let frame_bytes = frame_words * word_bytes;
                        // Pull in the rest of the candidate frame if needed.
                        while buf.len() < header_start + frame_bytes {
                            let old_len = buf.len();
                            buf.resize(header_start + frame_bytes, 0);
                            let got = source.read_into(&mut buf[old_len..])?;
                            buf.truncate(old_len + got);
                            if got == 0 {
                                return Err(FormatError::SyncNotFound {
                                    format: flavour.format(),
                                    scanned,
                                });
                            }
                        }
                        let frame = &buf[header_start..header_start + frame_bytes];
                        let crc_ok = match word_bytes {
                            1 => timecode_crc_ok::<u8>(frame, flavour, 0),
                            2 => timecode_crc_ok::<u16>(frame, flavour, 0),
                            4 => timecode_crc_ok::<u32>(frame, flavour, 0),
                            8 => timecode_crc_ok::<u64>(frame, flavour, 0),
                            _ => unreachable!(),
                        };
                        if crc_ok {
                            return Ok(SyncScan {
                                word_bytes,
                                frame: frame.to_vec(),
                                pending: buf[header_start + frame_bytes..].to_vec(),
                            });
                        }
                    }
                }
            }
            ones_run = 0;
        }

        if scanned >= scan_limit {
            return Err(FormatError::SyncNotFound {
                format: flavour.format(),
                scanned,
            });
        }
    }
}

/// The Mark4/VLBA extractor; a constructor namespace that picks the
/// width-specialised implementation the sync scan implies.
pub struct Mark4Extractor;

impl Mark4Extractor {
    pub fn new(
        mut source: Box<dyn ByteSource + Send>,
        params: &InputNodeParameters,
        flavour: TapeFlavour,
        seed: u32,
        check_interval: u32,
    ) -> Result<Box<dyn ChannelExtractor>, FormatError> {
        let scan = find_header(source.as_mut(), flavour)?;
        match scan.word_bytes {
            1 => Ok(Box::new(Mark4Impl::<u8>::new(source, scan, params, flavour, seed, check_interval)?)),
            2 => Ok(Box::new(Mark4Impl::<u16>::new(source, scan, params, flavour, seed, check_interval)?)),
            4 => Ok(Box::new(Mark4Impl::<u32>::new(source, scan, params, flavour, seed, check_interval)?)),
            8 => Ok(Box::new(Mark4Impl::<u64>::new(source, scan, params, flavour, seed, check_interval)?)),
            n => Err(FormatError::UnsupportedTrackCount(n as u32 * 8)),
        }
    }
}

struct Mark4Impl<W: TrackWord> {
    source: Box<dyn ByteSource + Send>,
    /// Bytes scanned past the first frame, consumed before the source
    pending: Vec<u8>,
    flavour: TapeFlavour,
    frame: Vec<u8>,
    /// Word position of the read cursor within the frame
    cursor: usize,
    /// Samples already taken from the cursor word (mid-word starts)
    subsample: usize,
    demux: Box<dyn BitDemux>,
    layouts: Vec<ChannelLayout>,
    sinks: Vec<BitWriter>,
    fan_out: usize,
    bits_per_sample: u8,
    sample_rate: u64,
    randomise_headers: bool,
    ref_time: Time,
    /// Timecode of the first frame; later frames are anchored by count
    anchor_time: Time,
    frame_nr: u64,
    rng: HeaderRng,
    stats: TrackStats,
    check_interval: u32,
    eof: bool,
    _word: std::marker::PhantomData<W>,
}

impl<W: TrackWord> Mark4Impl<W> {
    fn new(
        source: Box<dyn ByteSource + Send>,
        scan: SyncScan,
        params: &InputNodeParameters,
        flavour: TapeFlavour,
        seed: u32,
        check_interval: u32,
    ) -> Result<Self, FormatError> {
        let mut layouts = Vec::with_capacity(params.channels.len());
        let mut fan_out = None;
        for channel in &params.channels {
            let mut layout = ChannelLayout::new();
            if params.bits_per_sample > 1 {
                if channel.magnitude_tracks.len() != channel.sign_tracks.len() {
                    return Err(FormatError::BadTrackMap(format!(
                        "channel {} has {} sign but {} magnitude tracks",
                        channel.channel_name,
                        channel.sign_tracks.len(),
                        channel.magnitude_tracks.len()
                    )));
                }
                for (&magn, &sign) in channel.magnitude_tracks.iter().zip(&channel.sign_tracks) {
                    layout.push(magn);
                    layout.push(sign);
                }
            } else {
                layout.extend_from_slice(&channel.sign_tracks);
            }
            for &track in &layout {
                if track >= W::BITS {
                    return Err(FormatError::BadTrackMap(format!(
                        "track {track} outside the {}-track word",
                        W::BITS
                    )));
                }
            }
            match fan_out {
                None => fan_out = Some(channel.sign_tracks.len()),
                Some(f) if f == channel.sign_tracks.len() => {}
                Some(f) => {
                    return Err(FormatError::BadTrackMap(format!(
                        "mixed fan-out: {} vs {f}",
                        channel.sign_tracks.len()
                    )))
                }
            }
            layouts.push(layout);
        }
        let fan_out = fan_out.unwrap_or(1);
        let anchor_time = decode_timecode::<W>(&scan.frame, flavour, 0, params.ref_time);
        let n_channels = layouts.len();
        Ok(Self {
            source,
            pending: scan.pending,
            flavour,
            frame: scan.frame,
            cursor: 0,
            subsample: 0,
            demux: make_demux::<W>(layouts.clone()),
            layouts,
            sinks: vec![BitWriter::new(); n_channels],
            fan_out,
            bits_per_sample: params.bits_per_sample,
            sample_rate: params.sample_rate,
            randomise_headers: params.randomise_headers,
            ref_time: params.ref_time,
            anchor_time,
            frame_nr: 0,
            rng: HeaderRng::new(seed),
            stats: TrackStats::new(W::BITS as usize),
            check_interval,
            eof: false,
            _word: std::marker::PhantomData,
        })
    }

    fn frame_duration(&self) -> TimeDelta {
        TimeDelta::from_samples(
            (self.flavour.frame_words() * self.fan_out) as i64,
            self.sample_rate,
        )
    }

    fn frame_time(&self) -> Time {
        self.anchor_time + self.frame_duration() * self.frame_nr as i64
    }

    /// Samples per channel from frame start to the cursor.
    fn cursor_samples(&self) -> usize {
        self.cursor * self.fan_out + self.subsample
    }

    fn fill_frame(&mut self, buf_off: usize) -> Result<usize, FormatError> {
        let mut filled = buf_off;
        let take = self.pending.len().min(self.frame.len() - filled);
        if take > 0 {
            self.frame[filled..filled + take].copy_from_slice(&self.pending[..take]);
            self.pending.drain(..take);
            filled += take;
        }
        while filled < self.frame.len() {
            let got = {
                let frame = &mut self.frame[filled..];
                self.source.read_into(frame)?
            };
            if got == 0 {
                break;
            }
            filled += got;
        }
        Ok(filled)
    }

    /// Advance to the next frame; false at end of data. Periodically
    /// re-validates the header.
    fn load_next_frame(&mut self) -> Result<bool, FormatError> {
        let filled = self.fill_frame(0)?;
        if filled < self.frame.len() {
            self.eof = true;
            return Ok(false);
        }
        self.frame_nr += 1;
        self.cursor = 0;
        self.subsample = 0;
        if self.check_interval > 0 && self.frame_nr % self.check_interval as u64 == 0 {
            self.validate_frame()?;
        }
        Ok(true)
    }

    fn validate_frame(&mut self) -> Result<(), FormatError> {
        let sync0 = self.flavour.pre_sync_words();
        for pos in sync0..sync0 + TapeFlavour::SYNC_WORDS {
            let word = W::from_le_slice(&self.frame[pos * W::BYTES..(pos + 1) * W::BYTES]);
            if !word.all_ones() {
                return Err(FormatError::CrcMismatch {
                    frame_nr: self.frame_nr,
                });
            }
        }
        if !timecode_crc_ok::<W>(&self.frame, self.flavour, 0) {
            return Err(FormatError::CrcMismatch {
                frame_nr: self.frame_nr,
            });
        }
        let decoded = decode_timecode::<W>(&self.frame, self.flavour, 0, self.ref_time);
        let expected = self.frame_time();
        // The timecode truncates below a millisecond (0.1 ms for VLBA).
        let tolerance = TimeDelta::from_usec(1000);
        let skew = expected - decoded;
        if skew > tolerance || -skew > tolerance {
            return Err(FormatError::TimecodeJump {
                frame_nr: self.frame_nr,
                expected: expected.date_string(),
                decoded: decoded.date_string(),
            });
        }
        // Bit-statistic drift warns but does not abort.
        self.stats.reset();
        for pos in self.flavour.header_words()..self.flavour.frame_words() {
            let word = W::from_le_slice(&self.frame[pos * W::BYTES..(pos + 1) * W::BYTES]);
            self.stats.record(word);
        }
        for (track, freq) in self.stats.out_of_range() {
            warn!(
                "frame {}: track {track} bit frequency {freq:.3} outside [0.45, 0.55]",
                self.frame_nr
            );
        }
        Ok(())
    }

    /// One sample per channel from the cursor position, the slow path for
    /// header words and mid-word starts.
    fn extract_one(&mut self) {
        let in_header = self.cursor < self.flavour.header_words();
        let word =
            W::from_le_slice(&self.frame[self.cursor * W::BYTES..(self.cursor + 1) * W::BYTES]);
        for (layout, sink) in self.layouts.iter().zip(self.sinks.iter_mut()) {
            if in_header && self.randomise_headers {
                for _ in 0..self.bits_per_sample {
                    sink.push_bit(self.rng.next_bit());
                }
            } else {
                let base = self.subsample * self.bits_per_sample as usize;
                for i in 0..self.bits_per_sample as usize {
                    sink.push_bit(word.bit(layout[base + i]));
                }
            }
        }
        self.subsample += 1;
        if self.subsample == self.fan_out {
            self.subsample = 0;
            self.cursor += 1;
        }
    }

    fn flush_sinks(&mut self, out: &mut [Vec<u8>]) {
        for (sink, out) in self.sinks.iter_mut().zip(out.iter_mut()) {
            out.extend(sink.drain_whole_bytes());
        }
    }
}

impl<W: TrackWord> ChannelExtractor for Mark4Impl<W> {
    fn current_time(&self) -> Time {
        self.frame_time()
    }

    fn goto_time(&mut self, t: Time) -> Result<(), FormatError> {
        let cursor_time = self.frame_time()
            + TimeDelta::from_samples(self.cursor_samples() as i64, self.sample_rate);
        if t < cursor_time {
            return Err(FormatError::TimeInPast {
                requested: t.date_string(),
                cursor: cursor_time.date_string(),
            });
        }
        // Skip whole frames without extracting; the frame under the target
        // is loaded normally so its header is still policed.
        let frame_duration = self.frame_duration();
        let frames_ahead = (t - self.frame_time()).div_floor(frame_duration);
        if frames_ahead > 1 {
            let to_skip = (frames_ahead - 1) as u64 * self.frame.len() as u64;
            let mut remaining = to_skip;
            let from_pending = self.pending.len().min(remaining as usize);
            self.pending.drain(..from_pending);
            remaining -= from_pending as u64;
            let skipped = self.source.skip(remaining)?;
            if skipped < remaining {
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
        let offset = (t - self.frame_time()).samples(self.sample_rate) as usize;
        self.cursor = offset / self.fan_out;
        self.subsample = offset % self.fan_out;
        Ok(())
    }

    fn extract(&mut self, n_samples: usize, out: &mut [Vec<u8>]) -> Result<usize, FormatError> {
        debug_assert_eq!(out.len(), self.sinks.len());
        let mut produced = 0usize;
        let header_words = self.flavour.header_words();
        let frame_words = self.flavour.frame_words();
        while produced < n_samples {
            if self.cursor == frame_words && !self.load_next_frame()? {
                break;
            }
            let want = n_samples - produced;
            if self.subsample == 0 && self.cursor >= header_words {
                // Data region, word aligned: table-driven bulk demux.
                let words = (frame_words - self.cursor).min(want / self.fan_out);
                if words > 0 {
                    let bytes =
                        &self.frame[self.cursor * W::BYTES..(self.cursor + words) * W::BYTES];
                    self.demux.demux(bytes, &mut self.sinks);
                    self.cursor += words;
                    produced += words * self.fan_out;
                    continue;
                }
            }
            self.extract_one();
            produced += 1;
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
    use crate::input::extractor::unpack_samples;
    use crate::input::reader::ByteSource;
    use crate::test_common::mark4::{synthetic_recording, test_params, Mark4TestConfig};
    use crate::test_common::MemSource;

    fn default_config(n_tracks: u32) -> Mark4TestConfig {
        Mark4TestConfig {
            flavour: TapeFlavour::Mark4,
            n_tracks,
            fan_out: 2,
            bits_per_sample: 2,
            sample_rate: 5_000_000,
            n_channels: 2,
            start: Time::from_mjd_seconds(57203, 43200.0),
            garbage_prefix: 0,
        }
    }

    fn build(
        cfg: &Mark4TestConfig,
        n_frames: usize,
        sample_of: impl Fn(usize, usize) -> u8,
    ) -> (Box<dyn ChannelExtractor>, crate::msg::InputNodeParameters) {
        let data = synthetic_recording(cfg, n_frames, &sample_of);
        let params = test_params(cfg);
        let extractor = Mark4Extractor::new(
            Box::new(MemSource::new(data)),
            &params,
            cfg.flavour,
            7,
            100,
        )
        .unwrap();
        (extractor, params)
    }

    #[test]
    fn test_sync_scan_identifies_track_count() {
        for n_tracks in [8u32, 16, 32, 64] {
            let mut cfg = default_config(n_tracks);
            cfg.garbage_prefix = 1234;
            let (extractor, _) = build(&cfg, 3, |c, i| ((c + i) % 4) as u8);
            assert_eq!(extractor.n_channels(), 2);
            assert_eq!(extractor.current_time(), cfg.start);
        }
    }

    #[test]
    fn test_round_trip_outside_header() {
        let cfg = default_config(16);
        let sample_of = |c: usize, i: usize| ((i * 7 + c * 3 + i / 5) % 4) as u8;
        let (mut extractor, _) = build(&cfg, 3, sample_of);
        let frame_samples = cfg.flavour.frame_words() * cfg.fan_out;
        let mut out = vec![Vec::new(), Vec::new()];
        let got = extractor.extract(frame_samples, &mut out).unwrap();
        assert_eq!(got, frame_samples);
        let header_samples = cfg.flavour.header_words() * cfg.fan_out;
        for (c, packed) in out.iter().enumerate() {
            let samples = unpack_samples(packed, frame_samples, 2);
            for i in header_samples..frame_samples {
                let expected = crate::input::extractor::DECODE_2BIT[sample_of(c, i) as usize];
                assert_eq!(samples[i], expected, "channel {c} sample {i}");
            }
        }
    }

    #[test]
    fn test_header_samples_are_seeded_prng() {
        let cfg = default_config(8);
        let (mut extractor_a, _) = build(&cfg, 2, |_, _| 0);
        let (mut extractor_b, _) = build(&cfg, 2, |_, _| 3);
        let n = cfg.flavour.header_words() * cfg.fan_out;
        let mut out_a = vec![Vec::new(), Vec::new()];
        let mut out_b = vec![Vec::new(), Vec::new()];
        extractor_a.extract(n, &mut out_a).unwrap();
        extractor_b.extract(n, &mut out_b).unwrap();
        // Same seed, same PRNG fill regardless of the underlying bits.
        assert_eq!(out_a, out_b);
        let samples = unpack_samples(&out_a[0], n, 2);
        assert!(samples.iter().any(|&s| s != samples[0]));
    }

    #[test]
    fn test_goto_time_lands_on_sample() {
        let cfg = default_config(16);
        let sample_of = |c: usize, i: usize| ((i + c) % 4) as u8;
        let (mut extractor, _) = build(&cfg, 5, sample_of);
        let frame_samples = cfg.flavour.frame_words() * cfg.fan_out;
        // 2.5 frames in: mid-frame, mid-word.
        let target_sample = frame_samples * 2 + 501;
        let target =
            cfg.start + TimeDelta::from_samples(target_sample as i64, cfg.sample_rate);
        extractor.goto_time(target).unwrap();
        let mut out = vec![Vec::new(), Vec::new()];
        let got = extractor.extract(1024, &mut out).unwrap();
        assert_eq!(got, 1024);
        let samples = unpack_samples(&out[0], 1024, 2);
        for (k, &s) in samples.iter().enumerate() {
            let i = target_sample + k;
            if (i % frame_samples) / cfg.fan_out >= cfg.flavour.header_words() {
                let expected = crate::input::extractor::DECODE_2BIT[sample_of(0, i) as usize];
                assert_eq!(s, expected, "sample {i}");
            }
        }
    }

    #[test]
    fn test_goto_time_into_past_is_error() {
        let cfg = default_config(8);
        let (mut extractor, _) = build(&cfg, 2, |_, _| 0);
        let past = cfg.start - TimeDelta::from_seconds(1.0);
        assert!(matches!(
            extractor.goto_time(past),
            Err(FormatError::TimeInPast { .. })
        ));
    }

    #[test]
    fn test_short_read_reports_produced_count() {
        let cfg = default_config(8);
        let (mut extractor, _) = build(&cfg, 2, |_, _| 1);
        let frame_samples = cfg.flavour.frame_words() * cfg.fan_out;
        let mut out = vec![Vec::new(), Vec::new()];
        let got = extractor.extract(10 * frame_samples, &mut out).unwrap();
        assert_eq!(got, 2 * frame_samples);
    }

    #[test]
    fn test_corrupt_sync_fails_scan() {
        let cfg = default_config(8);
        let mut data = synthetic_recording(&cfg, 2, &|_, _| 0);
        // Break every sync byte.
        for frame in 0..2 {
            let base = frame * cfg.flavour.frame_words();
            for pos in 64..96 {
                data[base + pos] = 0x00;
            }
        }
        let params = test_params(&cfg);
        assert!(matches!(
            Mark4Extractor::new(
                Box::new(MemSource::new(data)),
                &params,
                cfg.flavour,
                7,
                100
            ),
            Err(FormatError::SyncNotFound { .. })
        ));
    }

    #[test]
    fn test_vlba_flavour_round_trip() {
        let mut cfg = default_config(16);
        cfg.flavour = TapeFlavour::Vlba;
        let sample_of = |c: usize, i: usize| ((i * 3 + c) % 4) as u8;
        let (mut extractor, _) = build(&cfg, 2, sample_of);
        assert_eq!(extractor.current_time(), cfg.start);
        let frame_samples = cfg.flavour.frame_words() * cfg.fan_out;
        let mut out = vec![Vec::new(), Vec::new()];
        assert_eq!(extractor.extract(frame_samples, &mut out).unwrap(), frame_samples);
        let samples = unpack_samples(&out[1], frame_samples, 2);
        let header_samples = cfg.flavour.header_words() * cfg.fan_out;
        for i in header_samples..frame_samples {
            let expected = crate::input::extractor::DECODE_2BIT[sample_of(1, i) as usize];
            assert_eq!(samples[i], expected);
        }
    }

    #[test]
    fn test_timecode_advances_with_frames() {
        let cfg = default_config(8);
        // 2500 words × fan-out 2 at 5 Ms/s: exactly 1 ms per frame.
        let (mut extractor, _) = build(&cfg, 4, |_, _| 0);
        let frame_samples = cfg.flavour.frame_words() * cfg.fan_out;
        let mut out = vec![Vec::new(), Vec::new()];
        extractor.extract(frame_samples, &mut out).unwrap();
        extractor.extract(1, &mut out).unwrap();
        assert_eq!(
            extractor.current_time() - cfg.start,
            TimeDelta::from_usec(1000)
        );
    }
}
