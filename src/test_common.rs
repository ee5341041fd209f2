//! Synthetic recordings and helpers shared between unit and integration
//! tests.

use crate::input::reader::ByteSource;
use crate::msg::{ChannelParameters, InputNodeParameters};
use crate::time::{Time, TimeDelta};
use crate::vex::DataFormat;

/// An in-memory [`ByteSource`].
pub struct MemSource {
    data: Vec<u8>,
    pos: usize,
}

impl MemSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl ByteSource for MemSource {
    fn read_into(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let take = buf.len().min(self.data.len() - self.pos);
        buf[..take].copy_from_slice(&self.data[self.pos..self.pos + take]);
        self.pos += take;
        Ok(take)
    }

    fn skip(&mut self, n: u64) -> std::io::Result<u64> {
        let take = (n as usize).min(self.data.len() - self.pos);
        self.pos += take;
        Ok(take as u64)
    }

    fn bytes_read(&self) -> u64 {
        self.pos as u64
    }
}

/// Quantise a tone to 2-bit internal values (`magnitude | sign << 1`), the
/// signal used by the correlation tests.
pub fn quantised_tone(freq_hz: f64, sample_rate: u64, n_samples: usize, phase0: f64) -> Vec<u8> {
    (0..n_samples)
        .map(|i| {
            let t = i as f64 / sample_rate as f64;
            let s = (2.0 * std::f64::consts::PI * freq_hz * t + phase0).cos();
            let sign = (s >= 0.0) as u8;
            let magnitude = (s.abs() > 0.5) as u8;
            magnitude | (sign << 1)
        })
        .collect()
}

pub mod mark4 {
    use super::*;
    use crate::input::extractor::crc12;
    use crate::input::extractor::mark4::TapeFlavour;

    /// Geometry of a synthetic Mark4/VLBA recording.
    #[derive(Debug, Clone)]
    pub struct Mark4TestConfig {
        pub flavour: TapeFlavour,
        pub n_tracks: u32,
        pub fan_out: usize,
        pub bits_per_sample: u8,
        pub sample_rate: u64,
        pub n_channels: usize,
        pub start: Time,
        /// Zero bytes prepended before the first frame
        pub garbage_prefix: usize,
    }

    /// Input-node parameters matching [`synthetic_recording`]'s track
    /// assignment: channel `c` occupies consecutive tracks from
    /// `c · fan_out · bits`, magnitude before sign.
    pub fn test_params(cfg: &Mark4TestConfig) -> InputNodeParameters {
        let per_channel = cfg.fan_out * cfg.bits_per_sample as usize;
        let channels = (0..cfg.n_channels)
            .map(|c| {
                let base = (c * per_channel) as u32;
                let (sign_tracks, magnitude_tracks) = if cfg.bits_per_sample > 1 {
                    (
                        (0..cfg.fan_out).map(|k| base + 2 * k as u32 + 1).collect(),
                        (0..cfg.fan_out).map(|k| base + 2 * k as u32).collect(),
                    )
                } else {
                    (
                        (0..cfg.fan_out).map(|k| base + k as u32).collect(),
                        vec![],
                    )
                };
                ChannelParameters {
                    channel_name: format!("CH{:02}", c + 1),
                    sign_tracks,
                    magnitude_tracks,
                }
            })
            .collect();
        InputNodeParameters {
            frame_format: match cfg.flavour {
                TapeFlavour::Mark4 => DataFormat::Mark4,
                TapeFlavour::Vlba => DataFormat::Vlba,
            },
            channels,
            sample_rate: cfg.sample_rate,
            bits_per_sample: cfg.bits_per_sample,
            reader_offset: TimeDelta::from_ticks(0),
            ref_time: cfg.start,
            randomise_headers: true,
        }
    }

    fn timecode_digits(flavour: TapeFlavour, t: Time) -> [u8; 13] {
        let mjd = t.mjd();
        let midnight = Time::from_mjd_seconds(mjd, 0.0);
        let usec_of_day = (t - midnight).as_usec();
        let seconds = usec_of_day / 1_000_000;
        let mut d = [0u8; 13];
        match flavour {
            TapeFlavour::Mark4 => {
                let (year, doy) = t.year_day();
                let millis = (usec_of_day % 1_000_000) / 1000;
                d[0] = (year % 10) as u8;
                d[1] = (doy / 100) as u8;
                d[2] = (doy / 10 % 10) as u8;
                d[3] = (doy % 10) as u8;
                d[4] = (seconds / 36000) as u8;
                d[5] = (seconds / 3600 % 10) as u8;
                d[6] = (seconds % 3600 / 600) as u8;
                d[7] = (seconds % 3600 / 60 % 10) as u8;
                d[8] = (seconds % 60 / 10) as u8;
                d[9] = (seconds % 10) as u8;
                d[10] = (millis / 100) as u8;
                d[11] = (millis / 10 % 10) as u8;
                d[12] = (millis % 10) as u8;
            }
            TapeFlavour::Vlba => {
                let truncated = mjd.rem_euclid(1000);
                let tenth_ms = (usec_of_day % 1_000_000) / 100;
                d[0] = (truncated / 100) as u8;
                d[1] = (truncated / 10 % 10) as u8;
                d[2] = (truncated % 10) as u8;
                d[3] = (seconds / 10_000) as u8;
                d[4] = (seconds / 1000 % 10) as u8;
                d[5] = (seconds / 100 % 10) as u8;
                d[6] = (seconds / 10 % 10) as u8;
                d[7] = (seconds % 10) as u8;
                d[8] = (tenth_ms / 1000) as u8;
                d[9] = (tenth_ms / 100 % 10) as u8;
                d[10] = (tenth_ms / 10 % 10) as u8;
                d[11] = (tenth_ms % 10) as u8;
                d[12] = 0;
            }
        }
        d
    }

    /// Generate `n_frames` of recording. `sample_of(channel, index)` gives
    /// the 2-bit (or 1-bit) value of each data-region sample; sample
    /// indices cover header positions too, but those carry header bits.
    pub fn synthetic_recording(
        cfg: &Mark4TestConfig,
        n_frames: usize,
        sample_of: &dyn Fn(usize, usize) -> u8,
    ) -> Vec<u8> {
        let word_bytes = (cfg.n_tracks / 8) as usize;
        let frame_words = cfg.flavour.frame_words();
        let header_words = cfg.flavour.header_words();
        let pre = header_words - 96;
        let ones_mask: u64 = if cfg.n_tracks == 64 {
            u64::MAX
        } else {
            (1u64 << cfg.n_tracks) - 1
        };
        let frame_duration =
            TimeDelta::from_samples((frame_words * cfg.fan_out) as i64, cfg.sample_rate);
        let per_channel = cfg.fan_out * cfg.bits_per_sample as usize;
        let used_tracks = cfg.n_channels * per_channel;

        let mut data = vec![0u8; cfg.garbage_prefix];
        for frame in 0..n_frames {
            let digits = timecode_digits(cfg.flavour, cfg.start + frame_duration * frame as i64);
            let mut time_bits = [0u8; 64];
            for (i, &digit) in digits.iter().enumerate() {
                for b in 0..4 {
                    time_bits[4 * i + b] = (digit >> (3 - b)) & 1;
                }
            }
            let crc = crc12(time_bits[..52].iter().copied());
            for (i, bit) in time_bits[52..].iter_mut().enumerate() {
                *bit = ((crc >> (11 - i)) & 1) as u8;
            }

            for pos in 0..frame_words {
                let word = if pos < pre {
                    0
                } else if pos < pre + 32 {
                    ones_mask
                } else if pos < header_words {
                    if time_bits[pos - pre - 32] == 1 {
                        ones_mask
                    } else {
                        0
                    }
                } else {
                    let mut w = 0u64;
                    for c in 0..cfg.n_channels {
                        let base = c * per_channel;
                        for s in 0..cfg.fan_out {
                            let idx = (frame * frame_words + pos) * cfg.fan_out + s;
                            let v = sample_of(c, idx);
                            if cfg.bits_per_sample > 1 {
                                w |= ((v & 1) as u64) << (base + 2 * s);
                                w |= (((v >> 1) & 1) as u64) << (base + 2 * s + 1);
                            } else {
                                w |= ((v & 1) as u64) << (base + s);
                            }
                        }
                    }
                    // Alternate the unused tracks so bit statistics stay
                    // near one half.
                    if pos % 2 == 0 {
                        for track in used_tracks..cfg.n_tracks as usize {
                            w |= 1u64 << track;
                        }
                    }
                    w
                };
                data.extend_from_slice(&word.to_le_bytes()[..word_bytes]);
            }
        }
        data
    }
}

pub mod mark5b {
    use super::*;
    use crate::input::extractor::mark5b::{encode_header, FrameHeader, FRAME_SAMPLES, PAYLOAD_BYTES};

    /// Geometry of a synthetic Mark5B recording.
    #[derive(Debug, Clone)]
    pub struct Mark5bTestConfig {
        pub n_channels: usize,
        pub bits_per_sample: u8,
        pub sample_rate: u64,
        pub start: Time,
        /// Zero bytes prepended before the first frame
        pub garbage_prefix: usize,
    }

    /// Input-node parameters matching [`synthetic_recording`]: channel `c`
    /// uses bitstreams `2c` (magnitude) and `2c + 1` (sign).
    pub fn test_params(cfg: &Mark5bTestConfig) -> InputNodeParameters {
        let channels = (0..cfg.n_channels)
            .map(|c| ChannelParameters {
                channel_name: format!("CH{:02}", c + 1),
                sign_tracks: vec![2 * c as u32 + 1],
                magnitude_tracks: if cfg.bits_per_sample > 1 {
                    vec![2 * c as u32]
                } else {
                    vec![]
                },
            })
            .collect();
        InputNodeParameters {
            frame_format: DataFormat::Mark5b,
            channels,
            sample_rate: cfg.sample_rate,
            bits_per_sample: cfg.bits_per_sample,
            reader_offset: TimeDelta::from_ticks(0),
            ref_time: cfg.start,
            randomise_headers: true,
        }
    }

    /// Generate `n_frames` of recording; `sample_of(channel, index)` as for
    /// the Mark4 generator, but the header is not part of the sample space.
    pub fn synthetic_recording(
        cfg: &Mark5bTestConfig,
        n_frames: usize,
        sample_of: &dyn Fn(usize, usize) -> u8,
    ) -> Vec<u8> {
        let frame_duration = TimeDelta::from_samples(FRAME_SAMPLES as i64, cfg.sample_rate);
        let mut data = vec![0u8; cfg.garbage_prefix];
        for frame in 0..n_frames {
            let t = cfg.start + frame_duration * frame as i64;
            let midnight = Time::from_mjd_seconds(t.mjd(), 0.0);
            let usec_of_day = (t - midnight).as_usec();
            let seconds = (usec_of_day / 1_000_000) as u32;
            let second_start = midnight + TimeDelta::from_usec(seconds as i64 * 1_000_000);
            let frame_in_second = (t - second_start).div_floor(frame_duration) as u32;
            let header = FrameHeader {
                frame_in_second,
                mjd_mod_1000: t.mjd().rem_euclid(1000) as u32,
                seconds,
                tenth_ms: 0,
            };
            data.extend_from_slice(&encode_header(&header));

            let mut payload = vec![0u8; PAYLOAD_BYTES];
            for pos in 0..FRAME_SAMPLES {
                let idx = frame * FRAME_SAMPLES + pos;
                let mut word = 0u32;
                for c in 0..cfg.n_channels {
                    let v = sample_of(c, idx);
                    if cfg.bits_per_sample > 1 {
                        word |= ((v & 1) as u32) << (2 * c);
                        word |= (((v >> 1) & 1) as u32) << (2 * c + 1);
                    } else {
                        word |= ((v & 1) as u32) << c;
                    }
                }
                if pos % 2 == 0 {
                    let used = cfg.n_channels * cfg.bits_per_sample.max(1) as usize;
                    for bit in used..32 {
                        word |= 1 << bit;
                    }
                }
                payload[pos * 4..pos * 4 + 4].copy_from_slice(&word.to_le_bytes());
            }
            data.extend_from_slice(&payload);
        }
        data
    }
}

pub mod vdif {
    use super::*;
    use crate::input::extractor::vdif::{encode_header, epoch_start, VdifHeader, HEADER_BYTES};

    /// Geometry of a synthetic VDIF recording: `n_threads` threads of
    /// `nchan_per_frame` channels each, frame sets in round-robin thread
    /// order.
    #[derive(Debug, Clone)]
    pub struct VdifTestConfig {
        pub n_threads: usize,
        pub nchan_per_frame: usize,
        pub bits_per_sample: u8,
        pub sample_rate: u64,
        pub frame_bytes: usize,
        pub ref_epoch: u8,
        pub seconds: u32,
        /// Zero bytes prepended before the first frame
        pub garbage_prefix: usize,
    }

    impl VdifTestConfig {
        pub fn samples_per_frame(&self) -> usize {
            (self.frame_bytes - HEADER_BYTES) * 8
                / (self.nchan_per_frame * self.bits_per_sample as usize)
        }
    }

    /// Parameters matching the generator: logical channels thread-major,
    /// each naming `[thread_id, channel_index]`.
    pub fn test_params(cfg: &VdifTestConfig) -> InputNodeParameters {
        let channels = (0..cfg.n_threads)
            .flat_map(|t| {
                (0..cfg.nchan_per_frame).map(move |k| ChannelParameters {
                    channel_name: format!("CH{:02}", t * cfg.nchan_per_frame + k + 1),
                    sign_tracks: vec![t as u32, k as u32],
                    magnitude_tracks: vec![],
                })
            })
            .collect();
        InputNodeParameters {
            frame_format: DataFormat::Vdif,
            channels,
            sample_rate: cfg.sample_rate,
            bits_per_sample: cfg.bits_per_sample,
            reader_offset: TimeDelta::from_ticks(0),
            ref_time: epoch_start(cfg.ref_epoch),
            randomise_headers: true,
        }
    }

    /// Internal (`magnitude | sign << 1`) to VDIF offset-binary values.
    const INTERNAL_TO_OFFSET: [u8; 4] = [1, 0, 2, 3];

    pub fn synthetic_recording(
        cfg: &VdifTestConfig,
        n_frame_sets: usize,
        sample_of: &dyn Fn(usize, usize) -> u8,
    ) -> Vec<u8> {
        synthetic_recording_with_invalid(cfg, n_frame_sets, sample_of, &[])
    }

    /// As [`synthetic_recording`], with the listed frame sets flagged
    /// invalid (payload zeroed).
    pub fn synthetic_recording_with_invalid(
        cfg: &VdifTestConfig,
        n_frame_sets: usize,
        sample_of: &dyn Fn(usize, usize) -> u8,
        invalid_sets: &[usize],
    ) -> Vec<u8> {
        let spf = cfg.samples_per_frame();
        let bits = cfg.bits_per_sample as usize;
        let mut data = vec![0u8; cfg.garbage_prefix];
        for set in 0..n_frame_sets {
            let invalid = invalid_sets.contains(&set);
            for thread in 0..cfg.n_threads {
                let header = VdifHeader {
                    seconds: cfg.seconds,
                    invalid,
                    frame_in_second: set as u32,
                    ref_epoch: cfg.ref_epoch,
                    frame_bytes: cfg.frame_bytes,
                    nchan: cfg.nchan_per_frame as u32,
                    bits_per_sample: cfg.bits_per_sample,
                    thread_id: thread as u16,
                };
                data.extend_from_slice(&encode_header(&header));
                let mut payload = vec![0u8; cfg.frame_bytes - HEADER_BYTES];
                if !invalid {
                    for s in 0..spf {
                        let idx = set * spf + s;
                        for k in 0..cfg.nchan_per_frame {
                            let c = thread * cfg.nchan_per_frame + k;
                            let internal = sample_of(c, idx);
                            let raw = if bits == 2 {
                                INTERNAL_TO_OFFSET[internal as usize]
                            } else {
                                internal & 1
                            };
                            let bit_off = (s * cfg.nchan_per_frame + k) * bits;
                            payload[bit_off / 8] |= raw << (bit_off % 8);
                        }
                    }
                }
                data.extend_from_slice(&payload);
            }
        }
        data
    }
}
