//! The per-slice correlation algorithm.
//!
//! For every station stream the slice's packed samples are decoded, delay-
//! corrected per FFT window (integer residual shift by moving the read
//! pointer, fractional delay as a frequency-domain phase slope, fringe
//! rotation at the channel LO), assembled into correlation-length segments,
//! windowed, transformed, and accumulated as a triangular matrix of
//! baseline products (autos on the diagonal). The accumulated spectra are
//! rebinned to the output channel count and normalised by the number of
//! contributing segments.
//!
//! Stations recorded at a higher rate than the correlation runs at are
//! handled spectrally: their delay-correction windows are proportionally
//! longer, and the correlation band is cut out of their spectrum before the
//! inverse transform (the "contained-in" bandwidth rule).

use itertools::izip;
use ndarray::{s, Array2, Array3};
use num_complex::Complex;
use rustfft::FftPlanner;
use thiserror::Error;

use crate::cal::CalTable;
use crate::delay::DelayTable;
use crate::msg::{CorrelationParameters, PulsarParameters, StationStream};
use crate::output::{BaselineSpectrum, VisibilityRecord};
use crate::time::TimeDelta;
use crate::vex::Sideband;

use super::pulsar;

type C32 = Complex<f32>;

/// Errors raised by the correlation core
#[derive(Error, Debug)]
pub enum CorrError {
    /// The slice geometry does not divide evenly
    #[error("bad slice geometry: {0}")]
    Geometry(String),

    /// A station's sample rate is incompatible with the correlation rate
    #[error("station rate {station_rate} incompatible with correlation rate {corr_rate}")]
    RateMismatch {
        /// The station's rate
        station_rate: u64,
        /// The correlation rate
        corr_rate: u64,
    },

    #[error(transparent)]
    /// Calibration lookup failed
    Cal(#[from] crate::cal::CalError),
}

/// One station leg of a slice: the decoded samples plus everything needed
/// to align them.
pub struct LegData {
    /// The stream parameters from the work order
    pub stream: StationStream,
    /// Decoded samples, zero-padded to the expected count
    pub samples: Vec<f32>,
    /// How many leading samples are real data (the rest is padding after a
    /// short read)
    pub valid_samples: usize,
    /// The coarse shift the input node already applied, in station samples
    pub applied_shift: i64,
    /// Delay tables per phase centre; index 0 is the reference. `None`
    /// means a zero delay model.
    pub delays: Vec<Option<DelayTable>>,
}

impl LegData {
    fn delay_at(&self, source: usize, t: crate::time::Time) -> f64 {
        let table = self.delays.get(source).and_then(|d| d.as_ref());
        let geometric = match table {
            Some(table) if table.covers(t) => table.eval(t).delay,
            _ => 0.0,
        };
        geometric + self.stream.extra_delay_sec
    }
}

/// The lower band edge of a stream, Hz.
fn lower_edge(freq_hz: f64, bandwidth_hz: f64, sideband: Sideband) -> f64 {
    match sideband {
        Sideband::Upper => freq_hz,
        Sideband::Lower => freq_hz - bandwidth_hz,
    }
}

/// Per-leg, per-segment spectra ready for cross-multiplication.
struct LegSpectra {
    /// segments × (fft_size_correlation/2 + 1)
    segments: Vec<Vec<C32>>,
    valid: Vec<bool>,
    /// per segment × per phase centre scalar phasor
    phasors: Vec<Vec<C32>>,
}

fn process_leg(
    params: &CorrelationParameters,
    leg: &LegData,
    window_coeffs: &[f64],
    cal: Option<&CalTable>,
    planner: &mut FftPlanner<f32>,
) -> Result<LegSpectra, CorrError> {
    let n_d = params.fft_size_delaycor;
    let n_c = params.fft_size_correlation;
    let rate = params.sample_rate;
    let station_rate = leg.stream.sample_rate;
    if station_rate < rate || station_rate % rate != 0 {
        return Err(CorrError::RateMismatch {
            station_rate,
            corr_rate: rate,
        });
    }
    let ratio = (station_rate / rate) as usize;
    let n_di = n_d * ratio;
    if params.slice_size % n_c != 0 || n_c % n_d != 0 {
        return Err(CorrError::Geometry(format!(
            "slice {} / correlation fft {} / delay fft {}",
            params.slice_size, n_c, n_d
        )));
    }
    let n_windows = params.slice_size / n_d;
    let n_seg = params.slice_size / n_c;
    let windows_per_seg = n_c / n_d;
    let half = n_d / 2;
    let half_i = n_di / 2;
    let df = station_rate as f64 / n_di as f64;
    let f_lo = params.channel_freq_hz + leg.stream.lo_offset_hz;
    let corr_lower = lower_edge(params.channel_freq_hz, params.bandwidth_hz, params.sideband);
    let station_lower = lower_edge(
        leg.stream.channel_freq_hz,
        leg.stream.bandwidth_hz,
        leg.stream.sideband,
    );
    let offset_bins = ((corr_lower - station_lower) / df).round() as i64;

    let fft_fwd = planner.plan_fft_forward(n_di);
    let fft_inv = planner.plan_fft_inverse(n_d);
    let fft_corr = planner.plan_fft_forward(n_c);

    let mut corrected: Vec<C32> = Vec::with_capacity(params.slice_size);
    let mut window_valid = vec![false; n_windows];
    let mut buf = vec![C32::new(0.0, 0.0); n_di];

    for w in 0..n_windows {
        let t_mid = params.slice_start
            + TimeDelta::from_samples((w * n_d + n_d / 2) as i64, rate);
        let delay = leg.delay_at(0, t_mid);
        let k_total = (delay * station_rate as f64).round() as i64;
        let residual_shift = k_total - leg.applied_shift;
        let tau_frac = delay - k_total as f64 / station_rate as f64;

        let base = (w * n_di) as i64 + residual_shift;
        let in_bounds = base >= 0 && (base + n_di as i64) as usize <= leg.valid_samples;
        window_valid[w] = in_bounds;
        for (i, value) in buf.iter_mut().enumerate() {
            let idx = base + i as i64;
            let sample = if idx >= 0 && (idx as usize) < leg.samples.len() {
                leg.samples[idx as usize]
            } else {
                0.0
            };
            *value = C32::new(sample, 0.0);
        }
        fft_fwd.process(&mut buf);

        // Positive-frequency bins in sky order.
        let mut bins: Vec<C32> = match leg.stream.sideband {
            Sideband::Upper => buf[..=half_i].to_vec(),
            Sideband::Lower => (0..=half_i).map(|j| buf[half_i - j].conj()).collect(),
        };

        // Cut the correlation band out of the station band.
        let mut selected = vec![C32::new(0.0, 0.0); n_d];
        for (j, out) in selected.iter_mut().take(half + 1).enumerate() {
            let src = offset_bins + j as i64;
            if src >= 0 && (src as usize) < bins.len() {
                *out = bins[src as usize];
            }
        }
        bins.clear();

        // Fringe rotation at the LO plus the fractional-delay slope.
        for (j, value) in selected.iter_mut().take(half + 1).enumerate() {
            let phase = 2.0 * std::f64::consts::PI * (f_lo * delay + j as f64 * df * tau_frac);
            let rot = Complex::new(phase.cos() as f32, phase.sin() as f32);
            *value *= rot;
        }

        fft_inv.process(&mut selected);
        let scale = 1.0 / n_di as f32;
        corrected.extend(selected.iter().map(|&v| v * scale));
    }

    // Segment, window, transform.
    let mut segments = Vec::with_capacity(n_seg);
    let mut valid = Vec::with_capacity(n_seg);
    let mut phasors = Vec::with_capacity(n_seg);
    for s in 0..n_seg {
        let mut seg: Vec<C32> = izip!(&corrected[s * n_c..(s + 1) * n_c], window_coeffs)
            .map(|(&v, &w)| v * w as f32)
            .collect();
        fft_corr.process(&mut seg);
        let norm = 1.0 / n_c as f32;
        let mut spectrum: Vec<C32> = seg[..=n_c / 2].iter().map(|&v| v * norm).collect();

        let t_mid = params.slice_start
            + TimeDelta::from_samples((s * n_c + n_c / 2) as i64, rate);
        if let Some(cal) = cal {
            let corrections = cal.corrections(
                t_mid,
                leg.stream.station_stream,
                leg.stream.channel_freq_hz,
                leg.stream.sideband,
                leg.stream.polarisation,
            )?;
            // The calibration table is evaluated at n_c/2 channels, so the
            // lengths line up bin for bin.
            for (value, &corr) in izip!(spectrum.iter_mut(), &corrections) {
                *value *= corr;
            }
        }

        let mut seg_phasors = Vec::with_capacity(params.n_phase_centers);
        for source in 0..params.n_phase_centers {
            if source == 0 {
                seg_phasors.push(C32::new(1.0, 0.0));
            } else {
                let delta = leg.delay_at(source, t_mid) - leg.delay_at(0, t_mid);
                let phase = 2.0 * std::f64::consts::PI * f_lo * delta;
                seg_phasors.push(Complex::new(phase.cos() as f32, phase.sin() as f32));
            }
        }

        valid.push(window_valid[s * windows_per_seg..(s + 1) * windows_per_seg]
            .iter()
            .all(|&v| v));
        segments.push(spectrum);
        phasors.push(seg_phasors);
    }

    Ok(LegSpectra {
        segments,
        valid,
        phasors,
    })
}

/// A baseline product: indices into the leg list.
struct Product {
    leg1: usize,
    leg2: usize,
}

/// Enumerate the products of a slice: the upper triangle of the station
/// matrix, with the four polarisation pairs when a cross channel is active.
fn products(n_stations: usize, cross: bool) -> Vec<Product> {
    let mut out = Vec::new();
    for a in 0..n_stations {
        for b in a..n_stations {
            out.push(Product { leg1: a, leg2: b });
            if cross {
                out.push(Product {
                    leg1: a + n_stations,
                    leg2: b + n_stations,
                });
                out.push(Product {
                    leg1: a,
                    leg2: b + n_stations,
                });
                out.push(Product {
                    leg1: a + n_stations,
                    leg2: b,
                });
            }
        }
    }
    out
}

/// Zoom/rebin the accumulated spectrum down to exactly `number_channels`
/// bins, averaging each output bin's share of the input bins. The input is
/// whatever bin count the correlation FFT produced upstream.
fn rebin(spectrum: &[Complex<f64>], number_channels: usize) -> Vec<C32> {
    let n_in = spectrum.len();
    (0..number_channels)
        .map(|j| {
            let lo = j * n_in / number_channels;
            let hi = ((j + 1) * n_in / number_channels).max(lo + 1).min(n_in);
            let sum: Complex<f64> = spectrum[lo..hi].iter().sum();
            let avg = sum / (hi - lo) as f64;
            C32::new(avg.re as f32, avg.im as f32)
        })
        .collect()
}

/// Correlate one slice. `legs` holds the primary-channel legs followed by
/// the cross-channel legs (when cross-polarisation is active); `sources`
/// names the phase centres for multi-phase-centre output.
pub fn correlate_slice(
    params: &CorrelationParameters,
    legs: &[LegData],
    cal: Option<&CalTable>,
    pulsar_params: Option<&PulsarParameters>,
    sources: &[String],
) -> Result<Vec<VisibilityRecord>, CorrError> {
    let cross = params.cross_channel_nr.is_some();
    let n_stations = params.station_streams.len();
    let expected_legs = if cross { 2 * n_stations } else { n_stations };
    if legs.len() != expected_legs {
        return Err(CorrError::Geometry(format!(
            "{} legs supplied, {expected_legs} expected",
            legs.len()
        )));
    }
    let n_c = params.fft_size_correlation;
    let n_seg = params.slice_size / n_c;
    let window_coeffs = params.window.coefficients(n_c);

    let mut planner = FftPlanner::new();
    let spectra = legs
        .iter()
        .map(|leg| process_leg(params, leg, &window_coeffs, cal, &mut planner))
        .collect::<Result<Vec<_>, _>>()?;

    // One output per pulsar bin, per phase centre, or just the one. The
    // run may have more output streams than this scan populates; the
    // missing ones are padded with zero-weight records below.
    let n_outputs = if params.pulsar_binning {
        params
            .n_output_streams
            .max(pulsar_params.map(|p| p.nbins + 1).unwrap_or(1))
    } else if params.multi_phase_center {
        params.n_phase_centers
    } else {
        1
    };
    let product_list = products(n_stations, cross);
    let n_bins = n_c / 2 + 1;
    let mut acc = Array3::<Complex<f64>>::zeros((n_outputs, product_list.len(), n_bins));
    let mut counts = Array2::<u64>::zeros((n_outputs, product_list.len()));

    for s in 0..n_seg {
        let outputs: Vec<usize> = if params.pulsar_binning {
            let t_mid = params.slice_start
                + TimeDelta::from_samples((s * n_c + n_c / 2) as i64, params.sample_rate);
            match pulsar_params {
                Some(p) => vec![pulsar::bin_for(p, t_mid)],
                None => vec![0],
            }
        } else if params.multi_phase_center {
            (0..n_outputs).collect()
        } else {
            vec![0]
        };
        for (p, product) in product_list.iter().enumerate() {
            let (s1, s2) = (&spectra[product.leg1], &spectra[product.leg2]);
            if !s1.valid[s] || !s2.valid[s] {
                continue;
            }
            for &out in &outputs {
                let source_nr = if params.multi_phase_center { out } else { 0 };
                let phasor = s1.phasors[s][source_nr] * s2.phasors[s][source_nr].conj();
                let mut acc_spec = acc.slice_mut(s![out, p, ..]);
                for (j, value) in acc_spec.iter_mut().enumerate() {
                    let product_value = s1.segments[s][j] * s2.segments[s][j].conj() * phasor;
                    // NaN products are suppressed rather than poisoning the
                    // accumulator.
                    if product_value.re.is_nan() || product_value.im.is_nan() {
                        continue;
                    }
                    *value += Complex::new(product_value.re as f64, product_value.im as f64);
                }
                counts[[out, p]] += 1;
            }
        }
    }

    let mut records = Vec::with_capacity(n_outputs);
    for out in 0..n_outputs {
        let mut baselines = Vec::with_capacity(product_list.len());
        for (p, product) in product_list.iter().enumerate() {
            let stream1 = leg_stream(params, product.leg1, n_stations);
            let stream2 = leg_stream(params, product.leg2, n_stations);
            let count = counts[[out, p]];
            let normalised: Vec<Complex<f64>> = if count > 0 {
                acc.slice(s![out, p, ..])
                    .iter()
                    .map(|&v| v / count as f64)
                    .collect()
            } else {
                vec![Complex::new(0.0, 0.0); n_bins]
            };
            baselines.push(BaselineSpectrum {
                station1: stream1.station_stream as u16,
                station2: stream2.station_stream as u16,
                pol1: stream1.polarisation,
                pol2: stream2.polarisation,
                weight: count as f32 / n_seg as f32,
                spectrum: rebin(&normalised, params.number_channels),
            });
        }
        // Phase centres are numbered within the scan; the output stream is
        // the source's position in the run-wide list.
        let (source, stream_nr) = if params.multi_phase_center {
            let name = params
                .phase_center_sources
                .get(out)
                .cloned()
                .unwrap_or_else(|| params.source.clone());
            let stream_nr = sources.iter().position(|s| *s == name).unwrap_or(out);
            (name, stream_nr)
        } else {
            (params.source.clone(), out)
        };
        records.push(VisibilityRecord {
            slice_nr: params.slice_nr,
            integration_nr: params.integration_nr,
            channel_nr: params.channel_nr as u32,
            stream_nr: stream_nr as u32,
            source,
            baselines,
        });
    }

    // Pad the output streams this scan left unpopulated, so every slice
    // yields a full, dense set of records.
    for stream_nr in 0..params.n_output_streams {
        if records.iter().any(|r| r.stream_nr == stream_nr as u32) {
            continue;
        }
        let baselines = product_list
            .iter()
            .map(|product| {
                let stream1 = leg_stream(params, product.leg1, n_stations);
                let stream2 = leg_stream(params, product.leg2, n_stations);
                BaselineSpectrum {
                    station1: stream1.station_stream as u16,
                    station2: stream2.station_stream as u16,
                    pol1: stream1.polarisation,
                    pol2: stream2.polarisation,
                    weight: 0.0,
                    spectrum: vec![C32::new(0.0, 0.0); params.number_channels],
                }
            })
            .collect();
        records.push(VisibilityRecord {
            slice_nr: params.slice_nr,
            integration_nr: params.integration_nr,
            channel_nr: params.channel_nr as u32,
            stream_nr: stream_nr as u32,
            source: sources
                .get(stream_nr)
                .cloned()
                .unwrap_or_else(|| params.source.clone()),
            baselines,
        });
    }
    Ok(records)
}

fn leg_stream(params: &CorrelationParameters, leg: usize, n_stations: usize) -> &StationStream {
    if leg < n_stations {
        &params.station_streams[leg]
    } else {
        &params.cross_streams[leg - n_stations]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delay::{DelayRow, DelayTable};
    use crate::input::extractor::DECODE_2BIT;
    use crate::test_common::quantised_tone;
    use crate::time::Time;
    use crate::window::WindowFunction;
    use approx::assert_abs_diff_eq;

    const RATE: u64 = 16_000_000;
    const SLICE: usize = 8192;
    const NFFT: usize = 256;

    fn test_params(n_stations: usize) -> CorrelationParameters {
        let stream = |i: usize| StationStream {
            station_stream: i,
            station_name: format!("S{i}"),
            sample_rate: RATE,
            bandwidth_hz: RATE as f64 / 2.0,
            sideband: Sideband::Upper,
            channel_freq_hz: 0.0,
            polarisation: 'R',
            lo_offset_hz: 0.0,
            extra_delay_sec: 0.0,
            bits_per_sample: 2,
        };
        CorrelationParameters {
            integration_nr: 0,
            slice_nr: 0,
            sub_slice_nr: 0,
            channel_nr: 0,
            cross_channel_nr: None,
            integration_start: Time::from_mjd_seconds(57203, 43200.0),
            slice_start: Time::from_mjd_seconds(57203, 43200.0),
            slice_time: TimeDelta::from_samples(SLICE as i64, RATE),
            sample_rate: RATE,
            channel_freq_hz: 0.0,
            bandwidth_hz: RATE as f64 / 2.0,
            sideband: Sideband::Upper,
            slice_size: SLICE,
            fft_size_delaycor: NFFT,
            fft_size_correlation: NFFT,
            number_channels: 64,
            window: WindowFunction::Hann,
            source: "J1159+2914".to_string(),
            phase_center_sources: vec![],
            n_phase_centers: 1,
            n_output_streams: 1,
            multi_phase_center: false,
            pulsar_binning: false,
            station_streams: (0..n_stations).map(stream).collect(),
            cross_streams: vec![],
        }
    }

    fn tone_leg(params: &CorrelationParameters, idx: usize, freq: f64, phase0: f64) -> LegData {
        let values = quantised_tone(freq, RATE, SLICE, phase0);
        let samples = values.iter().map(|&v| DECODE_2BIT[v as usize]).collect();
        LegData {
            stream: params.station_streams[idx].clone(),
            samples,
            valid_samples: SLICE,
            applied_shift: 0,
            delays: vec![None],
        }
    }

    /// The tone sits in output bin freq/df after rebinning.
    fn tone_bin(params: &CorrelationParameters, freq: f64) -> usize {
        let df_out = params.bandwidth_hz / params.number_channels as f64;
        (freq / df_out).round() as usize
    }

    #[test]
    fn test_autocorrelation_is_real_non_negative_with_tone_peak() {
        let params = test_params(1);
        let freq = RATE as f64 / 8.0;
        let legs = vec![tone_leg(&params, 0, freq, 0.0)];
        let records = correlate_slice(&params, &legs, None, None, &[]).unwrap();
        assert_eq!(records.len(), 1);
        let baseline = &records[0].baselines[0];
        assert_eq!(baseline.station1, 0);
        assert_eq!(baseline.station2, 0);
        assert_abs_diff_eq!(baseline.weight, 1.0);
        for (j, value) in baseline.spectrum.iter().enumerate() {
            assert!(value.re >= -1e-3, "bin {j} is {value}");
            assert!(value.im.abs() < 1e-3 * value.re.abs().max(1.0), "bin {j}");
        }
        let peak = tone_bin(&params, freq);
        let peak_power = baseline.spectrum[peak].re;
        for (j, value) in baseline.spectrum.iter().enumerate() {
            if j.abs_diff(peak) > 1 {
                assert!(value.re < peak_power / 3.0, "bin {j} not below peak");
            }
        }
    }

    #[test]
    fn test_cross_phase_of_delayed_tone() {
        // Station 1's tone lags by tau; with a zero delay model the cross
        // product at the tone bin carries phase 2π f τ.
        let params = test_params(2);
        let freq = RATE as f64 / 8.0;
        let tau = 0.25 / RATE as f64;
        let legs = vec![
            tone_leg(&params, 0, freq, 0.0),
            tone_leg(&params, 1, freq, -2.0 * std::f64::consts::PI * freq * tau),
        ];
        let records = correlate_slice(&params, &legs, None, None, &[]).unwrap();
        let cross = records[0]
            .baselines
            .iter()
            .find(|b| b.station1 == 0 && b.station2 == 1)
            .unwrap();
        let value = cross.spectrum[tone_bin(&params, freq)];
        let expected = 2.0 * std::f64::consts::PI * freq * tau;
        assert_abs_diff_eq!(value.im.atan2(value.re) as f64, expected, epsilon = 0.05);
    }

    #[test]
    fn test_delay_model_corrects_integer_sample_delay() {
        // Station 1 is delayed by exactly 3 samples and its model knows it;
        // after correction the residual phase vanishes.
        let params = test_params(2);
        let freq = RATE as f64 / 8.0;
        let k = 3.0;
        let tau = k / RATE as f64;
        let mut legs = vec![
            tone_leg(&params, 0, freq, 0.0),
            tone_leg(&params, 1, freq, -2.0 * std::f64::consts::PI * freq * tau),
        ];
        let t0 = params.slice_start - TimeDelta::from_seconds(1.0);
        let rows: Vec<DelayRow> = (0..10)
            .map(|i| DelayRow {
                time: t0 + TimeDelta::from_seconds(i as f64),
                u: 0.0,
                v: 0.0,
                w: 0.0,
                delay: tau,
            })
            .collect();
        legs[1].delays = vec![Some(DelayTable::from_rows(rows))];
        let records = correlate_slice(&params, &legs, None, None, &[]).unwrap();
        let cross = records[0]
            .baselines
            .iter()
            .find(|b| b.station1 == 0 && b.station2 == 1)
            .unwrap();
        let value = cross.spectrum[tone_bin(&params, freq)];
        assert_abs_diff_eq!(value.im.atan2(value.re) as f64, 0.0, epsilon = 0.05);
        // The shifted read runs off the end of the last window.
        assert!(cross.weight >= 1.0 - (NFFT as f32 / SLICE as f32) - 1e-6);
    }

    #[test]
    fn test_fractional_delay_correction() {
        let params = test_params(2);
        let freq = RATE as f64 / 8.0;
        let tau = 0.5 / RATE as f64;
        let mut legs = vec![
            tone_leg(&params, 0, freq, 0.0),
            tone_leg(&params, 1, freq, -2.0 * std::f64::consts::PI * freq * tau),
        ];
        let t0 = params.slice_start - TimeDelta::from_seconds(1.0);
        let rows: Vec<DelayRow> = (0..10)
            .map(|i| DelayRow {
                time: t0 + TimeDelta::from_seconds(i as f64),
                u: 0.0,
                v: 0.0,
                w: 0.0,
                delay: tau,
            })
            .collect();
        legs[1].delays = vec![Some(DelayTable::from_rows(rows))];
        let records = correlate_slice(&params, &legs, None, None, &[]).unwrap();
        let cross = records[0]
            .baselines
            .iter()
            .find(|b| b.station1 == 0 && b.station2 == 1)
            .unwrap();
        let value = cross.spectrum[tone_bin(&params, freq)];
        assert_abs_diff_eq!(value.im.atan2(value.re) as f64, 0.0, epsilon = 0.2);
    }

    #[test]
    fn test_short_station_zeroes_weight() {
        let params = test_params(2);
        let freq = RATE as f64 / 8.0;
        let mut legs = vec![
            tone_leg(&params, 0, freq, 0.0),
            tone_leg(&params, 1, freq, 0.0),
        ];
        // Station 1 delivered nothing.
        legs[1].samples = vec![0.0; SLICE];
        legs[1].valid_samples = 0;
        let records = correlate_slice(&params, &legs, None, None, &[]).unwrap();
        let auto0 = records[0]
            .baselines
            .iter()
            .find(|b| b.station1 == 0 && b.station2 == 0)
            .unwrap();
        let cross = records[0]
            .baselines
            .iter()
            .find(|b| b.station1 == 0 && b.station2 == 1)
            .unwrap();
        assert_abs_diff_eq!(auto0.weight, 1.0);
        assert_abs_diff_eq!(cross.weight, 0.0);
        assert!(cross.spectrum.iter().all(|v| v.re == 0.0 && v.im == 0.0));
    }

    #[test]
    fn test_cross_polarisation_products() {
        let mut params = test_params(2);
        params.cross_channel_nr = Some(1);
        params.cross_streams = params
            .station_streams
            .iter()
            .map(|s| {
                let mut s = s.clone();
                s.polarisation = 'L';
                s
            })
            .collect();
        let freq = RATE as f64 / 8.0;
        let legs: Vec<LegData> = (0..4)
            .map(|i| tone_leg(&params, i % 2, freq, 0.1 * i as f64))
            .collect();
        let records = correlate_slice(&params, &legs, None, None, &[]).unwrap();
        // 3 station pairs × 4 polarisation products.
        assert_eq!(records[0].baselines.len(), 12);
        let pol_pairs: Vec<(char, char)> = records[0]
            .baselines
            .iter()
            .filter(|b| b.station1 == 0 && b.station2 == 1)
            .map(|b| (b.pol1, b.pol2))
            .collect();
        assert_eq!(pol_pairs, vec![('R', 'R'), ('L', 'L'), ('R', 'L'), ('L', 'R')]);
    }

    #[test]
    fn test_pulsar_binning_routes_segments() {
        let mut params = test_params(1);
        params.pulsar_binning = true;
        let pulsar = PulsarParameters {
            name: "B0329+54".to_string(),
            interval: [0.0, 1.0],
            nbins: 4,
            ref_mjd: 57203.5,
            ref_phase: 0.0,
            // One pulse period per 4 segments, so the bins cycle.
            ref_f0: RATE as f64 / (4.0 * NFFT as f64),
            coefficients: vec![0.0],
        };
        let freq = RATE as f64 / 8.0;
        let legs = vec![tone_leg(&params, 0, freq, 0.0)];
        let records = correlate_slice(&params, &legs, None, Some(&pulsar), &[]).unwrap();
        // nbins + 1 records, one per bin.
        assert_eq!(records.len(), 5);
        let weights: f32 = records.iter().map(|r| r.baselines[0].weight).sum();
        assert_abs_diff_eq!(weights, 1.0, epsilon = 1e-6);
        // The on-pulse bins share the segments evenly; the off-pulse bin
        // is empty because the interval covers the whole turn.
        assert_abs_diff_eq!(records[4].baselines[0].weight, 0.0);
        for record in &records[..4] {
            assert!(record.baselines[0].weight > 0.0);
        }
    }

    #[test]
    fn test_multi_phase_center_identical_tables_agree() {
        let mut params = test_params(2);
        params.multi_phase_center = true;
        params.n_phase_centers = 2;
        params.phase_center_sources = vec!["SRC_A".to_string(), "SRC_B".to_string()];
        let freq = RATE as f64 / 8.0;
        let legs: Vec<LegData> = (0..2)
            .map(|i| {
                let mut leg = tone_leg(&params, i, freq, 0.2 * i as f64);
                // Both phase centres carry the same (zero) model.
                leg.delays = vec![None, None];
                leg
            })
            .collect();
        let sources = vec!["SRC_A".to_string(), "SRC_B".to_string()];
        let records = correlate_slice(&params, &legs, None, None, &sources).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source, "SRC_A");
        assert_eq!(records[1].source, "SRC_B");
        assert_eq!(records[0].baselines, records[1].baselines);
    }

    #[test]
    fn test_rebin_averages() {
        let spectrum: Vec<Complex<f64>> = (0..=8).map(|i| Complex::new(i as f64, 0.0)).collect();
        let out = rebin(&spectrum, 4);
        assert_eq!(out.len(), 4);
        assert_abs_diff_eq!(out[0].re, 0.5);
        assert_abs_diff_eq!(out[1].re, 2.5);
        // The final bin absorbs the odd input bin out.
        assert_abs_diff_eq!(out[3].re, 7.0);
    }

    #[test]
    fn test_rebin_identity_sizes() {
        // number_channels equal to the input bin count passes through.
        let spectrum: Vec<Complex<f64>> = (0..6).map(|i| Complex::new(i as f64, -1.0)).collect();
        let out = rebin(&spectrum, 6);
        assert_eq!(out.len(), 6);
        for (j, value) in out.iter().enumerate() {
            assert_abs_diff_eq!(value.re, j as f32);
            assert_abs_diff_eq!(value.im, -1.0);
        }
    }

    #[test]
    fn test_rate_mismatch_is_error() {
        let mut params = test_params(1);
        params.station_streams[0].sample_rate = RATE * 3 / 2;
        let legs = vec![LegData {
            stream: params.station_streams[0].clone(),
            samples: vec![0.0; SLICE],
            valid_samples: SLICE,
            applied_shift: 0,
            delays: vec![None],
        }];
        assert!(matches!(
            correlate_slice(&params, &legs, None, None, &[]),
            Err(CorrError::RateMismatch { .. })
        ));
    }

    #[test]
    fn test_contained_band_station_at_double_rate() {
        // Station 1 records 2× the band; the correlation cuts the common
        // half out, so a tone inside the common band still correlates with
        // full coherence.
        let mut params = test_params(2);
        params.station_streams[1].sample_rate = 2 * RATE;
        params.station_streams[1].bandwidth_hz = RATE as f64;
        let freq = RATE as f64 / 8.0;
        let values = quantised_tone(freq, 2 * RATE, 2 * SLICE, 0.0);
        let samples: Vec<f32> = values.iter().map(|&v| DECODE_2BIT[v as usize]).collect();
        let legs = vec![
            tone_leg(&params, 0, freq, 0.0),
            LegData {
                stream: params.station_streams[1].clone(),
                samples,
                valid_samples: 2 * SLICE,
                applied_shift: 0,
                delays: vec![None],
            },
        ];
        let records = correlate_slice(&params, &legs, None, None, &[]).unwrap();
        let cross = records[0]
            .baselines
            .iter()
            .find(|b| b.station1 == 0 && b.station2 == 1)
            .unwrap();
        let value = cross.spectrum[tone_bin(&params, freq)];
        assert!(value.norm() > 0.01, "no coherence: {value}");
        assert_abs_diff_eq!(value.im.atan2(value.re) as f64, 0.0, epsilon = 0.1);
    }
}
