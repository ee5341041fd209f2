//! Station calibration tables.
//!
//! A calibration table carries per-(station, polarisation, IF) rows of
//! delay, rate, complex gain, weight and dispersive delay sampled in time.
//! When a table is configured, the correlator node multiplies each station
//! spectrum by the interpolated complex correction before accumulation.
//! Rows whose weight falls below the cutoff are skipped, so the bracketing
//! rows of an instant are the nearest *usable* rows, which may differ
//! between subbands.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use num_complex::Complex;
use thiserror::Error;

use crate::time::{Time, TimeDelta};
use crate::vex::Sideband;

/// Rows with a weight below this are unusable.
const MINIMUM_WEIGHT: f64 = 0.001;

const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Errors raised while reading or applying a calibration table
#[derive(Error, Debug)]
pub enum CalError {
    /// The table could not be read
    #[error("could not open CL table {path}: {source}")]
    Unreadable {
        /// Path of the table
        path: PathBuf,
        /// The underlying IO error
        source: io::Error,
    },

    /// The table ended in the middle of a row
    #[error("premature end of CL table {path}")]
    Truncated {
        /// Path of the table
        path: PathBuf,
    },

    /// A requested frequency has no IF in the table
    #[error("requested frequency {freq_hz} Hz not in CL table")]
    FrequencyNotFound {
        /// The frequency that was looked up
        freq_hz: f64,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct CalEntry {
    delay: f64,
    rate: f64,
    gain: Complex<f64>,
    weight: f64,
    disp_delay: f64,
}

/// A loaded calibration table.
#[derive(Debug, Clone)]
pub struct CalTable {
    nchan: usize,
    nstation: usize,
    npol: usize,
    nif: usize,
    /// IF reference frequencies, Hz
    frequencies: Vec<f64>,
    /// IF bandwidths, Hz
    bandwidths: Vec<f64>,
    /// Row timestamps
    times: Vec<Time>,
    /// entries[row][station][pol * nif + if_nr]
    entries: Vec<Vec<Vec<CalEntry>>>,
}

impl CalTable {
    /// Read a table from disk. `nchan` is the correlator's output channel
    /// count, which the correction is evaluated over.
    pub fn open(path: &Path, nchan: usize) -> Result<Self, CalError> {
        let file = File::open(path).map_err(|source| CalError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let mut r = BufReader::new(file);
        let wrap = |source: io::Error| {
            if source.kind() == io::ErrorKind::UnexpectedEof {
                CalError::Truncated {
                    path: path.to_path_buf(),
                }
            } else {
                CalError::Unreadable {
                    path: path.to_path_buf(),
                    source,
                }
            }
        };
        let start_mjd = r.read_i32::<LittleEndian>().map_err(wrap)?;
        let _nchan_cal = r.read_i32::<LittleEndian>().map_err(wrap)?;
        let nstation = r.read_i32::<LittleEndian>().map_err(wrap)? as usize;
        let npol = r.read_i32::<LittleEndian>().map_err(wrap)? as usize;
        let nif = r.read_i32::<LittleEndian>().map_err(wrap)? as usize;
        let mut frequencies = vec![0f64; nif];
        r.read_f64_into::<LittleEndian>(&mut frequencies).map_err(wrap)?;
        let mut bandwidths = vec![0f64; nif];
        r.read_f64_into::<LittleEndian>(&mut bandwidths).map_err(wrap)?;

        let mut times = Vec::new();
        let mut entries = Vec::new();
        let mut buffer = vec![0f64; nstation * npol * nif * 6];
        loop {
            let time_usec = match r.read_i64::<LittleEndian>() {
                Ok(t) => t,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(wrap(e)),
            };
            let _interval = r.read_i64::<LittleEndian>().map_err(wrap)?;
            r.read_f64_into::<LittleEndian>(&mut buffer).map_err(wrap)?;
            let mut row = Vec::with_capacity(nstation);
            let mut j = 0;
            for _station in 0..nstation {
                let mut per_station = vec![CalEntry::default(); npol * nif];
                for pol in 0..npol {
                    for if_nr in 0..nif {
                        let gain = Complex::new(buffer[j + 2], buffer[j + 3]);
                        let norm = gain.norm().max(1.0);
                        per_station[pol * nif + if_nr] = CalEntry {
                            delay: buffer[j],
                            rate: buffer[j + 1],
                            gain: gain / (norm * norm),
                            weight: buffer[j + 4],
                            disp_delay: buffer[j + 5],
                        };
                        j += 6;
                    }
                }
                row.push(per_station);
            }
            times.push(Time::from_mjd_seconds(start_mjd as i64, 0.0) + TimeDelta::from_usec(time_usec));
            entries.push(row);
        }

        Ok(Self {
            nchan,
            nstation,
            npol,
            nif,
            frequencies,
            bandwidths,
            times,
            entries,
        })
    }

    pub fn nstation(&self) -> usize {
        self.nstation
    }

    /// The IF index matching a channel's sky frequency, accounting for the
    /// table referencing lower sidebands from the upper band edge.
    fn if_index(&self, freq_hz: f64, sideband: Sideband) -> Result<usize, CalError> {
        for (i, &f) in self.frequencies.iter().enumerate() {
            let delta = self.bandwidths[i] / self.nchan as f64;
            let reference = match sideband {
                Sideband::Upper => f,
                Sideband::Lower => f - (self.bandwidths[i] - delta),
            };
            if (freq_hz - reference).abs() < 1.0 {
                return Ok(i);
            }
        }
        Err(CalError::FrequencyNotFound { freq_hz })
    }

    /// The nearest usable rows bracketing `t` for one (station, pol, IF).
    fn usable_bracket(&self, t: Time, station: usize, idx: usize) -> Option<(usize, usize)> {
        let usable = |row: usize| self.entries[row][station][idx].weight >= MINIMUM_WEIGHT;
        let mut before = None;
        let mut after = None;
        for row in 0..self.times.len() {
            if !usable(row) {
                continue;
            }
            if self.times[row] <= t {
                before = Some(row);
            } else {
                after = Some(row);
                break;
            }
        }
        match (before, after) {
            (Some(a), Some(b)) => Some((a, b)),
            _ => None,
        }
    }

    /// The per-channel correction for one station spectrum, or a unit table
    /// when no usable rows bracket `t`.
    pub fn corrections(
        &self,
        t: Time,
        station: usize,
        freq_hz: f64,
        sideband: Sideband,
        polarisation: char,
    ) -> Result<Vec<Complex<f32>>, CalError> {
        use std::f64::consts::PI;

        let if_nr = self.if_index(freq_hz, sideband)?;
        let pol_nr = if polarisation.to_ascii_uppercase() == 'R' {
            0
        } else {
            self.npol - 1
        };
        let idx = pol_nr * self.nif + if_nr;
        let n = self.nchan + 1;

        let Some((current, next)) = self.usable_bracket(t, station, idx) else {
            return Ok(vec![Complex::new(1.0, 0.0); n]);
        };
        let span = (self.times[next] - self.times[current]).as_seconds();
        let dt = (t - self.times[current]).as_seconds();
        let (w1, w2) = ((span - dt) / span, dt / span);

        let e1 = self.entries[current][station][idx];
        let e2 = self.entries[next][station][idx];
        let delay = w1 * e1.delay + w2 * e2.delay;
        let freq = self.frequencies[if_nr];
        // Interpolate the rate through complex phasors so a phase wrap
        // between rows doesn't tear the interpolation.
        let ph1 = 2.0 * PI * e1.rate * freq * dt;
        let ph2 = 2.0 * PI * e2.rate * freq * (dt - span);
        let ph_rate = (w1 * ph1.sin() + w2 * ph2.sin()).atan2(w1 * ph1.cos() + w2 * ph2.cos());
        let gain = w1 * e1.gain + w2 * e2.gain;
        let phase = gain.im.atan2(gain.re);
        let amplitude = w1 * e1.gain.norm() + w2 * e2.gain.norm();
        let ddelay = w1 * e1.disp_delay + w2 * e2.disp_delay;

        let df = self.bandwidths[if_nr] / self.nchan as f64;
        let mut table = vec![Complex::new(0f32, 0f32); n];
        match sideband {
            Sideband::Lower => {
                for i in 0..n {
                    let mut phi = 2.0 * PI * (i as f64 * df * delay) + ph_rate + phase;
                    let frac = SPEED_OF_LIGHT * SPEED_OF_LIGHT / (freq - df + (i + 1) as f64 * df);
                    phi += 2.0 * PI * frac * ddelay;
                    table[n - 1 - i] =
                        Complex::new((amplitude * phi.cos()) as f32, (amplitude * phi.sin()) as f32);
                }
            }
            Sideband::Upper => {
                for (i, out) in table.iter_mut().enumerate() {
                    let mut phi = -2.0 * PI * (i as f64 * df * delay) - ph_rate - phase;
                    let frac = SPEED_OF_LIGHT * SPEED_OF_LIGHT / (freq + i as f64 * df);
                    phi += -2.0 * PI * frac * ddelay;
                    *out =
                        Complex::new((amplitude * phi.cos()) as f32, (amplitude * phi.sin()) as f32);
                }
            }
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use byteorder::WriteBytesExt;
    use std::io::Write;
    use tempfile::tempdir;

    /// Write a 1-station, 1-pol, 1-IF table with the given rows of
    /// (time_usec, delay, rate, gain, weight, disp_delay).
    fn write_table(path: &Path, rows: &[(i64, f64, f64, Complex<f64>, f64, f64)]) {
        let mut buf = Vec::new();
        buf.write_i32::<LittleEndian>(57203).unwrap(); // start MJD
        buf.write_i32::<LittleEndian>(16).unwrap(); // table channel count
        buf.write_i32::<LittleEndian>(1).unwrap(); // stations
        buf.write_i32::<LittleEndian>(1).unwrap(); // pols
        buf.write_i32::<LittleEndian>(1).unwrap(); // IFs
        buf.write_f64::<LittleEndian>(1642.25e6).unwrap(); // IF freq
        buf.write_f64::<LittleEndian>(16e6).unwrap(); // IF bandwidth
        for &(t, delay, rate, gain, weight, disp) in rows {
            buf.write_i64::<LittleEndian>(t).unwrap();
            buf.write_i64::<LittleEndian>(30_000_000).unwrap(); // interval
            for v in [delay, rate, gain.re, gain.im, weight, disp] {
                buf.write_f64::<LittleEndian>(v).unwrap();
            }
        }
        File::create(path).unwrap().write_all(&buf).unwrap();
    }

    fn t_usec(usec: i64) -> Time {
        Time::from_mjd_seconds(57203, 0.0) + TimeDelta::from_usec(usec)
    }

    #[test]
    fn test_header_and_row_parsing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cal.bin");
        write_table(
            &path,
            &[
                (0, 1e-9, 0.0, Complex::new(1.0, 0.0), 1.0, 0.0),
                (60_000_000, 1e-9, 0.0, Complex::new(1.0, 0.0), 1.0, 0.0),
            ],
        );
        let table = CalTable::open(&path, 16).unwrap();
        assert_eq!(table.nstation(), 1);
        assert_eq!(table.times.len(), 2);
    }

    #[test]
    fn test_truncated_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cal.bin");
        std::fs::write(&path, [0u8; 10]).unwrap();
        assert!(matches!(
            CalTable::open(&path, 16),
            Err(CalError::Truncated { .. })
        ));
    }

    #[test]
    fn test_low_weight_rows_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cal.bin");
        // The middle row is below the weight cutoff; interpolation at its
        // timestamp must bridge the outer rows instead of using it.
        write_table(
            &path,
            &[
                (0, 1e-9, 0.0, Complex::new(1.0, 0.0), 1.0, 0.0),
                (30_000_000, 1e-3, 0.0, Complex::new(1.0, 0.0), 0.0005, 0.0),
                (60_000_000, 3e-9, 0.0, Complex::new(1.0, 0.0), 1.0, 0.0),
            ],
        );
        let table = CalTable::open(&path, 16).unwrap();
        let corr = table
            .corrections(t_usec(30_000_000), 0, 1642.25e6, Sideband::Upper, 'R')
            .unwrap();
        // Midpoint of 1e-9 and 3e-9 is 2e-9: the phase slope across the band
        // is -2π · df·i · 2e-9.
        let df = 16e6 / 16.0;
        let expected_phase = -2.0 * std::f64::consts::PI * df * 2e-9;
        let got_phase = (corr[1].im as f64).atan2(corr[1].re as f64);
        assert_abs_diff_eq!(got_phase, expected_phase, epsilon = 1e-6);
    }

    #[test]
    fn test_outside_rows_gives_unit_correction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cal.bin");
        write_table(
            &path,
            &[
                (0, 1e-9, 0.0, Complex::new(0.5, 0.0), 1.0, 0.0),
                (30_000_000, 1e-9, 0.0, Complex::new(0.5, 0.0), 1.0, 0.0),
            ],
        );
        let table = CalTable::open(&path, 16).unwrap();
        let corr = table
            .corrections(t_usec(90_000_000), 0, 1642.25e6, Sideband::Upper, 'R')
            .unwrap();
        assert!(corr.iter().all(|c| (c.re - 1.0).abs() < 1e-6 && c.im.abs() < 1e-6));
    }

    #[test]
    fn test_unknown_frequency_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cal.bin");
        write_table(&path, &[(0, 0.0, 0.0, Complex::new(1.0, 0.0), 1.0, 0.0)]);
        let table = CalTable::open(&path, 16).unwrap();
        assert!(matches!(
            table.corrections(t_usec(0), 0, 999e6, Sideband::Upper, 'R'),
            Err(CalError::FrequencyNotFound { .. })
        ));
    }
}
