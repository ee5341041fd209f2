//! Per-station delay and UVW models.
//!
//! The geometric model is produced by an external program as a binary table
//! on disk, one file per station. A table holds one block per scan; each row
//! carries (time, u, v, w, delay). Between support points the delay is
//! interpolated linearly and the delay rate is the finite difference of the
//! bracketing rows. A per-scan clock offset and rate (from the station's
//! clock_early) is composed with the geometric model at evaluation time.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time::{Time, TimeDelta};

/// Magic number of a delay table file ("FXDT").
const DELAY_TABLE_MAGIC: u32 = 0x4654_4458;

/// The helper program invoked to produce a missing table.
pub const DELAY_GENERATOR: &str = "generate_delay_model";

/// Reader offsets are whole multiples of this, so large clock offsets move
/// the read cursor and only the residual enters the delay model.
const MAX_CLOCK_OFFSET_SEC: f64 = 1.0;

/// Errors raised while producing or reading a delay table
#[derive(Error, Debug)]
pub enum DelayError {
    /// The table file could not be read
    #[error("can't load delay table {path}: {source}")]
    Unreadable {
        /// Path of the table
        path: PathBuf,
        /// The underlying IO error
        source: io::Error,
    },

    /// The table file is not a delay table
    #[error("{path} is not a delay table (bad magic)")]
    BadMagic {
        /// Path of the table
        path: PathBuf,
    },

    /// The external generator failed or could not be started
    #[error("delay model generator failed for station {station}: {reason}")]
    GeneratorFailed {
        /// The station whose table was requested
        station: String,
        /// What went wrong
        reason: String,
    },

    /// No scan block covers the requested span
    #[error("delay table {path} does not cover {start} .. {stop}")]
    NotCovered {
        /// Path of the table
        path: PathBuf,
        /// Requested span start
        start: String,
        /// Requested span stop
        stop: String,
    },
}

/// One support point of the model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayRow {
    /// Support time
    pub time: Time,
    /// Baseline-projected coordinates, metres
    pub u: f64,
    pub v: f64,
    pub w: f64,
    /// Geometric delay, seconds (negative: wavefront arrives early)
    pub delay: f64,
}

/// The delay evaluated at an instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayPoint {
    /// Total delay in seconds, clock offset included
    pub delay: f64,
    /// Delay rate in s/s
    pub rate: f64,
}

/// The clock correction composed with the geometric model.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ClockOffset {
    /// Offset in seconds
    pub offset: f64,
    /// Rate in s/s
    pub rate: f64,
    /// Epoch the rate is referenced to
    pub epoch: Time,
}

/// A per-station delay table covering one scan, plus its clock correction.
///
/// Broadcast read-only to the input node and every correlator node; the
/// clock offset is set by the manager before the broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayTable {
    rows: Vec<DelayRow>,
    clock: ClockOffset,
}

impl DelayTable {
    /// Load the scan block covering `[start, stop)` from a table file.
    pub fn open(path: &Path, start: Time, stop: Time) -> Result<Self, DelayError> {
        let file = File::open(path).map_err(|source| DelayError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let mut reader = BufReader::new(file);
        let wrap = |source| DelayError::Unreadable {
            path: path.to_path_buf(),
            source,
        };
        let magic = reader.read_u32::<LittleEndian>().map_err(wrap)?;
        if magic != DELAY_TABLE_MAGIC {
            return Err(DelayError::BadMagic {
                path: path.to_path_buf(),
            });
        }
        let _version = reader.read_u32::<LittleEndian>().map_err(wrap)?;
        loop {
            let n_rows = match reader.read_u32::<LittleEndian>() {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(wrap(e)),
            };
            let mut rows = Vec::with_capacity(n_rows as usize);
            for _ in 0..n_rows {
                let ticks = reader.read_i64::<LittleEndian>().map_err(wrap)?;
                let mut vals = [0f64; 4];
                reader
                    .read_f64_into::<LittleEndian>(&mut vals)
                    .map_err(wrap)?;
                rows.push(DelayRow {
                    time: Time::from_ticks(ticks),
                    u: vals[0],
                    v: vals[1],
                    w: vals[2],
                    delay: vals[3],
                });
            }
            if let (Some(first), Some(last)) = (rows.first(), rows.last()) {
                if first.time <= start && stop <= last.time {
                    return Ok(Self {
                        rows,
                        clock: ClockOffset::default(),
                    });
                }
            }
        }
        Err(DelayError::NotCovered {
            path: path.to_path_buf(),
            start: start.date_string(),
            stop: stop.date_string(),
        })
    }

    /// Write scan blocks to a table file. The inverse of [`DelayTable::open`],
    /// used by tests and by the generator shim.
    pub fn write_blocks(path: &Path, blocks: &[Vec<DelayRow>]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_u32::<LittleEndian>(DELAY_TABLE_MAGIC)?;
        writer.write_u32::<LittleEndian>(1)?;
        for rows in blocks {
            writer.write_u32::<LittleEndian>(rows.len() as u32)?;
            for row in rows {
                writer.write_i64::<LittleEndian>(row.time.ticks())?;
                writer.write_f64::<LittleEndian>(row.u)?;
                writer.write_f64::<LittleEndian>(row.v)?;
                writer.write_f64::<LittleEndian>(row.w)?;
                writer.write_f64::<LittleEndian>(row.delay)?;
            }
        }
        writer.flush()
    }

    /// A table from rows already in memory (tests, single-scan runs).
    pub fn from_rows(rows: Vec<DelayRow>) -> Self {
        Self {
            rows,
            clock: ClockOffset::default(),
        }
    }

    /// Compose a clock correction with the geometric model.
    pub fn set_clock_offset(&mut self, clock: ClockOffset) {
        self.clock = clock;
    }

    pub fn clock_offset(&self) -> ClockOffset {
        self.clock
    }

    /// Whether the table covers `t`.
    pub fn covers(&self, t: Time) -> bool {
        match (self.rows.first(), self.rows.last()) {
            (Some(first), Some(last)) => first.time <= t && t <= last.time,
            _ => false,
        }
    }

    fn bracket(&self, t: Time) -> (&DelayRow, &DelayRow) {
        let idx = self
            .rows
            .partition_point(|row| row.time <= t)
            .clamp(1, self.rows.len() - 1);
        (&self.rows[idx - 1], &self.rows[idx])
    }

    /// The total delay and rate at `t`.
    pub fn eval(&self, t: Time) -> DelayPoint {
        let (a, b) = self.bracket(t);
        let span = (b.time - a.time).as_seconds();
        let frac = (t - a.time).as_seconds() / span;
        let geometric = a.delay + (b.delay - a.delay) * frac;
        let geometric_rate = (b.delay - a.delay) / span;
        let clock = self.clock.offset + self.clock.rate * (t - self.clock.epoch).as_seconds();
        DelayPoint {
            delay: geometric + clock,
            rate: geometric_rate + self.clock.rate,
        }
    }

    /// The interpolated (u, v, w) at `t`.
    pub fn uvw(&self, t: Time) -> [f64; 3] {
        let (a, b) = self.bracket(t);
        let frac = (t - a.time).as_seconds() / (b.time - a.time).as_seconds();
        [
            a.u + (b.u - a.u) * frac,
            a.v + (b.v - a.v) * frac,
            a.w + (b.w - a.w) * frac,
        ]
    }
}

/// Split a clock offset into a whole number of seconds absorbed by moving
/// the input read cursor, and a residual for the delay model. Offsets under
/// half a second pass through unchanged.
pub fn split_clock_offset(offset_sec: f64) -> (TimeDelta, f64) {
    let reader_offset = (offset_sec / MAX_CLOCK_OFFSET_SEC).round() * MAX_CLOCK_OFFSET_SEC;
    (
        TimeDelta::from_seconds(reader_offset),
        offset_sec - reader_offset,
    )
}

/// The delay table path for a station, invoking the external generator when
/// the file is absent. A generator failure is fatal: a run with a missing
/// delay model is not scientifically useful.
pub fn ensure_delay_table(
    delay_directory: &Path,
    station: &str,
    vex_path: &Path,
) -> Result<PathBuf, DelayError> {
    let path = delay_directory.join(format!("{station}.del"));
    if path.exists() {
        return Ok(path);
    }
    let status = Command::new(DELAY_GENERATOR)
        .arg(vex_path)
        .arg(station)
        .arg(&path)
        .status()
        .map_err(|e| DelayError::GeneratorFailed {
            station: station.to_string(),
            reason: e.to_string(),
        })?;
    if !status.success() {
        return Err(DelayError::GeneratorFailed {
            station: station.to_string(),
            reason: format!("exit status {status}"),
        });
    }
    if !path.exists() {
        return Err(DelayError::GeneratorFailed {
            station: station.to_string(),
            reason: "generator reported success but produced no file".to_string(),
        });
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimeDelta;
    use approx::assert_abs_diff_eq;
    use tempfile::tempdir;

    fn linear_rows(start: Time, n: usize, step_sec: f64, delay0: f64, rate: f64) -> Vec<DelayRow> {
        (0..n)
            .map(|i| {
                let dt = i as f64 * step_sec;
                DelayRow {
                    time: start + TimeDelta::from_seconds(dt),
                    u: 1000.0 + dt,
                    v: -500.0,
                    w: 2.0 * dt,
                    delay: delay0 + rate * dt,
                }
            })
            .collect()
    }

    #[test]
    fn test_round_trip_and_scan_block_selection() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Ef.del");
        let scan1_start = Time::from_mjd_seconds(57203, 43200.0);
        let scan2_start = Time::from_mjd_seconds(57203, 43500.0);
        let blocks = vec![
            linear_rows(scan1_start, 31, 10.0, -1e-3, 1e-9),
            linear_rows(scan2_start, 31, 10.0, -2e-3, -1e-9),
        ];
        DelayTable::write_blocks(&path, &blocks).unwrap();

        let stop = scan2_start + TimeDelta::from_seconds(300.0);
        let table = DelayTable::open(&path, scan2_start, stop).unwrap();
        let p = table.eval(scan2_start + TimeDelta::from_seconds(15.0));
        assert_abs_diff_eq!(p.delay, -2e-3 - 1e-9 * 15.0, epsilon = 1e-15);
        assert_abs_diff_eq!(p.rate, -1e-9, epsilon = 1e-15);
    }

    #[test]
    fn test_open_uncovered_span_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Ef.del");
        let start = Time::from_mjd_seconds(57203, 43200.0);
        DelayTable::write_blocks(&path, &[linear_rows(start, 4, 10.0, 0.0, 0.0)]).unwrap();
        let late = start + TimeDelta::from_seconds(3600.0);
        assert!(matches!(
            DelayTable::open(&path, late, late + TimeDelta::from_seconds(10.0)),
            Err(DelayError::NotCovered { .. })
        ));
    }

    #[test]
    fn test_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.del");
        std::fs::write(&path, b"not a delay table at all").unwrap();
        let t = Time::from_mjd_seconds(57203, 0.0);
        assert!(matches!(
            DelayTable::open(&path, t, t + TimeDelta::from_seconds(1.0)),
            Err(DelayError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_interpolation_exact_on_support_points() {
        let start = Time::from_mjd_seconds(57203, 0.0);
        let rows = linear_rows(start, 10, 1.0, 5e-6, 2e-12);
        let table = DelayTable::from_rows(rows.clone());
        for row in &rows[..rows.len() - 1] {
            assert_abs_diff_eq!(table.eval(row.time).delay, row.delay, epsilon = 1e-18);
        }
    }

    #[test]
    fn test_clock_offset_composition() {
        let start = Time::from_mjd_seconds(57203, 0.0);
        let table = {
            let mut t = DelayTable::from_rows(linear_rows(start, 10, 1.0, 0.0, 0.0));
            t.set_clock_offset(ClockOffset {
                offset: 1e-6,
                rate: 1.2e-8,
                epoch: start,
            });
            t
        };
        let p = table.eval(start + TimeDelta::from_seconds(2.0));
        assert_abs_diff_eq!(p.delay, 1e-6 + 1.2e-8 * 2.0, epsilon = 1e-18);
        assert_abs_diff_eq!(p.rate, 1.2e-8, epsilon = 1e-18);
    }

    #[test]
    fn test_uvw_interpolation() {
        let start = Time::from_mjd_seconds(57203, 0.0);
        let table = DelayTable::from_rows(linear_rows(start, 10, 1.0, 0.0, 0.0));
        let uvw = table.uvw(start + TimeDelta::from_seconds(2.5));
        assert_abs_diff_eq!(uvw[0], 1002.5);
        assert_abs_diff_eq!(uvw[1], -500.0);
        assert_abs_diff_eq!(uvw[2], 5.0);
    }

    #[test]
    fn test_split_clock_offset() {
        let (reader, residual) = split_clock_offset(1.000001);
        assert_eq!(reader, TimeDelta::from_seconds(1.0));
        assert_abs_diff_eq!(residual, 1e-6, epsilon = 1e-12);

        let (reader, residual) = split_clock_offset(-2.3e-6);
        assert!(reader.is_zero());
        assert_abs_diff_eq!(residual, -2.3e-6);
    }

    #[test]
    fn test_missing_generator_is_fatal() {
        let dir = tempdir().unwrap();
        let err = ensure_delay_table(dir.path(), "Xx", Path::new("exper.vex")).unwrap_err();
        assert!(matches!(err, DelayError::GeneratorFailed { .. }));
    }
}
