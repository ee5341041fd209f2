//! Pulsar phase polynomials and bin routing.
//!
//! A polyco gives the pulse phase as a polynomial in minutes from a
//! reference time (the TEMPO convention: a reference phase, a rotation
//! frequency term, and the fitted coefficients). Samples are routed into
//! phase bins; everything outside the configured on-pulse interval lands in
//! the off-pulse bin, which is bin `nbins`.

use std::fs;
use std::io;
use std::path::Path;

use crate::msg::PulsarParameters;
use crate::time::Time;

/// The pulse phase at `t`, in turns.
pub fn pulse_phase(p: &PulsarParameters, t: Time) -> f64 {
    let t_mjd = t.mjd() as f64 + t.seconds_of_day() / 86_400.0;
    let dt_min = (t_mjd - p.ref_mjd) * 1440.0;
    let mut phase = p.ref_phase + 60.0 * p.ref_f0 * dt_min;
    let mut power = 1.0;
    for &coeff in &p.coefficients {
        phase += coeff * power;
        power *= dt_min;
    }
    phase
}

/// The bin an instant falls in: an on-pulse bin in `0..nbins`, or the
/// off-pulse bin `nbins`.
pub fn bin_for(p: &PulsarParameters, t: Time) -> usize {
    let frac = pulse_phase(p, t).rem_euclid(1.0);
    let [lo, hi] = p.interval;
    if frac < lo || frac >= hi {
        return p.nbins;
    }
    let bin = ((frac - lo) / (hi - lo) * p.nbins as f64) as usize;
    bin.min(p.nbins - 1)
}

/// Parse a TEMPO-style polyco file: a header line
/// `name dd-mmm-yy utc ref_mjd dm` followed by
/// `ref_phase ref_f0 site span ncoeff freq` and the coefficient lines.
pub fn parse_polyco(path: &Path, name: &str, interval: [f64; 2], nbins: usize)
    -> io::Result<PulsarParameters>
{
    let text = fs::read_to_string(path)?;
    let mut values = text.split_whitespace();
    let bad = |what: &str| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("polyco {}: missing {what}", path.display()),
        )
    };
    let _name = values.next().ok_or_else(|| bad("pulsar name"))?;
    let _date = values.next().ok_or_else(|| bad("date"))?;
    let _utc = values.next().ok_or_else(|| bad("utc"))?;
    let ref_mjd: f64 = values
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| bad("reference mjd"))?;
    let _dm = values.next().ok_or_else(|| bad("dm"))?;
    let ref_phase: f64 = values
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| bad("reference phase"))?;
    let ref_f0: f64 = values
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| bad("rotation frequency"))?;
    let _site = values.next().ok_or_else(|| bad("site"))?;
    let _span = values.next().ok_or_else(|| bad("span"))?;
    let ncoeff: usize = values
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| bad("coefficient count"))?;
    let _freq = values.next().ok_or_else(|| bad("observing frequency"))?;
    let coefficients = (0..ncoeff)
        .map(|_| {
            values
                .next()
                // Fortran exponent letters.
                .and_then(|v| v.replace(|c| c == 'D' || c == 'd', "E").parse().ok())
                .ok_or_else(|| bad("coefficient"))
        })
        .collect::<io::Result<Vec<f64>>>()?;
    Ok(PulsarParameters {
        name: name.to_string(),
        interval,
        nbins,
        ref_mjd,
        ref_phase,
        ref_f0,
        coefficients,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Write;
    use tempfile::tempdir;

    fn simple_pulsar() -> PulsarParameters {
        PulsarParameters {
            name: "B0329+54".to_string(),
            interval: [0.0, 1.0],
            nbins: 16,
            ref_mjd: 57203.5,
            ref_phase: 0.0,
            ref_f0: 1.399_541, // Hz
            coefficients: vec![0.0],
        }
    }

    #[test]
    fn test_phase_advances_at_f0() {
        let p = simple_pulsar();
        let t0 = Time::from_mjd_seconds(57203, 43200.0);
        let t1 = Time::from_mjd_seconds(57203, 43201.0);
        assert_abs_diff_eq!(pulse_phase(&p, t1) - pulse_phase(&p, t0), p.ref_f0, epsilon = 1e-9);
    }

    #[test]
    fn test_bins_cover_period() {
        let p = simple_pulsar();
        let t0 = Time::from_mjd_seconds(57203, 43200.0);
        let period = 1.0 / p.ref_f0;
        let mut seen = vec![false; p.nbins];
        for i in 0..160 {
            let t = t0 + crate::time::TimeDelta::from_seconds(i as f64 * period / 160.0);
            let bin = bin_for(&p, t);
            assert!(bin < p.nbins);
            seen[bin] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_off_pulse_bin() {
        let mut p = simple_pulsar();
        p.interval = [0.4, 0.6];
        let t0 = Time::from_mjd_seconds(57203, 43200.0);
        let period = 1.0 / p.ref_f0;
        let mut off = 0;
        for i in 0..100 {
            let t = t0 + crate::time::TimeDelta::from_seconds(i as f64 * period / 100.0);
            if bin_for(&p, t) == p.nbins {
                off += 1;
            }
        }
        // 80% of the period is off pulse.
        assert!((70..=90).contains(&off));
    }

    #[test]
    fn test_parse_polyco() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("polyco.dat");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "B0329+54  29-Jun-15   120000.00   57203.50000000   26.764").unwrap();
        writeln!(file, " 0.123456  1.39954153872  0 60 3 1642.250").unwrap();
        writeln!(file, " -1.2345678901D-06  3.4567890123D-09  -5.6789012345D-12").unwrap();
        let p = parse_polyco(&path, "B0329+54", [0.0, 1.0], 16).unwrap();
        assert_abs_diff_eq!(p.ref_mjd, 57203.5);
        assert_abs_diff_eq!(p.ref_phase, 0.123456);
        assert_eq!(p.coefficients.len(), 3);
        assert_abs_diff_eq!(p.coefficients[1], 3.4567890123e-9);
    }

    #[test]
    fn test_parse_polyco_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("polyco.dat");
        std::fs::write(&path, "B0329+54 29-Jun-15 120000.00").unwrap();
        assert!(parse_polyco(&path, "B0329+54", [0.0, 1.0], 16).is_err());
    }
}
