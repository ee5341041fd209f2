//! Window functions applied before the correlation FFT.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// The window applied to each correlation segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WindowFunction {
    Rectangular,
    Cosine,
    Hamming,
    Hann,
    /// Prototype filter of a polyphase filter bank; evaluated over the full
    /// segment like the other windows.
    Pfb,
    None,
}

impl WindowFunction {
    /// Evaluate the window over `n` points. `None` and `Rectangular` both
    /// produce a flat window; they differ only in how overlapping segments
    /// are scheduled by the caller.
    pub fn coefficients(self, n: usize) -> Vec<f64> {
        match self {
            WindowFunction::Rectangular | WindowFunction::None => vec![1.0; n],
            WindowFunction::Cosine => (0..n)
                .map(|i| (PI * (i as f64 + 0.5) / n as f64).sin())
                .collect(),
            WindowFunction::Hamming => (0..n)
                .map(|i| 0.54 - 0.46 * (2.0 * PI * i as f64 / (n - 1) as f64).cos())
                .collect(),
            WindowFunction::Hann => (0..n)
                .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / (n - 1) as f64).cos())
                .collect(),
            WindowFunction::Pfb => {
                // sinc × Hann prototype, one tap per point
                (0..n)
                    .map(|i| {
                        let x = i as f64 / (n - 1) as f64 - 0.5;
                        let sinc = if x == 0.0 { 1.0 } else { (PI * x).sin() / (PI * x) };
                        let hann = 0.5 - 0.5 * (2.0 * PI * i as f64 / (n - 1) as f64).cos();
                        sinc * hann
                    })
                    .collect()
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_flat_windows() {
        assert!(WindowFunction::Rectangular
            .coefficients(16)
            .iter()
            .all(|&w| w == 1.0));
        assert!(WindowFunction::None.coefficients(16).iter().all(|&w| w == 1.0));
    }

    #[test]
    fn test_hann_endpoints_and_symmetry() {
        let w = WindowFunction::Hann.coefficients(64);
        assert_abs_diff_eq!(w[0], 0.0);
        assert_abs_diff_eq!(w[63], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(w[31], w[32], epsilon = 1e-12);
    }

    #[test]
    fn test_hamming_endpoints() {
        let w = WindowFunction::Hamming.coefficients(64);
        assert_abs_diff_eq!(w[0], 0.08, epsilon = 1e-12);
        assert_abs_diff_eq!(w[63], 0.08, epsilon = 1e-12);
    }

    #[test]
    fn test_serde_names() {
        let w: WindowFunction = serde_json::from_str("\"HANN\"").unwrap();
        assert_eq!(w, WindowFunction::Hann);
        let w: WindowFunction = serde_json::from_str("\"RECTANGULAR\"").unwrap();
        assert_eq!(w, WindowFunction::Rectangular);
    }
}
