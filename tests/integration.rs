//! End-to-end correlation of two synthetic Mark5B stations over the full
//! process set: manager, log node, output node, two input nodes and two
//! correlator nodes wired over loopback TCP.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use approx::assert_abs_diff_eq;
use tempfile::tempdir;

use fxcorr::cluster::run_cluster;
use fxcorr::context::RunContext;
use fxcorr::control::ControlFile;
use fxcorr::delay::{DelayRow, DelayTable};
use fxcorr::output::{GlobalHeader, VisibilityRecord};
use fxcorr::test_common::mark5b::{synthetic_recording, Mark5bTestConfig};
use fxcorr::test_common::quantised_tone;
use fxcorr::time::{Time, TimeDelta};
use fxcorr::vex::Vex;

const SAMPLE_RATE: u64 = 2_000_000;
/// 102.4 ms: 4 sub-slices of 25.6 ms, each an exact number of 256-point
/// FFT windows at 2 Ms/s.
const INTEGR_USEC: f64 = 102_400.0;
const SLICES_PER_INTEGRATION: usize = 4;
const N_INTEGRATIONS: usize = 2;
const NUMBER_CHANNELS: usize = 128;
const TONE_HZ: f64 = 250_000.0;

fn scan_start() -> Time {
    Time::parse_vex("2015y181d12h00m00s").unwrap()
}

fn write_recording(path: &Path, n_samples: usize) {
    // Both stations record the same quantised tone, so every baseline is
    // fully coherent.
    let tone = quantised_tone(TONE_HZ, SAMPLE_RATE, n_samples, 0.0);
    let cfg = Mark5bTestConfig {
        n_channels: 1,
        bits_per_sample: 2,
        sample_rate: SAMPLE_RATE,
        start: scan_start(),
        garbage_prefix: 0,
    };
    let n_frames = n_samples / 2500 + 2;
    let data = synthetic_recording(&cfg, n_frames, &|_c, i| {
        tone.get(i).copied().unwrap_or(0)
    });
    std::fs::write(path, data).unwrap();
}

fn write_delay_table(path: &Path) {
    let t0 = scan_start() - TimeDelta::from_seconds(2.0);
    let rows: Vec<DelayRow> = (0..8)
        .map(|i| DelayRow {
            time: t0 + TimeDelta::from_seconds(i as f64),
            u: 0.0,
            v: 0.0,
            w: 0.0,
            delay: 0.0,
        })
        .collect();
    DelayTable::write_blocks(path, &[rows]).unwrap();
}

fn test_vex() -> serde_json::Value {
    serde_json::json!({
        "version": 2.0,
        "exper": { "name": "FXTEST", "start": "2015y181d12h00m00s" },
        "sched": {
            "No0001": {
                "start": "2015y181d12h00m00s",
                "mode": "testmode",
                "sources": ["J1159+2914"],
                "stations": [
                    { "station": "Ef", "data_stop_sec": 1.0 },
                    { "station": "Wb", "data_stop_sec": 1.0 }
                ]
            }
        },
        "modes": {
            "testmode": {
                "freq": { "Ef": "freqA", "Wb": "freqA" },
                "bbc": { "Ef": "bbcA", "Wb": "bbcA" },
                "if": { "Ef": "ifA", "Wb": "ifA" },
                "bitstreams": { "Ef": "bsA", "Wb": "bsA" }
            }
        },
        "stations": {
            "Ef": { "clock": "Ef" },
            "Wb": { "clock": "Wb" }
        },
        "freq": {
            "freqA": {
                "channels": [
                    { "name": "CH01", "sky_freq_hz": 0.0, "bandwidth_hz": 1.0e6,
                      "sideband": "U", "bbc": "BBC01" }
                ]
            }
        },
        "bbcs": { "bbcA": { "BBC01": "IF_R" } },
        "ifs": { "ifA": { "IF_R": "R" } },
        "bitstreams": {
            "bsA": {
                "sample_rate": 2.0e6,
                // The synthetic generator packs channel 0 as magnitude on
                // bitstream 0, sign on bitstream 1.
                "streams": [
                    { "channel": "CH01", "sign_bit": 1, "magnitude_bit": 0 }
                ]
            }
        },
        "clocks": {
            "Ef": [ { "valid_from": "2015y181d00h00m00s", "clock_early_sec": 0.0 } ],
            "Wb": [ { "valid_from": "2015y181d00h00m00s", "clock_early_sec": 0.0 } ]
        }
    })
}

fn read_output(path: &Path) -> (GlobalHeader, Vec<VisibilityRecord>) {
    let mut file = File::open(path).unwrap();
    let header = GlobalHeader::decode(&mut file).unwrap();
    let mut records = Vec::new();
    loop {
        match VisibilityRecord::decode(&mut file) {
            Ok(record) => records.push(record),
            Err(_) => break,
        }
    }
    (header, records)
}

#[test]
fn two_station_correlation_end_to_end() {
    let tmp = tempdir().unwrap();
    let n_samples =
        (N_INTEGRATIONS as f64 * INTEGR_USEC * 1e-6 * SAMPLE_RATE as f64) as usize + 10_000;
    let ef_path = tmp.path().join("ef.m5b");
    let wb_path = tmp.path().join("wb.m5b");
    write_recording(&ef_path, n_samples);
    write_recording(&wb_path, n_samples);

    let delay_dir = tmp.path().join("delays");
    std::fs::create_dir(&delay_dir).unwrap();
    write_delay_table(&delay_dir.join("Ef.del"));
    write_delay_table(&delay_dir.join("Wb.del"));

    let vex_path = tmp.path().join("exper.vex.json");
    std::fs::write(&vex_path, serde_json::to_string(&test_vex()).unwrap()).unwrap();

    let output_path = tmp.path().join("out.cor");
    let stop = scan_start()
        + TimeDelta::from_usec((N_INTEGRATIONS as f64 * INTEGR_USEC) as i64);
    let mut control: ControlFile = serde_json::from_value(serde_json::json!({
        "start": scan_start().date_string(),
        "stop": stop.date_string(),
        "integr_time": INTEGR_USEC,
        "slices_per_integration": SLICES_PER_INTEGRATION,
        "number_channels": NUMBER_CHANNELS,
        "window_function": "HANN",
        "stations": ["Ef", "Wb"],
        "data_sources": {
            "Ef": [format!("file://{}", ef_path.display())],
            "Wb": [format!("file://{}", wb_path.display())]
        },
        "delay_directory": format!("file://{}", delay_dir.display()),
        "output_file": format!("file://{}", output_path.display())
    }))
    .unwrap();
    control.apply_defaults();
    control.validate().unwrap();

    let vex = Vex::from_json(&serde_json::to_string(&test_vex()).unwrap()).unwrap();
    let ctx = RunContext {
        control,
        vex,
        seed: 1,
        deterministic: true,
        strict_slice_accounting: false,
        clock_rate_unitless_usec_per_sec: true,
        check_interval: 100,
    };
    run_cluster(Arc::new(ctx), vex_path, 2).unwrap();

    let (header, records) = read_output(&output_path);
    assert_eq!(header.experiment, "FXTEST");
    assert_eq!(header.number_channels, NUMBER_CHANNELS as u32);
    assert_eq!(header.integration_time_usec, INTEGR_USEC as i64);
    assert_eq!(header.sources, vec!["J1159+2914".to_string()]);

    // One record per (integration, sub-slice), in dense slice order.
    let expected_records = N_INTEGRATIONS * SLICES_PER_INTEGRATION;
    assert_eq!(records.len(), expected_records);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.slice_nr, i as i64);
        assert_eq!(record.channel_nr, 0);
        assert_eq!(record.source, "J1159+2914");
        // Baselines (0,0), (0,1), (1,1).
        assert_eq!(record.baselines.len(), 3);
        for baseline in &record.baselines {
            assert_eq!(baseline.spectrum.len(), NUMBER_CHANNELS);
            assert_abs_diff_eq!(baseline.weight, 1.0);
        }
    }

    // Autocorrelations are real and non-negative; every baseline peaks at
    // the tone bin.
    let tone_bin = (TONE_HZ / (1.0e6 / NUMBER_CHANNELS as f64)).round() as usize;
    for record in &records {
        for baseline in &record.baselines {
            let auto = baseline.station1 == baseline.station2;
            let mut peak_bin = 0;
            let mut peak = 0.0f32;
            for (j, value) in baseline.spectrum.iter().enumerate() {
                if auto {
                    assert!(value.re >= -1e-3, "auto bin {j} = {value}");
                    assert!(
                        value.im.abs() <= 1e-3 * value.re.abs().max(1e-6),
                        "auto bin {j} = {value}"
                    );
                }
                if value.norm() > peak {
                    peak = value.norm();
                    peak_bin = j;
                }
            }
            assert_eq!(peak_bin, tone_bin, "baseline {}-{}", baseline.station1, baseline.station2);
        }
    }

    // Identical recordings and a zero delay model: the cross spectrum at
    // the tone is real positive.
    let cross = records[0]
        .baselines
        .iter()
        .find(|b| b.station1 == 0 && b.station2 == 1)
        .unwrap();
    let value = cross.spectrum[tone_bin];
    assert!(value.re > 0.0);
    assert_abs_diff_eq!((value.im / value.re) as f64, 0.0, epsilon = 0.02);
}

#[test]
fn recording_ending_mid_run_gives_short_slices() {
    let tmp = tempdir().unwrap();
    let full_samples =
        (N_INTEGRATIONS as f64 * INTEGR_USEC * 1e-6 * SAMPLE_RATE as f64) as usize + 10_000;
    // Station Wb's recording stops half way through the run.
    let ef_path = tmp.path().join("ef.m5b");
    let wb_path = tmp.path().join("wb.m5b");
    write_recording(&ef_path, full_samples);
    write_recording(&wb_path, full_samples / 2);

    let delay_dir = tmp.path().join("delays");
    std::fs::create_dir(&delay_dir).unwrap();
    write_delay_table(&delay_dir.join("Ef.del"));
    write_delay_table(&delay_dir.join("Wb.del"));

    let vex_path = tmp.path().join("exper.vex.json");
    std::fs::write(&vex_path, serde_json::to_string(&test_vex()).unwrap()).unwrap();

    let output_path = tmp.path().join("out.cor");
    let stop = scan_start()
        + TimeDelta::from_usec((N_INTEGRATIONS as f64 * INTEGR_USEC) as i64);
    let mut control: ControlFile = serde_json::from_value(serde_json::json!({
        "start": scan_start().date_string(),
        "stop": stop.date_string(),
        "integr_time": INTEGR_USEC,
        "slices_per_integration": SLICES_PER_INTEGRATION,
        "number_channels": NUMBER_CHANNELS,
        "stations": ["Ef", "Wb"],
        "data_sources": {
            "Ef": [format!("file://{}", ef_path.display())],
            "Wb": [format!("file://{}", wb_path.display())]
        },
        "delay_directory": format!("file://{}", delay_dir.display()),
        "output_file": format!("file://{}", output_path.display())
    }))
    .unwrap();
    control.apply_defaults();
    control.validate().unwrap();

    let vex = Vex::from_json(&serde_json::to_string(&test_vex()).unwrap()).unwrap();
    let ctx = RunContext {
        control,
        vex,
        seed: 1,
        deterministic: true,
        strict_slice_accounting: false,
        clock_rate_unitless_usec_per_sec: true,
        check_interval: 100,
    };
    run_cluster(Arc::new(ctx), vex_path, 2).unwrap();

    let (_, records) = read_output(&output_path);
    assert_eq!(records.len(), N_INTEGRATIONS * SLICES_PER_INTEGRATION);

    // Early slices are fully weighted; late slices keep Ef's
    // autocorrelation but flag everything involving Wb with zero weight.
    let first = &records[0];
    for baseline in &first.baselines {
        assert_abs_diff_eq!(baseline.weight, 1.0);
    }
    let last = records.last().unwrap();
    for baseline in &last.baselines {
        if baseline.station1 == 0 && baseline.station2 == 0 {
            assert_abs_diff_eq!(baseline.weight, 1.0);
        } else {
            assert_abs_diff_eq!(baseline.weight, 0.0);
        }
    }
}
