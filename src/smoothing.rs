// src/smoothing.rs
//! Offline clean-up of an exported run: time rebased to zero (in seconds) and
//! every numeric column passed through a zero-phase low-pass.
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use log::info;

use crate::drivers::filter::LowPass;

/// Cutoff used by the rig's post-processing by default.
pub const DEFAULT_CUTOFF_HZ: f64 = 0.1;

/// Smooths the export at `path` and writes `<stem>_filtered.<ext>` next to it.
pub fn smooth_export(path: &Path, cutoff_hz: f64) -> Result<PathBuf> {
    ensure!(
        cutoff_hz.is_finite() && cutoff_hz > 0.0,
        "cutoff must be a positive frequency, got {cutoff_hz}"
    );
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let smoothed = smooth_table(&text, cutoff_hz)
        .with_context(|| format!("smoothing {}", path.display()))?;
    let out = filtered_path(path);
    fs::write(&out, smoothed).with_context(|| format!("writing {}", out.display()))?;
    info!("smoothed export written to {}", out.display());
    Ok(out)
}

fn filtered_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export".into());
    let name = match path.extension() {
        Some(ext) => format!("{stem}_filtered.{}", ext.to_string_lossy()),
        None => format!("{stem}_filtered"),
    };
    path.with_file_name(name)
}

/// Filters a CSV table whose first column is a millisecond timestamp.
/// Columns that are not numeric in every row are copied through untouched.
pub fn smooth_table(text: &str, cutoff_hz: f64) -> Result<String> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        bail!("file is empty");
    };
    let names: Vec<&str> = header.split(',').map(str::trim).collect();
    let rows: Vec<Vec<&str>> = lines
        .map(|l| l.split(',').map(str::trim).collect())
        .collect();
    ensure!(rows.len() >= 2, "need at least two data rows, got {}", rows.len());
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != names.len()) {
        bail!(
            "row {} has {} fields, header has {}",
            i + 2,
            row.len(),
            names.len()
        );
    }

    let times_ms = numeric_column(&rows, 0).context("timestamp column is not numeric")?;
    let t0 = times_ms[0];
    let times_s: Vec<f64> = times_ms.iter().map(|t| (t - t0) / 1000.0).collect();
    let dt = times_s[1] - times_s[0];
    ensure!(dt > 0.0, "first two timestamps must increase to derive a sample rate");
    let filter = LowPass::butterworth4(cutoff_hz, 1.0 / dt);

    let columns: Vec<Option<Vec<f64>>> = (1..names.len())
        .map(|c| numeric_column(&rows, c).map(|values| filter.filtfilt(&values)))
        .collect();

    let mut out = String::with_capacity(text.len());
    out.push_str("time_s");
    for name in &names[1..] {
        let _ = write!(out, ",{name}");
    }
    out.push('\n');
    for (r, row) in rows.iter().enumerate() {
        let _ = write!(out, "{:.3}", times_s[r]);
        for (c, column) in columns.iter().enumerate() {
            match column {
                Some(values) => {
                    let _ = write!(out, ",{:.4}", values[r]);
                }
                None => {
                    let _ = write!(out, ",{}", row[c + 1]);
                }
            }
        }
        out.push('\n');
    }
    Ok(out)
}

fn numeric_column(rows: &[Vec<&str>], column: usize) -> Option<Vec<f64>> {
    rows.iter()
        .map(|row| row[column].parse::<f64>().ok().filter(|v| v.is_finite()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{csv_header, Channel, Sample};

    fn export_text(rows: usize) -> String {
        let mut text = csv_header();
        text.push('\n');
        for i in 0..rows {
            let s = Sample::from_values(5_000 + i as i64 * 100, [20.0; Channel::COUNT]);
            text.push_str(&s.to_csv_row());
            text.push('\n');
        }
        text
    }

    #[test]
    fn rebases_time_and_keeps_constant_channels() {
        let out = smooth_table(&export_text(50), 0.1).unwrap();
        let mut lines = out.lines();
        assert!(lines.next().unwrap().starts_with("time_s,ir1,"));
        let first: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(first[0], "0.000");
        assert_eq!(first[1], "20.0000");
        let second: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(second[0], "0.100");
        assert_eq!(out.lines().count(), 51);
    }

    #[test]
    fn passes_through_text_columns() {
        let text = "Time,Load,Laptop_Time\n0,1.0,12:00:00\n500,1.0,12:00:01\n1000,1.0,12:00:02\n";
        let out = smooth_table(text, 0.1).unwrap();
        let last = out.lines().last().unwrap();
        assert_eq!(last, "1.000,1.0000,12:00:02");
    }

    #[test]
    fn rejects_unusable_input() {
        assert!(smooth_table("", 0.1).is_err());
        assert!(smooth_table("timestamp_ms,ir1\n0,1\n", 0.1).is_err());
        assert!(smooth_table("timestamp_ms,ir1\n0,1\n0,2\n", 0.1).is_err());
        assert!(smooth_table("timestamp_ms,ir1\n0,1\n10,2,3\n", 0.1).is_err());
        assert!(smooth_table("timestamp_ms,ir1\nx,1\n10,2\n", 0.1).is_err());
    }

    #[test]
    fn writes_filtered_file_next_to_the_export() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("data_20240309_14_05_07.csv");
        fs::write(&src, export_text(20)).unwrap();
        let out = smooth_export(&src, DEFAULT_CUTOFF_HZ).unwrap();
        assert_eq!(out, dir.path().join("data_20240309_14_05_07_filtered.csv"));
        assert_eq!(fs::read_to_string(out).unwrap().lines().count(), 21);
        assert!(smooth_export(&src, 0.0).is_err());
    }
}
