//! Synthetic indicator data
//!
//! Generates a raw wide CSV (one column per geography plus a `lag` column)
//! suitable for `flagging.raw_df`, and optionally a directory of daily
//! export files for the validator. Counts follow a slow trend with a
//! day-of-week pattern and Poisson noise; a configurable share of days get
//! an injected spike.
//!
//! # Usage
//! ```bash
//! ./simulate --days 90 --raw-out raw.csv --export-dir receiving --seed 7
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use clap::Parser;
use rand::prelude::*;
use rand_distr::{Distribution, Normal, Poisson};

use epiflag::filename::format_filename;
use epiflag::types::{parse_date, shift_days};

// ============================================================================
// Shape Constants
// ============================================================================

/// Relative level per weekday, Monday first.
const WEEKDAY_PATTERN: [f64; 7] = [1.10, 1.05, 1.00, 1.00, 0.95, 0.70, 0.60];
/// Spike height as a multiple of the day's expected count.
const SPIKE_MULTIPLE: f64 = 6.0;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "simulate")]
#[command(about = "Synthetic daily indicator data for epiflag testing")]
#[command(version)]
struct Args {
    /// Number of days to generate
    #[arg(long, default_value = "90", value_parser = clap::value_parser!(u32).range(7..=3650))]
    days: u32,

    /// Last generated date (YYYY-MM-DD or MM/DD/YYYY)
    #[arg(long, default_value = "2022-05-30")]
    end_date: String,

    /// Geography ids
    #[arg(long, value_delimiter = ',', default_value = "ak,al,ar,az,ca,co,ct,dc,de,fl")]
    geos: Vec<String>,

    /// Lag windows written to the `lag` column
    #[arg(long, value_delimiter = ',', default_value = "0,1,var")]
    lags: Vec<String>,

    /// Daily count level per geography
    #[arg(long, default_value = "200.0")]
    level: f64,

    /// Probability that a day of one geography is a spike
    #[arg(long, default_value = "0.01")]
    spike_rate: f64,

    /// Where to write the raw wide CSV
    #[arg(long, default_value = "raw.csv")]
    raw_out: PathBuf,

    /// Also write daily export files here
    #[arg(long)]
    export_dir: Option<PathBuf>,

    /// Days of export files, ending on `end_date`
    #[arg(long, default_value = "14")]
    export_days: u32,

    /// Geo type in export filenames
    #[arg(long, default_value = "state")]
    geo_type: String,

    /// Signal name in export filenames
    #[arg(long, default_value = "confirmed_incidence_num")]
    signal: String,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,
}

// ============================================================================
// Generation
// ============================================================================

struct Generator {
    rng: StdRng,
    level: f64,
    spike_rate: f64,
    spikes: usize,
}

impl Generator {
    fn new(seed: Option<u64>, level: f64, spike_rate: f64) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            level,
            spike_rate,
            spikes: 0,
        }
    }

    /// One geography's counts over `dates`.
    fn series(&mut self, dates: &[NaiveDate]) -> Result<Vec<f64>> {
        let scale = Normal::new(1.0_f64, 0.2).context("invalid scale distribution")?;
        let geo_level = self.level * scale.sample(&mut self.rng).max(0.2);
        let drift = self.rng.gen_range(-0.004..0.004);

        let mut values = Vec::with_capacity(dates.len());
        for (t, date) in dates.iter().enumerate() {
            let trend = (drift * t as f64).exp();
            let weekday = WEEKDAY_PATTERN[date.weekday().num_days_from_monday() as usize];
            let expected = (geo_level * trend * weekday).max(1.0);
            let poisson = Poisson::new(expected).context("invalid Poisson mean")?;
            let mut value: f64 = poisson.sample(&mut self.rng);
            if self.rng.gen_bool(self.spike_rate.clamp(0.0, 1.0)) {
                value += expected * SPIKE_MULTIPLE;
                self.spikes += 1;
            }
            values.push(value);
        }
        Ok(values)
    }
}

fn write_raw(path: &Path, dates: &[NaiveDate], geos: &[String], lags: &[String], gen: &mut Generator) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    let mut header = vec!["date".to_string()];
    header.extend(geos.iter().cloned());
    header.push("lag".to_string());
    writer.write_record(&header)?;

    for lag in lags {
        let columns = geos
            .iter()
            .map(|_| gen.series(dates))
            .collect::<Result<Vec<_>>>()?;
        for (d, date) in dates.iter().enumerate() {
            let mut record = vec![date.to_string()];
            record.extend(columns.iter().map(|c| c[d].to_string()));
            record.push(lag.clone());
            writer.write_record(&record)?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn write_exports(args: &Args, dir: &Path, dates: &[NaiveDate], gen: &mut Generator) -> Result<usize> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let columns = args
        .geos
        .iter()
        .map(|_| gen.series(dates))
        .collect::<Result<Vec<_>>>()?;

    let first = dates.len().saturating_sub(args.export_days as usize);
    let mut written = 0;
    for (d, date) in dates.iter().enumerate().skip(first) {
        let name = format_filename(*date, &args.geo_type, &args.signal, "csv");
        let path = dir.join(&name);
        let mut writer = csv::Writer::from_path(&path).with_context(|| format!("creating {}", path.display()))?;
        writer.write_record(["geo_id", "val", "se", "sample_size"])?;
        for (geo, column) in args.geos.iter().zip(&columns) {
            let val = column[d];
            let sample_size = (val * 10.0).max(100.0);
            let se = (val.max(1.0)).sqrt() / 10.0;
            writer.write_record([geo.clone(), val.to_string(), format!("{se:.4}"), sample_size.to_string()])?;
        }
        writer.flush()?;
        written += 1;
    }
    Ok(written)
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<()> {
    let args = Args::parse();

    let end = parse_date(&args.end_date).with_context(|| format!("invalid --end-date '{}'", args.end_date))?;
    let start = shift_days(end, 1 - i64::from(args.days))
        .with_context(|| format!("--days {} reaches before the supported calendar", args.days))?;
    let dates: Vec<NaiveDate> = start.iter_days().take(args.days as usize).collect();

    let mut gen = Generator::new(args.seed, args.level, args.spike_rate);

    write_raw(&args.raw_out, &dates, &args.geos, &args.lags, &mut gen)?;
    eprintln!(
        "wrote {} ({} days x {} geographies x {} lags)",
        args.raw_out.display(),
        dates.len(),
        args.geos.len(),
        args.lags.len()
    );

    if let Some(dir) = &args.export_dir {
        let written = write_exports(&args, dir, &dates, &mut gen)?;
        eprintln!("wrote {written} export files to {}", dir.display());
    }

    eprintln!("injected {} spikes", gen.spikes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dates(n: i64) -> Vec<NaiveDate> {
        let start = NaiveDate::from_ymd_opt(2022, 5, 2).unwrap();
        (0..n).filter_map(|i| shift_days(start, i)).collect()
    }

    #[test]
    fn test_series_is_seeded_and_non_negative() {
        let days = dates(28);
        let a = Generator::new(Some(7), 200.0, 0.0).series(&days).unwrap();
        let b = Generator::new(Some(7), 200.0, 0.0).series(&days).unwrap();
        assert_eq!(a.len(), days.len());
        assert_eq!(a, b);
        assert!(a.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_spike_rate_one_spikes_every_day() {
        let days = dates(10);
        let mut gen = Generator::new(Some(1), 50.0, 1.0);
        gen.series(&days).unwrap();
        assert_eq!(gen.spikes, days.len());
    }
}
