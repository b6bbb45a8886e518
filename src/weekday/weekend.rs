//! Weekend volume correction.
//!
//! The weekday model is multiplicative and behaves badly when weekend
//! counts are close to zero, so weekend days are topped up first. Weeks run
//! Saturday through Friday: each Saturday and Sunday is grouped with the
//! weekdays that follow it.

use chrono::{Datelike, NaiveDate};
use tracing::debug;

use crate::series::SeriesTable;

/// Target weekend-day share of the weekday total.
const TARGET_SHARE: f64 = 0.2;

/// Output of [`weekend_corr`].
#[derive(Debug, Clone, PartialEq)]
pub struct WeekendOutput {
    pub table: SeriesTable,
    /// Week number per row, Saturday/Sunday counted with the next week.
    pub week_numbers: Vec<u32>,
    /// False when fewer than two complete weeks were available.
    pub applied: bool,
}

/// Week numbers where Saturday and Sunday belong to the following week.
pub fn week_numbers(dates: &[NaiveDate]) -> Vec<u32> {
    let mut week = 0;
    let mut prev_iso = None;
    dates
        .iter()
        .map(|date| {
            let iso = date.iso_week().week();
            if prev_iso != Some(iso) {
                week += 1;
            }
            prev_iso = Some(iso);
            if is_weekend(*date) {
                week + 1
            } else {
                week
            }
        })
        .collect()
}

fn is_weekend(date: NaiveDate) -> bool {
    date.weekday().num_days_from_monday() >= 5
}

struct Week {
    rows: Vec<usize>,
    saturday: Option<usize>,
    sunday: Option<usize>,
}

fn group_weeks(dates: &[NaiveDate], numbers: &[u32]) -> Vec<Week> {
    let mut weeks: Vec<(u32, Week)> = Vec::new();
    for (i, (date, number)) in dates.iter().zip(numbers).enumerate() {
        let pos = match weeks.iter().position(|(n, _)| n == number) {
            Some(pos) => pos,
            None => {
                weeks.push((
                    *number,
                    Week {
                        rows: Vec::new(),
                        saturday: None,
                        sunday: None,
                    },
                ));
                weeks.len() - 1
            }
        };
        let week = &mut weeks[pos].1;
        week.rows.push(i);
        match date.weekday().num_days_from_monday() {
            5 => week.saturday = Some(i),
            6 => week.sunday = Some(i),
            _ => {}
        }
    }
    weeks.sort_by_key(|(n, _)| *n);
    weeks.into_iter().map(|(_, w)| w).collect()
}

fn weekday_total(column: &[Option<f64>], dates: &[NaiveDate], week: &Week) -> f64 {
    week.rows
        .iter()
        .filter(|&&i| !is_weekend(dates[i]))
        .filter_map(|&i| column[i])
        .sum()
}

/// Raise Saturday and Sunday counts towards a fifth of the weekday total.
///
/// Per geography, the average weekend-day share over complete weeks sets
/// a correction `max(0, 0.2 - share)`, added as that fraction of each
/// week's weekday total. Incomplete weeks reuse the last amount added.
/// With fewer than two complete weeks the table is returned unchanged.
pub fn weekend_corr(table: &SeriesTable) -> WeekendOutput {
    let dates = table.dates();
    let numbers = week_numbers(dates);
    let weeks = group_weeks(dates, &numbers);
    let full: Vec<&Week> = weeks.iter().filter(|w| w.rows.len() == 7).collect();

    if full.len() < 2 {
        debug!(complete_weeks = full.len(), "Too few complete weeks, skipping weekend correction");
        return WeekendOutput {
            table: table.clone(),
            week_numbers: numbers,
            applied: false,
        };
    }

    let corrected = table.map_columns(|_, column| {
        let share = |pick: fn(&Week) -> Option<usize>| -> f64 {
            let shares: Vec<f64> = full
                .iter()
                .filter_map(|w| {
                    let total = weekday_total(column, dates, w);
                    let day = column[pick(w)?]?;
                    let p = day / total;
                    p.is_finite().then_some(p)
                })
                .collect();
            if shares.is_empty() {
                return 0.0;
            }
            let mean = shares.iter().sum::<f64>() / shares.len() as f64;
            (TARGET_SHARE - mean).max(0.0)
        };
        let sat_corr = share(|w| w.saturday);
        let sun_corr = share(|w| w.sunday);

        let mut out = column.to_vec();
        let mut last_sat = 0.0;
        let mut last_sun = 0.0;
        for week in &weeks {
            if week.rows.len() == 7 {
                let total = weekday_total(column, dates, week);
                last_sat = sat_corr * total;
                last_sun = sun_corr * total;
            }
            if let Some(i) = week.saturday {
                out[i] = out[i].map(|v| v + last_sat);
            }
            if let Some(i) = week.sunday {
                out[i] = out[i].map(|v| v + last_sun);
            }
        }
        out
    });

    WeekendOutput {
        table: corrected,
        week_numbers: numbers,
        applied: true,
    }
}
