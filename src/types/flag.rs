//! Flag records emitted by the detection stages.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Which stage raised a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlagKind {
    Spike,
    ArResidual,
    WeekdayOutlier,
}

impl FlagKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FlagKind::Spike => "spike",
            FlagKind::ArResidual => "ar-residual",
            FlagKind::WeekdayOutlier => "weekday-outlier",
        }
    }
}

impl std::fmt::Display for FlagKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One flagged (date, geography) point.
///
/// `lag` names the data-vintage window that produced the flag and `key`
/// the series variant (e.g. `num`, `ratio`), so flags from different
/// windows can be filtered apart after they are merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    pub date: NaiveDate,
    pub geography: String,
    pub kind: FlagKind,
    pub lag: String,
    pub key: String,
    /// Stage-specific strength: corrected value for spikes, tail
    /// probability for AR residuals, Pearson residual for weekday outliers.
    pub score: Option<f64>,
}

/// Write flags as CSV with columns `date,geography,kind,lag,key,score`.
pub fn write_flags(path: &Path, flags: &[Flag]) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path)?;
    if flags.is_empty() {
        writer.write_record(["date", "geography", "kind", "lag", "key", "score"])?;
    }
    for flag in flags {
        writer.serialize(flag)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a flag CSV written by [`write_flags`].
pub fn read_flags(path: &Path) -> Result<Vec<Flag>, csv::Error> {
    let file = File::open(path)?;
    let mut reader = csv::Reader::from_reader(BufReader::new(file));
    reader.deserialize().collect()
}

/// Group flags by date, preserving first-seen order within a date.
pub fn group_by_date(flags: &[Flag]) -> Vec<(NaiveDate, Vec<&Flag>)> {
    let mut groups: Vec<(NaiveDate, Vec<&Flag>)> = Vec::new();
    let mut sorted: Vec<&Flag> = flags.iter().collect();
    sorted.sort_by_key(|f| f.date);
    for flag in sorted {
        match groups.last_mut() {
            Some((date, members)) if *date == flag.date => members.push(flag),
            _ => groups.push((flag.date, vec![flag])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn flag(day: u32, geo: &str) -> Flag {
        Flag {
            date: NaiveDate::from_ymd_opt(2022, 5, day).unwrap(),
            geography: geo.to_string(),
            kind: FlagKind::ArResidual,
            lag: "1".to_string(),
            key: "num".to_string(),
            score: Some(0.01),
        }
    }

    #[test]
    fn test_flag_csv_roundtrip_keeps_kind_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flag_ar.csv");
        let flags = vec![flag(3, "ca"), flag(4, "ny")];
        write_flags(&path, &flags).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("date,geography,kind,lag,key,score"));
        assert!(text.contains("ar-residual"));
        assert_eq!(read_flags(&path).unwrap(), flags);
    }

    #[test]
    fn test_empty_flag_file_has_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flag_spike.csv");
        write_flags(&path, &[]).unwrap();
        assert!(read_flags(&path).unwrap().is_empty());
    }

    #[test]
    fn test_group_by_date() {
        let flags = vec![flag(4, "ny"), flag(3, "ca"), flag(4, "tx")];
        let groups = group_by_date(&flags);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1].1.len(), 2);
        assert_eq!(groups[1].1[0].geography, "ny");
    }
}
