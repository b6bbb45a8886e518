//! On-disk layout of one cache entry.
//!
//! ```text
//! <output_dir>/<sig_fold>/<sig_str>/<sig_type>/window_<lag>/
//!     ref_dfs/{raw,spikes,wknd,wkdy_corr,flag_spike,flag_weekday}.csv
//!     train_<n_train>_lags_<ar_lags>/{ar_output,flag_ar}.csv
//!     train_<n_train>_lags_<ar_lags>/manifest.json
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::CacheError;
use crate::config::{FlagRun, LagWindow, SigType};
use crate::types::{parse_date, DateRange};

pub const REF_DIR: &str = "ref_dfs";
pub const RAW_FILE: &str = "raw.csv";
pub const SPIKES_FILE: &str = "spikes.csv";
pub const WEEKEND_FILE: &str = "wknd.csv";
pub const WEEKDAY_FILE: &str = "wkdy_corr.csv";
pub const SPIKE_FLAGS_FILE: &str = "flag_spike.csv";
pub const WEEKDAY_FLAGS_FILE: &str = "flag_weekday.csv";
pub const AR_OUTPUT_FILE: &str = "ar_output.csv";
pub const AR_FLAGS_FILE: &str = "flag_ar.csv";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Identity of one cache leaf.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub sig_fold: String,
    pub sig_str: String,
    pub sig_type: SigType,
    pub lag: LagWindow,
    pub n_train: usize,
    pub ar_lags: usize,
}

impl CacheKey {
    pub fn new(run: &FlagRun, lag: LagWindow) -> Self {
        Self {
            sig_fold: run.sig_fold.clone(),
            sig_str: run.sig_str.clone(),
            sig_type: run.sig_type,
            lag,
            n_train: run.n_train,
            ar_lags: run.ar_lags,
        }
    }

    /// `<output_dir>/<sig_fold>/<sig_str>/<sig_type>`, shared by every lag.
    pub fn signal_dir(&self, output_dir: &Path) -> PathBuf {
        output_dir
            .join(&self.sig_fold)
            .join(&self.sig_str)
            .join(self.sig_type.as_str())
    }

    pub fn window_dir(&self, output_dir: &Path) -> PathBuf {
        self.signal_dir(output_dir).join(format!("window_{}", self.lag))
    }

    pub fn ref_dir(&self, output_dir: &Path) -> PathBuf {
        self.window_dir(output_dir).join(REF_DIR)
    }

    pub fn ar_dir(&self, output_dir: &Path) -> PathBuf {
        self.window_dir(output_dir)
            .join(format!("train_{}_lags_{}", self.n_train, self.ar_lags))
    }

    /// Stable md5 of the key fields.
    pub fn params_hash(&self) -> String {
        let canonical = format!(
            "sig_fold={}|sig_str={}|sig_type={}|lag={}|n_train={}|ar_lags={}",
            self.sig_fold, self.sig_str, self.sig_type, self.lag, self.n_train, self.ar_lags
        );
        format!("{:x}", md5::compute(canonical.as_bytes()))
    }
}

/// Written next to the AR outputs of every leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub window_params_hash: String,
    pub sig_fold: String,
    pub sig_str: String,
    pub sig_type: String,
    pub lag: String,
    pub n_train: usize,
    pub ar_lags: usize,
    pub df_range: DateRange,
    pub resid_range: DateRange,
    pub eval_range: DateRange,
    pub written_at: DateTime<Utc>,
}

impl Manifest {
    pub fn new(key: &CacheKey, run: &FlagRun) -> Self {
        Self {
            window_params_hash: key.params_hash(),
            sig_fold: key.sig_fold.clone(),
            sig_str: key.sig_str.clone(),
            sig_type: key.sig_type.to_string(),
            lag: key.lag.to_string(),
            n_train: key.n_train,
            ar_lags: key.ar_lags,
            df_range: run.window.df_range,
            resid_range: run.window.resid_range,
            eval_range: run.window.eval_range,
            written_at: Utc::now(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), CacheError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| CacheError::Manifest {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `Ok(None)` when no manifest has been written.
    pub fn read(path: &Path) -> Result<Option<Self>, CacheError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path).map_err(|source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| CacheError::Manifest {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Dates in the first column of a cached CSV; `Ok(None)` if the file is
/// missing.
pub fn cached_dates(path: &Path) -> Result<Option<Vec<NaiveDate>>, CacheError> {
    if !path.exists() {
        return Ok(None);
    }
    let csv_err = |source| CacheError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(csv_err)?;
    let mut dates = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        if let Some(date) = record.get(0).and_then(parse_date) {
            dates.push(date);
        }
    }
    Ok(Some(dates))
}

/// True when the file exists and lists both `first` and `last`.
pub fn covers(path: &Path, first: NaiveDate, last: NaiveDate) -> Result<bool, CacheError> {
    Ok(cached_dates(path)?.is_some_and(|dates| dates.contains(&first) && dates.contains(&last)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(lag: LagWindow) -> CacheKey {
        CacheKey {
            sig_fold: "test".into(),
            sig_str: "basic_sig".into(),
            sig_type: SigType::Local,
            lag,
            n_train: 2,
            ar_lags: 1,
        }
    }

    #[test]
    fn test_paths() {
        let out = Path::new("/flags");
        let k = key(LagWindow::Var);
        assert_eq!(
            k.ref_dir(out),
            PathBuf::from("/flags/test/basic_sig/local/window_var/ref_dfs")
        );
        assert_eq!(
            k.ar_dir(out),
            PathBuf::from("/flags/test/basic_sig/local/window_var/train_2_lags_1")
        );
    }

    #[test]
    fn test_params_hash_stable_and_distinct() {
        let a = key(LagWindow::Days(1));
        assert_eq!(a.params_hash(), key(LagWindow::Days(1)).params_hash());
        assert_eq!(a.params_hash().len(), 32);
        assert_ne!(a.params_hash(), key(LagWindow::Days(2)).params_hash());
        let mut b = a.clone();
        b.n_train = 3;
        assert_ne!(a.params_hash(), b.params_hash());
    }

    #[test]
    fn test_covers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        let d = |s| parse_date(s).unwrap();
        assert!(!covers(&path, d("2022-05-01"), d("2022-05-03")).unwrap());

        std::fs::write(&path, "date,ca\n2022-05-01,1\n2022-05-02,2\n2022-05-03,3\n").unwrap();
        assert!(covers(&path, d("2022-05-01"), d("2022-05-03")).unwrap());
        assert!(!covers(&path, d("2022-05-01"), d("2022-05-04")).unwrap());
    }
}
