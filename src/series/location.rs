use chrono::NaiveDate;

use super::SeriesError;

/// Ordered date → value mapping for one geography and one signal.
///
/// Dates are strictly increasing. Construction sorts the points, drops
/// exact repeats and rejects repeated dates that disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationSeries {
    geography: String,
    signal: String,
    points: Vec<(NaiveDate, Option<f64>)>,
}

impl LocationSeries {
    pub fn new(
        geography: impl Into<String>,
        signal: impl Into<String>,
        mut points: Vec<(NaiveDate, Option<f64>)>,
    ) -> Result<Self, SeriesError> {
        let geography = geography.into();
        points.sort_by_key(|(date, _)| *date);

        let mut deduped: Vec<(NaiveDate, Option<f64>)> = Vec::with_capacity(points.len());
        for (date, value) in points {
            match deduped.last() {
                Some((prev_date, prev_value)) if *prev_date == date => {
                    if prev_value != &value {
                        return Err(SeriesError::ConflictingDuplicate { date, geography });
                    }
                }
                _ => deduped.push((date, value)),
            }
        }

        Ok(Self {
            geography,
            signal: signal.into(),
            points: deduped,
        })
    }

    pub fn geography(&self) -> &str {
        &self.geography
    }

    pub fn signal(&self) -> &str {
        &self.signal
    }

    pub fn points(&self) -> &[(NaiveDate, Option<f64>)] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, date: NaiveDate) -> Option<f64> {
        self.points
            .binary_search_by_key(&date, |(d, _)| *d)
            .ok()
            .and_then(|i| self.points[i].1)
    }

    /// Observed (non-missing) values in date order.
    pub fn observed(&self) -> impl Iterator<Item = (NaiveDate, f64)> + '_ {
        self.points
            .iter()
            .filter_map(|(date, value)| value.map(|v| (*date, v)))
    }
}
