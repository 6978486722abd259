//! Daily travel-time profile of a route.
//!
//! Samples are folded onto a single day in the owner's local time and grouped into fixed-width
//! buckets. Null samples (no viable path) count towards a bucket's `missing` tally but never towards
//! its min, mean or max.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::db::models::TrafficReport;
use crate::types::RouteId;

const SECONDS_PER_DAY: i64 = 24 * 3600;

/// Aggregates for one slice of the day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileBucket {
    /// Seconds since local midnight at which the bucket starts
    pub start_offset_sec: i64,
    /// Samples with a duration
    pub samples: usize,
    /// Samples recorded without a viable path
    pub missing: usize,
    pub min: Option<i64>,
    pub mean: Option<f64>,
    pub max: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyProfile {
    pub route_id: RouteId,
    pub title: String,
    pub timezone: i32,
    pub bucket_sec: i64,
    /// Non-empty buckets, earliest first
    pub buckets: Vec<ProfileBucket>,
}

impl DailyProfile {
    pub fn from_report(report: &TrafficReport, bucket: Duration) -> Self {
        let bucket_sec = i64::try_from(bucket.as_secs()).unwrap_or(SECONDS_PER_DAY).clamp(1, SECONDS_PER_DAY);
        let shift = i64::from(report.timezone) * 3600;

        let mut grouped: BTreeMap<i64, Vec<Option<i64>>> = BTreeMap::new();
        for (timestamp, duration) in report.samples() {
            let time_of_day = (timestamp + shift).rem_euclid(SECONDS_PER_DAY);
            grouped.entry(time_of_day / bucket_sec).or_default().push(duration);
        }

        let buckets = grouped
            .into_iter()
            .map(|(index, durations)| {
                let present: Vec<i64> = durations.iter().flatten().copied().collect();
                let mean = (!present.is_empty()).then(|| present.iter().sum::<i64>() as f64 / present.len() as f64);
                ProfileBucket {
                    start_offset_sec: index * bucket_sec,
                    samples: present.len(),
                    missing: durations.len() - present.len(),
                    min: present.iter().min().copied(),
                    mean,
                    max: present.iter().max().copied(),
                }
            })
            .collect();

        Self {
            route_id: report.route.route_id,
            title: report.route.title.clone(),
            timezone: report.timezone,
            bucket_sec,
            buckets,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

fn minutes(secs: f64) -> String {
    format!("{:.1}m", secs / 60.0)
}

impl fmt::Display for DailyProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "#{} {} (UTC{:+})", self.route_id, self.title, self.timezone)?;
        if self.buckets.is_empty() {
            return writeln!(f, "  no samples yet");
        }
        for bucket in &self.buckets {
            let (h, m) = (bucket.start_offset_sec / 3600, bucket.start_offset_sec % 3600 / 60);
            write!(f, "  {h:02}:{m:02}  ")?;
            match (bucket.min, bucket.mean, bucket.max) {
                (Some(min), Some(mean), Some(max)) => write!(
                    f,
                    "min {}  mean {}  max {}  ({} samples",
                    minutes(min as f64),
                    minutes(mean),
                    minutes(max as f64),
                    bucket.samples
                )?,
                _ => write!(f, "no path  (0 samples")?,
            }
            if bucket.missing > 0 {
                write!(f, ", {} without a path", bucket.missing)?;
            }
            writeln!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Route, Traffic};
    use crate::types::Coords;

    // 2024-01-08 00:00:00 UTC, a Monday
    const MIDNIGHT: i64 = 1_704_672_000;

    fn report(timezone: i32, samples: &[(i64, Option<i64>)]) -> TrafficReport {
        let route = Route {
            route_id: 4,
            user_id: 1,
            title: "to work".to_string(),
            start: Coords::new(55.75, 37.61),
            end: Coords::new(55.70, 37.50),
        };
        let samples = samples
            .iter()
            .map(|&(timestamp, duration_sec)| Traffic {
                route_id: 4,
                timestamp,
                duration_sec,
            })
            .collect();
        TrafficReport::new(route, timezone, samples)
    }

    #[test]
    fn test_buckets_aggregate_and_skip_nulls() {
        let report = report(
            0,
            &[
                (MIDNIGHT + 8 * 3600, Some(1200)),
                (MIDNIGHT + 8 * 3600 + 600, Some(1800)),
                (MIDNIGHT + 8 * 3600 + 1200, None),
                (MIDNIGHT + 9 * 3600, Some(900)),
            ],
        );

        let profile = DailyProfile::from_report(&report, Duration::from_secs(1800));
        assert_eq!(profile.bucket_sec, 1800);
        assert_eq!(profile.buckets.len(), 2);

        let morning = &profile.buckets[0];
        assert_eq!(morning.start_offset_sec, 8 * 3600);
        assert_eq!(morning.samples, 2);
        assert_eq!(morning.missing, 1);
        assert_eq!(morning.min, Some(1200));
        assert_eq!(morning.max, Some(1800));
        assert_eq!(morning.mean, Some(1500.0));

        assert_eq!(profile.buckets[1].start_offset_sec, 9 * 3600);
        assert_eq!(profile.buckets[1].mean, Some(900.0));
    }

    #[test]
    fn test_samples_fold_onto_local_day() {
        // 22:00 UTC on two different days is 01:00 local at UTC+3
        let report = report(3, &[(MIDNIGHT - 2 * 3600, Some(600)), (MIDNIGHT + 22 * 3600, Some(700))]);

        let profile = DailyProfile::from_report(&report, Duration::from_secs(3600));
        assert_eq!(profile.buckets.len(), 1);
        assert_eq!(profile.buckets[0].start_offset_sec, 3600);
        assert_eq!(profile.buckets[0].samples, 2);
    }

    #[test]
    fn test_negative_timezone_wraps_to_previous_day() {
        // 01:00 UTC is 20:00 local at UTC-5
        let report = report(-5, &[(MIDNIGHT + 3600, Some(600))]);
        let profile = DailyProfile::from_report(&report, Duration::from_secs(3600));
        assert_eq!(profile.buckets[0].start_offset_sec, 20 * 3600);
    }

    #[test]
    fn test_bucket_with_only_nulls() {
        let report = report(0, &[(MIDNIGHT, None), (MIDNIGHT + 60, None)]);
        let profile = DailyProfile::from_report(&report, Duration::from_secs(1800));

        let bucket = &profile.buckets[0];
        assert_eq!(bucket.samples, 0);
        assert_eq!(bucket.missing, 2);
        assert_eq!(bucket.mean, None);
        assert!(profile.to_string().contains("no path"));
    }

    #[test]
    fn test_empty_report() {
        let profile = DailyProfile::from_report(&report(3, &[]), Duration::from_secs(1800));
        assert!(profile.is_empty());
        assert!(profile.to_string().contains("no samples yet"));
    }

    #[test]
    fn test_display() {
        let report = report(3, &[(MIDNIGHT + 5 * 3600, Some(1200)), (MIDNIGHT + 5 * 3600 + 60, None)]);
        let rendered = DailyProfile::from_report(&report, Duration::from_secs(1800)).to_string();
        assert!(rendered.starts_with("#4 to work (UTC+3)"));
        assert!(rendered.contains("08:00  min 20.0m  mean 20.0m  max 20.0m  (1 samples, 1 without a path)"));
    }
}
