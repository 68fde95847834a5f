//! Quota window types
//!
//! Fixed-window accounting shared by the quota tracker (counter store
//! buckets) and the usage recorder (per-record monthly counters). Calendar
//! months are just another bucket granularity.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A counter limit, or the unlimited sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaLimit {
    Limited(u64),
    Unlimited,
}

impl QuotaLimit {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    /// Whether a post-increment count stays within the limit.
    pub fn allows(&self, count: u64) -> bool {
        match self {
            Self::Limited(limit) => count <= *limit,
            Self::Unlimited => true,
        }
    }

    /// `max(0, limit - count)`, or `None` when unlimited.
    pub fn remaining(&self, count: u64) -> Option<u64> {
        match self {
            Self::Limited(limit) => Some(limit.saturating_sub(count)),
            Self::Unlimited => None,
        }
    }

    /// The numeric limit, or `None` when unlimited.
    pub fn value(&self) -> Option<u64> {
        match self {
            Self::Limited(limit) => Some(*limit),
            Self::Unlimited => None,
        }
    }
}

impl fmt::Display for QuotaLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(limit) => write!(f, "{}", limit),
            Self::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// Bucket granularity for fixed-window counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowGranularity {
    /// Epoch-aligned buckets of a fixed length.
    Fixed(Duration),
    /// Buckets starting on the 1st of each month, 00:00 UTC.
    CalendarMonth,
}

impl WindowGranularity {
    /// The 15-minute request-rate window.
    pub const FIFTEEN_MINUTES: WindowGranularity =
        WindowGranularity::Fixed(Duration::from_secs(15 * 60));

    /// Truncate `now` to the start of its bucket.
    pub fn bucket_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Fixed(length) => {
                let length_secs = i64::try_from(length.as_secs()).unwrap_or(i64::MAX).max(1);
                let secs = now.timestamp();
                let start = secs - secs.rem_euclid(length_secs);
                Utc.timestamp_opt(start, 0).single().unwrap_or(now)
            }
            Self::CalendarMonth => first_of_month(now.year(), now.month()).unwrap_or(now),
        }
    }

    /// End (exclusive) of the bucket that starts at `start`.
    pub fn bucket_end(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Fixed(length) => {
                let length = ChronoDuration::from_std(*length)
                    .unwrap_or_else(|_| ChronoDuration::seconds(1));
                start + length
            }
            Self::CalendarMonth => {
                let (year, month) = if start.month() == 12 {
                    (start.year() + 1, 1)
                } else {
                    (start.year(), start.month() + 1)
                };
                first_of_month(year, month).unwrap_or_else(|| start + ChronoDuration::days(31))
            }
        }
    }

    /// Short label used in counter keys and log fields.
    pub fn label(&self) -> String {
        match self {
            Self::Fixed(length) => format!("{}s", length.as_secs()),
            Self::CalendarMonth => "month".to_string(),
        }
    }
}

fn first_of_month(year: i32, month: u32) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

/// Which of the two per-identity windows a decision refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// Short request-rate window (15 minutes by default).
    RequestRate,
    /// Calendar-month plan quota.
    Monthly,
}

impl WindowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestRate => "rate",
            Self::Monthly => "monthly",
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-record window counters.
///
/// A window is stale once `now >= bucket_end(window_start)`; it must be
/// rolled over before it is read or incremented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaWindow {
    pub window_start: DateTime<Utc>,
    pub count: u64,
    pub limit: QuotaLimit,
    pub granularity: WindowGranularity,
}

impl QuotaWindow {
    /// Open a fresh window for the bucket containing `now`.
    pub fn open(granularity: WindowGranularity, limit: QuotaLimit, now: DateTime<Utc>) -> Self {
        Self {
            window_start: granularity.bucket_start(now),
            count: 0,
            limit,
            granularity,
        }
    }

    /// Calendar-month window, the shape used for plan quotas.
    pub fn monthly(limit: QuotaLimit, now: DateTime<Utc>) -> Self {
        Self::open(WindowGranularity::CalendarMonth, limit, now)
    }

    pub fn reset_at(&self) -> DateTime<Utc> {
        self.granularity.bucket_end(self.window_start)
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at()
    }

    /// Reset the counter if the window has expired. Returns true on reset.
    pub fn rollover_if_stale(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_stale(now) {
            self.window_start = self.granularity.bucket_start(now);
            self.count = 0;
            true
        } else {
            false
        }
    }

    /// Roll over if needed, then add `by` to the count.
    pub fn increment(&mut self, by: u64, now: DateTime<Utc>) -> u64 {
        self.rollover_if_stale(now);
        self.count = self.count.saturating_add(by);
        self.count
    }

    pub fn remaining(&self) -> Option<u64> {
        self.limit.remaining(self.count)
    }
}
