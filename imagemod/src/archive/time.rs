//! Entry timestamp helpers: the clamp rule and PAX time records.

use chrono::{DateTime, Utc};

/// Adjustment applied to the non-zero timestamps of a tar entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRule {
    /// Value written into a timestamp that qualifies for change.
    pub set: DateTime<Utc>,
    /// When present, only timestamps strictly later than this bound qualify.
    pub after: Option<DateTime<Utc>>,
}

impl TimeRule {
    pub fn new(set: DateTime<Utc>, after: Option<DateTime<Utc>>) -> Self {
        Self { set, after }
    }

    /// Apply the rule to one timestamp. Returns true when the value changed.
    ///
    /// An absent (zero) timestamp is never introduced.
    pub fn apply(&self, t: &mut Option<DateTime<Utc>>) -> bool {
        let Some(current) = *t else {
            return false;
        };
        if let Some(after) = self.after
            && current <= after
        {
            return false;
        }
        if current == self.set {
            return false;
        }
        *t = Some(self.set);
        true
    }
}

/// Format a time as a PAX record value: `secs[.frac]`, trailing zeros trimmed.
pub fn format_pax_time(t: &DateTime<Utc>) -> String {
    let mut secs = t.timestamp();
    let mut nanos = t.timestamp_subsec_nanos();
    let sign = if secs < 0 { "-" } else { "" };
    if secs < 0 && nanos > 0 {
        secs += 1;
        nanos = 1_000_000_000 - nanos;
    }
    let whole = secs.unsigned_abs();
    if nanos == 0 {
        return format!("{}{}", sign, whole);
    }
    let frac = format!("{:09}", nanos);
    format!("{}{}.{}", sign, whole, frac.trim_end_matches('0'))
}

/// Parse a PAX time record value. Digits past nanosecond precision are dropped.
pub fn parse_pax_time(value: &str) -> Option<DateTime<Utc>> {
    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let (whole, frac) = match digits.split_once('.') {
        Some((w, f)) => (w, f),
        None => (digits, ""),
    };
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let secs: i64 = whole.parse().ok()?;
    let mut padded: String = frac.chars().take(9).collect();
    while padded.len() < 9 {
        padded.push('0');
    }
    let nanos: u32 = padded.parse().ok()?;

    if !negative {
        return DateTime::from_timestamp(secs, nanos);
    }
    if nanos == 0 {
        DateTime::from_timestamp(-secs, 0)
    } else {
        DateTime::from_timestamp(-secs - 1, 1_000_000_000 - nanos)
    }
}

/// Seconds since the epoch for a fixed-width header field; pre-epoch clamps to 0.
pub fn header_secs(t: &DateTime<Utc>) -> u64 {
    u64::try_from(t.timestamp()).unwrap_or(0)
}

/// Whether the time survives a round trip through an integer-seconds header field.
pub fn fits_header(t: &DateTime<Utc>) -> bool {
    t.timestamp() >= 0 && t.timestamp_subsec_nanos() == 0
}
