//! Schedule data model and the next-occurrence calculator: given a zone's
//! period, cycle anchor, and resolved slot times, work out the next calendar
//! date/time it will fire and a human label for it.
//!
//! All calculations are pure and take `now` explicitly so they can be tested
//! against fixed clocks.

use std::collections::HashMap;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize};

use crate::duration::parse_slot_duration;

// ---------------------------------------------------------------------------
// Data model (read-only, from GET schedule)
// ---------------------------------------------------------------------------

pub type ZoneId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneMode {
    Active,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Period {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSlot {
    /// Either a literal `HH:MM`, a legacy 6-digit numeric code, or a solar
    /// keyword like `sunrise`/`sunset`.
    pub code: String,
    /// Run length in seconds, decoded from the wire's `HH:MM:SS` literal.
    #[serde(rename = "duration", deserialize_with = "de_slot_duration")]
    pub duration_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub zone_id: ZoneId,
    pub mode: ZoneMode,
    pub period: Period,
    pub cycles: u32,
    /// Calendar anchor for weekly/monthly periods.
    #[serde(default)]
    pub start_day: Option<NaiveDate>,
    #[serde(default)]
    pub slots: Vec<TimeSlot>,
}

fn de_slot_duration<'de, D>(de: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(de)?;
    Ok(parse_slot_duration(&raw))
}

/// Resolved times for one zone: raw code -> `"HH:MM"` (or the `"N/A"` /
/// `"..."` sentinels when resolution failed or is still in flight).
pub type ResolvedTimes = HashMap<String, String>;

// ---------------------------------------------------------------------------
// Time-code helpers
// ---------------------------------------------------------------------------

/// Minutes since midnight for a literal `HH:MM` code, `None` for anything
/// that is not exactly that shape with valid ranges.
pub fn literal_minutes(code: &str) -> Option<u32> {
    let bytes = code.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return None;
    }
    let h: u32 = code[0..2].parse().ok()?;
    let m: u32 = code[3..5].parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// Minutes since midnight for a slot, taking the literal reading when the
/// code needs no resolution and the resolved table otherwise. Sentinel
/// values (`"N/A"`, `"..."`) yield `None`.
fn slot_minutes(slot: &TimeSlot, resolved: &ResolvedTimes) -> Option<u32> {
    if let Some(m) = literal_minutes(&slot.code) {
        return Some(m);
    }
    resolved
        .get(&slot.code)
        .and_then(|t| literal_minutes(t))
}

// ---------------------------------------------------------------------------
// Next occurrence
// ---------------------------------------------------------------------------

/// Next calendar date this zone will fire, or `None` when it cannot be
/// computed (weekly/monthly with no anchor, or a disabled zone).
pub fn next_occurrence_date(
    zone: &Zone,
    resolved: &ResolvedTimes,
    now: NaiveDateTime,
) -> Option<NaiveDate> {
    if zone.mode == ZoneMode::Disabled {
        return None;
    }
    let today = now.date();

    match zone.period {
        Period::Daily => {
            let now_min = now.hour() * 60 + now.minute();
            let fires_today = zone
                .slots
                .iter()
                .filter_map(|s| slot_minutes(s, resolved))
                .any(|m| m > now_min);
            Some(if fires_today {
                today
            } else {
                today + Duration::days(1)
            })
        }
        Period::Weekly => {
            let anchor = zone.start_day?;
            let offset = (anchor.weekday().num_days_from_monday() as i64
                - today.weekday().num_days_from_monday() as i64)
                .rem_euclid(7);
            // A zero offset means this cycle's run was already anchored
            // today; the next one is a full week out.
            let offset = if offset == 0 { 7 } else { offset };
            Some(today + Duration::days(offset))
        }
        Period::Monthly => {
            let anchor = zone.start_day?;
            let dom = anchor.day();
            if dom >= today.day() {
                Some(clamp_to_month(today.year(), today.month(), dom))
            } else {
                let (y, m) = if today.month() == 12 {
                    (today.year() + 1, 1)
                } else {
                    (today.year(), today.month() + 1)
                };
                Some(clamp_to_month(y, m, dom))
            }
        }
    }
}

/// Build a date in `(year, month)`, clamping the day to the month's length
/// (an anchor on the 31st still fires in 30-day months).
fn clamp_to_month(year: i32, month: u32, day: u32) -> NaiveDate {
    let mut d = day;
    loop {
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, d) {
            return date;
        }
        d -= 1;
    }
}

/// `"Today"`, `"Tomorrow"`, or `"MM/DD"` for the computed occurrence,
/// comparing date portions only. `"..."` when no occurrence is computable.
pub fn next_display_label(zone: &Zone, resolved: &ResolvedTimes, now: NaiveDateTime) -> String {
    let Some(date) = next_occurrence_date(zone, resolved, now) else {
        return "...".to_string();
    };
    let today = now.date();
    if date == today {
        "Today".to_string()
    } else if date == today + Duration::days(1) {
        "Tomorrow".to_string()
    } else {
        format!("{:02}/{:02}", date.month(), date.day())
    }
}

/// Next slot time for a daily zone: the earliest resolved time strictly after
/// `now`, or the earliest overall once today's are spent (tomorrow's first
/// slot). `"..."` when no slot resolves at all.
pub fn next_daily_time(zone: &Zone, resolved: &ResolvedTimes, now: NaiveDateTime) -> String {
    let now_min = now.hour() * 60 + now.minute();
    let mut times: Vec<u32> = zone
        .slots
        .iter()
        .filter_map(|s| slot_minutes(s, resolved))
        .collect();
    times.sort_unstable();

    let pick = times
        .iter()
        .copied()
        .find(|m| *m > now_min)
        .or_else(|| times.first().copied());

    match pick {
        Some(m) => format!("{:02}:{:02}", m / 60, m % 60),
        None => "...".to_string(),
    }
}

/// Seconds left on a running slot. A manual override (the poller's reported
/// remaining) wins outright; before `start` nothing has elapsed yet.
pub fn remaining_seconds(
    manual_override: Option<u32>,
    start: NaiveDateTime,
    duration_secs: u32,
    now: NaiveDateTime,
) -> u32 {
    if let Some(r) = manual_override {
        return r;
    }
    if now < start {
        return 0;
    }
    let end = start + Duration::seconds(duration_secs as i64);
    (end - now).num_seconds().max(0) as u32
}

// ===========================================================================
// Tests
// ===========================================================================
