//! Zone run-duration codec: the backend stores slot durations as 6-digit
//! `HHMMSS` literals, countdowns render as `MM:SS`, and operators key manual
//! timers either as free-form digits (legacy pads) or as a literal
//! `HH:MM:SS`. All pure functions, no state.

use std::fmt;

// ---------------------------------------------------------------------------
// Stored-code parsing
// ---------------------------------------------------------------------------

/// Parse a 6-character `HHMMSS` literal into total seconds.
///
/// Returns 0 on wrong length or non-digit input. A malformed stored code
/// means "no duration", never an error the caller has to handle.
pub fn parse_duration(code: &str) -> u32 {
    if code.len() != 6 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return 0;
    }
    let h: u32 = code[0..2].parse().unwrap_or(0);
    let m: u32 = code[2..4].parse().unwrap_or(0);
    let s: u32 = code[4..6].parse().unwrap_or(0);
    h * 3600 + m * 60 + s
}

/// Parse a slot duration from the wire, accepting both `HH:MM:SS` and bare
/// `HHMMSS` spellings.
pub fn parse_slot_duration(raw: &str) -> u32 {
    let stripped: String = raw.chars().filter(|c| *c != ':').collect();
    parse_duration(&stripped)
}

// ---------------------------------------------------------------------------
// Countdown formatting
// ---------------------------------------------------------------------------

/// Format whole seconds as a zero-padded `MM:SS` countdown. Negative input is
/// not supported; callers clamp to >= 0 first.
pub fn format_countdown(secs: u32) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

// ---------------------------------------------------------------------------
// Manual timer entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManualDuration {
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl ManualDuration {
    pub fn total_seconds(&self) -> u32 {
        self.hours * 3600 + self.minutes * 60 + self.seconds
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualInputError {
    /// Input contained something other than digits (or colons in new mode).
    NotDigits,
    /// Input was empty or longer than a 6-digit code can hold.
    BadLength,
    /// `HH:MM:SS` mode input did not have exactly three components.
    BadFormat,
    HoursOutOfRange(u32),
    MinutesOutOfRange(u32),
    SecondsOutOfRange(u32),
    /// All components parsed but the total duration is zero.
    ZeroDuration,
}

impl fmt::Display for ManualInputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotDigits => write!(f, "duration must contain only digits"),
            Self::BadLength => write!(f, "duration must be 1 to 6 digits"),
            Self::BadFormat => write!(f, "duration must be HH:MM:SS"),
            Self::HoursOutOfRange(h) => write!(f, "hours must be 0-23, got {h}"),
            Self::MinutesOutOfRange(m) => write!(f, "minutes must be 0-59, got {m}"),
            Self::SecondsOutOfRange(s) => write!(f, "seconds must be 0-59, got {s}"),
            Self::ZeroDuration => write!(f, "duration must be greater than zero"),
        }
    }
}

impl std::error::Error for ManualInputError {}

/// Parse operator-entered timer text.
///
/// Legacy mode takes free-form digits and zero-pads them on the left to six
/// (`"130"` -> 00:01:30). New mode requires a literal `HH:MM:SS`.
pub fn parse_manual_input(raw: &str, legacy: bool) -> Result<ManualDuration, ManualInputError> {
    let raw = raw.trim();
    if legacy {
        parse_legacy_digits(raw)
    } else {
        parse_hms_literal(raw)
    }
}

fn parse_legacy_digits(raw: &str) -> Result<ManualDuration, ManualInputError> {
    if raw.is_empty() || raw.len() > 6 {
        return Err(ManualInputError::BadLength);
    }
    if !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ManualInputError::NotDigits);
    }
    let padded = format!("{raw:0>6}");
    check_components(
        padded[0..2].parse().unwrap_or(0),
        padded[2..4].parse().unwrap_or(0),
        padded[4..6].parse().unwrap_or(0),
    )
}

fn parse_hms_literal(raw: &str) -> Result<ManualDuration, ManualInputError> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 3 {
        return Err(ManualInputError::BadFormat);
    }
    let mut nums = [0u32; 3];
    for (i, p) in parts.iter().enumerate() {
        if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ManualInputError::NotDigits);
        }
        nums[i] = p.parse().map_err(|_| ManualInputError::NotDigits)?;
    }
    check_components(nums[0], nums[1], nums[2])
}

fn check_components(h: u32, m: u32, s: u32) -> Result<ManualDuration, ManualInputError> {
    if h > 23 {
        return Err(ManualInputError::HoursOutOfRange(h));
    }
    if m > 59 {
        return Err(ManualInputError::MinutesOutOfRange(m));
    }
    if s > 59 {
        return Err(ManualInputError::SecondsOutOfRange(s));
    }
    let d = ManualDuration {
        hours: h,
        minutes: m,
        seconds: s,
    };
    if d.total_seconds() == 0 {
        return Err(ManualInputError::ZeroDuration);
    }
    Ok(d)
}

// ===========================================================================
// Tests
// ===========================================================================
