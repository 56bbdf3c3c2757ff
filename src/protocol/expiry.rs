//! Compound duration strings for request expiry and cleanup settings.
//!
//! Accepts `[Nd][Nh][Nm][Ns]`, case-insensitive, at least one component:
//! `"30s"`, `"5m"`, `"1d2h30m"`.

use super::{ProtocolError, ProtocolResult};
use std::time::Duration;

/// Parse a compound duration string into a strictly positive duration.
pub fn parse_expiry(s: &str) -> ProtocolResult<Duration> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::InvalidExpiry(
            "duration cannot be empty".to_string(),
        ));
    }

    let mut total_secs: u64 = 0;
    let mut digits = String::new();
    let mut components = 0;

    for ch in trimmed.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if digits.is_empty() {
            return Err(ProtocolError::InvalidExpiry(format!(
                "unexpected {ch:?} in {trimmed:?}"
            )));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| ProtocolError::InvalidExpiry(format!("number too large in {trimmed:?}")))?;
        let unit_secs = match ch.to_ascii_lowercase() {
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            other => {
                return Err(ProtocolError::InvalidExpiry(format!(
                    "unknown unit {other:?} in {trimmed:?}"
                )))
            }
        };
        total_secs = total_secs
            .checked_add(value.saturating_mul(unit_secs))
            .ok_or_else(|| ProtocolError::InvalidExpiry(format!("overflow in {trimmed:?}")))?;
        digits.clear();
        components += 1;
    }

    if !digits.is_empty() {
        return Err(ProtocolError::InvalidExpiry(format!(
            "missing unit after {digits:?} in {trimmed:?}"
        )));
    }
    if components == 0 {
        return Err(ProtocolError::InvalidExpiry(format!(
            "no components in {trimmed:?}"
        )));
    }
    if total_secs == 0 {
        return Err(ProtocolError::InvalidExpiry(format!(
            "duration must be positive: {trimmed:?}"
        )));
    }

    Ok(Duration::from_secs(total_secs))
}
