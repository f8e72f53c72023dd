// Token date fields: a 12-digit (or token-author-shortened) `YYMMDDHHMMSS` UTC timestamp,
// formatted and compared the way the reference implementation does (`format_date`/`token_value`'s
// date window check), including its two-digit-year century-straddle handling.

use chrono::{DateTime, TimeDelta, Utc};

/// Formats `base + delta_seconds` (saturating towards `base` on overflow in either direction) as
/// a 12-digit `YYMMDDHHMMSS` string.
pub fn format(base: DateTime<Utc>, delta_seconds: i64) -> String {
  let tt = if delta_seconds >= 0 {
    TimeDelta::try_seconds(delta_seconds)
      .and_then(|delta| base.checked_add_signed(delta))
      .filter(|t| *t >= base)
      .unwrap_or(base)
  } else {
    TimeDelta::try_seconds(-delta_seconds)
      .and_then(|delta| base.checked_sub_signed(delta))
      .filter(|t| *t <= base)
      .unwrap_or(base)
  };
  tt.format("%y%m%d%H%M%S").to_string()
}

/// Where a token's date field falls relative to the acceptance window `[date1, date2]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Window {
  Expired,
  Futuristic,
  Valid,
}

/// Classifies `field` (a token's date field, already truncated by the caller to at most 12
/// characters) against the window bounds `date1`/`date2`, both full-length formatted dates.
/// `date1 > date2` denotes a window straddling a century boundary (e.g. accepting `99*` through
/// `00*`), in which case only the "clearly outside both ends" case is flagged, as expired.
pub fn classify(field: &str, date1: &str, date2: &str) -> Window {
  let len = field.len().min(12);
  let field = &field[..len.min(field.len())];
  let d1 = &date1[..len.min(date1.len())];
  let d2 = &date2[..len.min(date2.len())];

  if date1 <= date2 {
    if field < d1 {
      Window::Expired
    } else if field > d2 {
      Window::Futuristic
    } else {
      Window::Valid
    }
  } else if field < d1 && field > d2 {
    Window::Expired
  } else {
    Window::Valid
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn formats_base_with_zero_delta() {
    let base = Utc.with_ymd_and_hms(2006, 8, 31, 12, 0, 0).unwrap();
    assert_eq!(format(base, 0), "060831120000");
  }

  #[test]
  fn formats_positive_delta() {
    let base = Utc.with_ymd_and_hms(2006, 8, 31, 12, 0, 0).unwrap();
    assert_eq!(format(base, 3600), "060831130000");
  }

  #[test]
  fn formats_negative_delta() {
    let base = Utc.with_ymd_and_hms(2006, 8, 31, 12, 0, 0).unwrap();
    assert_eq!(format(base, -3600), "060831110000");
  }

  #[test]
  fn negative_delta_saturates_towards_base_not_past_it() {
    let base = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 1).unwrap();
    assert_eq!(format(base, -1_000_000_000_000), format(base, 0));
  }

  #[test]
  fn classify_in_window() {
    assert_eq!(classify("060831120000", "060830000000", "060901000000"), Window::Valid);
  }

  #[test]
  fn classify_expired() {
    assert_eq!(classify("060801000000", "060830000000", "060901000000"), Window::Expired);
  }

  #[test]
  fn classify_futuristic() {
    assert_eq!(classify("061001000000", "060830000000", "060901000000"), Window::Futuristic);
  }

  #[test]
  fn classify_truncated_field_uses_only_available_digits() {
    assert_eq!(classify("0608", "060101000000", "061231000000"), Window::Valid);
  }

  #[test]
  fn classify_century_straddle_window() {
    // date1 > date2: the valid window wraps from late in one century to early in the next.
    assert_eq!(classify("991231235959", "990101000000", "000101000000"), Window::Valid);
    assert_eq!(classify("000101000000", "990101000000", "000101000000"), Window::Valid);
    assert_eq!(classify("500101000000", "990101000000", "000101000000"), Window::Expired);
  }
}
