//! Variable interpolation for message templates.
//!
//! A template value is a sequence of literal text and `«…»` variable slots.
//! Each slot names a variable and may carry a byte-range suffix
//! (`«var:start:end»`) and/or a delta suffix (`«var+5»`, `«var-2d»`,
//! `«var+1h30m»`). Interpolation is a single pass over the parsed slots;
//! a slot value is never re-scanned for further interpolations.

use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use thiserror::Error;

use crate::definition::parse_duration;

static INTERP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^((?:exercise|station)\.[A-Za-z][-a-zA-Z0-9_]*|[A-Za-z][A-Za-z0-9_]*\.(?:msgid|subjectline|time)|now\.(?:date|time|datetime))(?::(-?[0-9]+)(?::(-?[0-9]+))?)?([-+]\d[0-9dhm]+)?$",
    )
    .unwrap()
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unmatched « in string")]
    UnmatchedOpen,
    #[error("syntax error in variable interpolation")]
    BadInterpolation,
}

/// A single `«…»` slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interp {
    pub var: String,
    /// Byte offset of the start of the slice; negative counts from the end.
    pub start: i64,
    /// Byte offset of the end of the slice; zero or negative counts from the
    /// end, so the default 0 means "to the end of the value".
    pub end: i64,
    /// Signed delta suffix, e.g. `+5`, `-2d`, `+1h30m`; empty if none.
    pub delta: String,
}

/// A parsed template value: literals and slots interleaved, always starting
/// and ending with a literal (possibly empty). `literals.len()` is always
/// `interps.len() + 1`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TemplateString {
    pub literals: Vec<String>,
    pub interps: Vec<Interp>,
}

impl TemplateString {
    /// Parse a template value. `check` validates each literal chunk (the
    /// definition parser passes its ASCII check here).
    pub fn parse(s: &str, check: impl Fn(&str) -> bool) -> Result<Self, TemplateError> {
        let mut tmpl = TemplateString::default();
        let mut rest = s;
        loop {
            match rest.find('«') {
                None => {
                    if !check(rest) {
                        return Err(TemplateError::BadInterpolation);
                    }
                    tmpl.literals.push(rest.to_owned());
                    return Ok(tmpl);
                }
                Some(idx) => {
                    if !check(&rest[..idx]) {
                        return Err(TemplateError::BadInterpolation);
                    }
                    tmpl.literals.push(rest[..idx].to_owned());
                    rest = &rest[idx + '«'.len_utf8()..];
                    let close = rest.find('»').ok_or(TemplateError::UnmatchedOpen)?;
                    tmpl.interps.push(parse_interp(&rest[..close])?);
                    rest = &rest[close + '»'.len_utf8()..];
                }
            }
        }
    }

    /// The names of all variables referenced by this template.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.interps.iter().map(|i| i.var.as_str())
    }

    /// Render the template. `lookup` resolves a variable name to its value;
    /// `report` receives a diagnostic for each undefined variable or
    /// inapplicable delta. Undefined variables render as the empty string.
    pub fn render(
        &self,
        lookup: &mut dyn FnMut(&str) -> Option<String>,
        report: &mut dyn FnMut(String),
    ) -> String {
        let mut out = String::new();
        for (i, interp) in self.interps.iter().enumerate() {
            out.push_str(&self.literals[i]);
            match lookup(&interp.var) {
                None => report(format!("no such variable {:?}", interp.var)),
                Some(val) => {
                    let mut val = slice_value(&val, interp.start, interp.end).to_owned();
                    if !interp.delta.is_empty() {
                        val = apply_delta(&interp.var, &val, &interp.delta, report);
                    }
                    out.push_str(&val);
                }
            }
        }
        out.push_str(self.literals.last().map(String::as_str).unwrap_or(""));
        out
    }
}

fn parse_interp(s: &str) -> Result<Interp, TemplateError> {
    let caps = INTERP_RE.captures(s).ok_or(TemplateError::BadInterpolation)?;
    let delta = caps.get(4).map(|m| m.as_str()).unwrap_or("");
    if !delta.is_empty() && delta[1..].parse::<i64>().is_err() && parse_duration(delta).is_none() {
        return Err(TemplateError::BadInterpolation);
    }
    Ok(Interp {
        var: caps[1].to_owned(),
        start: caps.get(2).map_or(0, |m| m.as_str().parse().unwrap_or(0)),
        end: caps.get(3).map_or(0, |m| m.as_str().parse().unwrap_or(0)),
        delta: delta.to_owned(),
    })
}

/// Slice a value by byte offsets, clamped. Negative start and non-positive
/// end count back from the end of the value.
fn slice_value(val: &str, start: i64, end: i64) -> &str {
    let len = val.len() as i64;
    let mut s = if start < 0 { start + len } else { start };
    let mut e = if end <= 0 { end + len } else { end };
    s = s.min(len - 1).max(0);
    e = e.min(len).max(0);
    if e < s {
        return "";
    }
    let (s, e) = (s as usize, e as usize);
    // Offsets are byte positions; back away from any char boundary violation
    // rather than panicking on multibyte input.
    if val.is_char_boundary(s) && val.is_char_boundary(e) {
        &val[s..e]
    } else {
        val
    }
}

const DATE_TIME_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M", "%m/%d/%Y %H:%M"];
const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%m/%d/%Y"];

/// Apply a `+N`/`-N` numeric or `±duration` date/time delta to a value.
fn apply_delta(
    var: &str,
    val: &str,
    delta: &str,
    report: &mut dyn FnMut(String),
) -> String {
    if let Ok(n) = delta.parse::<i64>() {
        if let Ok(v) = val.parse::<i64>() {
            return (v + n).to_string();
        }
        report(format!(
            "variable interpolation: can't add integer to non-integer {var}"
        ));
        return val.to_owned();
    }
    let Some(dur) = parse_duration(delta) else {
        report(format!(
            "variable interpolation: bad delta on variable {var}"
        ));
        return val.to_owned();
    };
    for fmt in DATE_TIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(val, fmt) {
            return (dt + dur).format(fmt).to_string();
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(val, fmt) {
            let dt = d.and_time(NaiveTime::MIN) + dur;
            return dt.format(fmt).to_string();
        }
    }
    if let Ok(t) = NaiveTime::parse_from_str(val, "%H:%M") {
        return (t + dur).format("%H:%M").to_string();
    }
    report(format!(
        "variable interpolation: can't add duration to non-date/time value {var}"
    ));
    val.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(tmpl: &str, lookup: &[(&str, &str)]) -> (String, Vec<String>) {
        let parsed = TemplateString::parse(tmpl, |_| true).unwrap();
        let mut reports = Vec::new();
        let out = parsed.render(
            &mut |name| {
                lookup
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, v)| (*v).to_owned())
            },
            &mut |msg| reports.push(msg),
        );
        (out, reports)
    }

    #[test]
    fn literal_passthrough() {
        let (out, reports) = render("no variables here", &[]);
        assert_eq!(out, "no variables here");
        assert!(reports.is_empty());
    }

    #[test]
    fn simple_interpolation() {
        let (out, reports) = render(
            "Hello «exercise.incident»!",
            &[("exercise.incident", "Big One")],
        );
        assert_eq!(out, "Hello Big One!");
        assert!(reports.is_empty());
    }

    #[test]
    fn undefined_variable_reports_and_renders_empty() {
        let (out, reports) = render("x«exercise.missing»y", &[]);
        assert_eq!(out, "xy");
        assert_eq!(reports.len(), 1);
    }

    #[test]
    fn slicing() {
        let (out, _) = render("«station.callsign:0:3»", &[("station.callsign", "KE6XYZ")]);
        assert_eq!(out, "KE6");
        let (out, _) = render("«station.callsign:-3»", &[("station.callsign", "KE6XYZ")]);
        assert_eq!(out, "XYZ");
    }

    #[test]
    fn integer_delta() {
        let (out, _) = render("«exercise.round+10»", &[("exercise.round", "32")]);
        assert_eq!(out, "42");
    }

    #[test]
    fn duration_delta_on_datetime() {
        let (out, _) = render(
            "«now.datetime+1h30m»",
            &[("now.datetime", "09/23/2023 08:00")],
        );
        assert_eq!(out, "09/23/2023 09:30");
    }

    #[test]
    fn day_delta_on_date() {
        let (out, _) = render("«now.date+2d»", &[("now.date", "09/23/2023")]);
        assert_eq!(out, "09/25/2023");
    }

    #[test]
    fn integer_delta_on_date_reports() {
        // An integer delta is a numeric add only; day arithmetic takes the
        // duration form.
        let (out, reports) = render("«now.date+10»", &[("now.date", "09/23/2023")]);
        assert_eq!(out, "09/23/2023");
        assert_eq!(reports.len(), 1);
    }

    #[test]
    fn delta_on_non_date_reports() {
        let (out, reports) = render("«exercise.name+1h»", &[("exercise.name", "drill")]);
        assert_eq!(out, "drill");
        assert_eq!(reports.len(), 1);
    }

    #[test]
    fn unmatched_open_rejected() {
        assert_eq!(
            TemplateString::parse("bad «exercise.x", |_| true),
            Err(TemplateError::UnmatchedOpen)
        );
    }

    #[test]
    fn nested_interpolation_rejected() {
        assert!(TemplateString::parse("««exercise.x»»", |_| true).is_err());
    }

    #[test]
    fn prior_message_accessors_parse() {
        assert!(TemplateString::parse("«FOO_REQ.msgid»", |_| true).is_ok());
        assert!(TemplateString::parse("«FOO_REQ.subjectline»", |_| true).is_ok());
        assert!(TemplateString::parse("«FOO_REQ.time»", |_| true).is_ok());
        assert!(TemplateString::parse("«FOO_REQ.body»", |_| true).is_err());
    }
}
