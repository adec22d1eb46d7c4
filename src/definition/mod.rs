//! Exercise definition: the immutable description of an exercise, loaded
//! once at startup from the definition file.

mod parse;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Local};
use regex::Regex;
use thiserror::Error;

use crate::vars::TemplateString;

pub use parse::load;

#[cfg(test)]
pub(crate) mod fixtures {
    //! A small but complete definition shared by tests across the crate.

    use std::sync::Arc;

    use super::Definition;

    pub(crate) const SAMPLE_DEF: &str = "\
[EXERCISE]
incident      Jade Dragon
activation    XND-23-01
opstart       09/23/2023 08:00
opend         09/23/2023 17:00
mycall        XNDEOC
myname        Exercise EOC
myposition    Operations
mylocation    County EOC
opcall        W6XYZ
opname        Pat Operator
bbsname       W1ABC
bbsaddress    w1abc.ampr.org:8080
bbspassword   secret
startmsgid    XND-100P

[FORM VALIDATION]
tag       minver  handling  toposition            tolocation
ICS213    2.0     ROUTINE   Planning, Operations  County EOC

[STATIONS]
callsign  prefix  fcccall  inject  position   location   receipt
KE6XYZ    6KE     •        print   Planning   City Hall  •
KE6ABC    6KA     •        •       Logistics  Firehouse  15m

[EVENTS]
group    type      name        trigger           delay  react
Startup  bulletin  WX_ALERT    manual            •      •
Startup  inject    FOO_REQ     start             3m     5m
Flow     send      STATUS_REQ  start             5m     •
Flow     receive   STATUS_RPT  send STATUS_REQ   10m    •

[MATCH RECEIVE]
name        type    subject  subjectre
FOO_REQ     ICS213  •        Resource.*
STATUS_RPT  •       •        .*status.*

[BULLETIN WX_ALERT]
Area      XSC@ALLXSC
Subject   Weather Alert
Message   Severe weather expected this afternoon.

[SEND STATUS_REQ]
type      ICS213
Subject   Status request
Message   Please report your station status.

[RECEIVE FOO_REQ]
type      ICS213
Subject   Resource request
Message   Need sandbags at «station.location».

[RECEIVE STATUS_RPT]
type      ICS213
Subject   «station.callsign» status
Message   Status normal.
";

    pub(crate) fn sample_definition() -> Arc<Definition> {
        Arc::new(super::parse::parse(SAMPLE_DEF, "exercise.def").expect("sample definition parses"))
    }
}

/// Form-validation entry key covering the container encoding itself rather
/// than any particular form.
pub const PACK_IT_FORMS: &str = "PackItForms";

#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("{file}: {err}")]
    Io {
        file: String,
        #[source]
        err: std::io::Error,
    },
    #[error("{file}:{line}: {detail}")]
    Syntax {
        file: String,
        line: usize,
        detail: String,
    },
    #[error("{file}: {detail}")]
    Invalid { file: String, detail: String },
}

/// The kind of an event, in both event definitions and state events.
///
/// `Receipt` and `Reject` are engine-internal (they never appear in an
/// `[EVENTS]` table); `Start` and `Manual` are triggers only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    Inject,
    Receive,
    Bulletin,
    Send,
    Deliver,
    Alert,
    Receipt,
    Reject,
    Start,
    Manual,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Inject => "inject",
            EventType::Receive => "receive",
            EventType::Bulletin => "bulletin",
            EventType::Send => "send",
            EventType::Deliver => "deliver",
            EventType::Alert => "alert",
            EventType::Receipt => "receipt",
            EventType::Reject => "reject",
            EventType::Start => "start",
            EventType::Manual => "manual",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "inject" => EventType::Inject,
            "receive" => EventType::Receive,
            "bulletin" => EventType::Bulletin,
            "send" => EventType::Send,
            "deliver" => EventType::Deliver,
            "alert" => EventType::Alert,
            "receipt" => EventType::Receipt,
            "reject" => EventType::Reject,
            "start" => EventType::Start,
            "manual" => EventType::Manual,
            _ => return Err(UnknownEventType(s.to_owned())),
        })
    }
}

#[derive(Error, Debug)]
#[error("unknown event type {0:?}")]
pub struct UnknownEventType(pub String);

/// `[EXERCISE]` section.
#[derive(Clone, Debug, Default)]
pub struct Exercise {
    pub listen_addr: String,
    pub incident: String,
    pub activation: String,
    pub op_start: Option<DateTime<Local>>,
    pub op_end: Option<DateTime<Local>>,
    pub my_call: String,
    pub my_name: String,
    pub my_position: String,
    pub my_location: String,
    pub op_call: String,
    pub op_name: String,
    pub bbs_name: String,
    pub bbs_address: String,
    pub bbs_password: String,
    pub email_from: String,
    pub smtp_address: String,
    pub smtp_user: String,
    pub smtp_password: String,
    pub start_msg_id: String,
    /// Every non-secret key of the section, exposed as `exercise.*` variables.
    pub variables: HashMap<String, String>,
}

/// `[FORM VALIDATION]` row.
#[derive(Clone, Debug, Default)]
pub struct FormValidation {
    pub min_ver: String,
    /// Explicit handling order, `"computed"`, or empty.
    pub handling: String,
    pub to_position: Vec<String>,
    pub to_location: Vec<String>,
}

/// `[STATIONS]` row.
#[derive(Clone, Debug)]
pub struct Station {
    pub call_sign: String,
    /// Three-character message-ID prefix the station is expected to use.
    pub prefix: String,
    pub fcc_call: String,
    /// `"print"`, an email address, or empty for no physical inject handoff.
    pub inject: String,
    pub position: String,
    pub location: String,
    /// How long after a send to expect the station's delivery receipt.
    pub receipt_delay: Duration,
    /// The station never sends delivery receipts; receiving one is worth a
    /// warning.
    pub no_receipts: bool,
    /// Every column of the row, exposed as `station.*` variables.
    pub variables: HashMap<String, String>,
}

impl Default for Station {
    fn default() -> Self {
        Station {
            call_sign: String::new(),
            prefix: String::new(),
            fcc_call: String::new(),
            inject: String::new(),
            position: String::new(),
            location: String::new(),
            receipt_delay: Duration::zero(),
            no_receipts: false,
            variables: HashMap::new(),
        }
    }
}

/// `[EVENTS]` row (one definition in the trigger graph).
#[derive(Clone, Debug)]
pub struct EventDef {
    pub group: String,
    pub etype: EventType,
    pub name: String,
    pub trigger_type: EventType,
    pub trigger_name: String,
    pub delay: Duration,
    pub condition: Option<Condition>,
}

#[derive(Clone, Debug)]
pub struct Condition {
    pub var: String,
    pub op: CondOp,
    pub val: String,
    /// Compiled pattern when `op` is `Matches`.
    pub re: Option<Regex>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CondOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Matches,
}

impl CondOp {
    pub fn parse(s: &str) -> Option<CondOp> {
        Some(match s {
            "=" => CondOp::Eq,
            "!=" => CondOp::Ne,
            "<" => CondOp::Lt,
            "<=" => CondOp::Le,
            ">" => CondOp::Gt,
            ">=" => CondOp::Ge,
            "≈" => CondOp::Matches,
            _ => return None,
        })
    }
}

/// `[MATCH RECEIVE]` row: assigns a template name to an arriving message.
#[derive(Clone, Debug)]
pub struct MatchReceive {
    pub name: String,
    /// Form type tag, or empty to match any type.
    pub mtype: String,
    /// Exact (case-insensitive) subject, or empty.
    pub subject: String,
    /// Anchored case-insensitive subject pattern, or none.
    pub subject_re: Option<Regex>,
}

impl MatchReceive {
    /// Whether this rule can never fire because `earlier` always matches
    /// first.
    pub(crate) fn hidden_by(&self, earlier: &MatchReceive) -> bool {
        if self.mtype != earlier.mtype {
            return false;
        }
        if !self.subject.is_empty() && self.subject == earlier.subject {
            return true;
        }
        if !self.subject.is_empty() {
            if let Some(re) = &earlier.subject_re {
                return re.is_match(&self.subject);
            }
        }
        false
    }
}

/// `[BULLETIN <name>]` section.
#[derive(Clone, Debug)]
pub struct BulletinDef {
    pub area: String,
    pub subject: String,
    pub message: String,
}

/// `[SEND <name>]` / `[RECEIVE <name>]` section: a message template.
#[derive(Clone, Debug)]
pub struct MessageDef {
    pub mtype: String,
    pub version: String,
    /// Field label to template value, in declaration order.
    pub fields: Vec<(String, TemplateString)>,
}

/// The immutable exercise definition.
#[derive(Clone, Debug)]
pub struct Definition {
    pub filename: String,
    pub exercise: Exercise,
    pub form_validation: HashMap<String, FormValidation>,
    pub stations: Vec<Station>,
    pub events: Vec<EventDef>,
    pub match_receive: Vec<MatchReceive>,
    pub bulletins: HashMap<String, BulletinDef>,
    pub sends: HashMap<String, MessageDef>,
    pub receives: HashMap<String, MessageDef>,
}

impl Definition {
    /// The station definition with the given call sign, if any.
    pub fn station(&self, call_sign: &str) -> Option<&Station> {
        self.stations.iter().find(|s| s.call_sign == call_sign)
    }

    /// The event definition with the given type and name, if any.
    pub fn event(&self, etype: EventType, name: &str) -> Option<&EventDef> {
        self.events
            .iter()
            .find(|e| e.etype == etype && e.name == name)
    }
}

/// Parse a duration written as descending `NdNhNmNs` components with an
/// optional sign, e.g. `5m`, `1h30m`, `-2d`, `+90m`. Returns `None` on
/// syntax errors or non-descending units.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let (neg, mut rest) = match s.as_bytes().first()? {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    if rest.is_empty() || !rest.as_bytes()[0].is_ascii_digit() {
        return None;
    }
    let mut total = Duration::zero();
    let mut last_mult = i64::MAX;
    while !rest.is_empty() {
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return None;
        }
        let val: i64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let mult = match rest.as_bytes().first()? {
            b'd' => 86400,
            b'h' => 3600,
            b'm' => 60,
            b's' => 1,
            _ => return None,
        };
        rest = &rest[1..];
        if mult >= last_mult {
            return None;
        }
        total += Duration::seconds(val * mult);
        last_mult = mult;
    }
    Some(if neg { -total } else { total })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("5m"), Some(Duration::minutes(5)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::minutes(90)));
        assert_eq!(parse_duration("-2d"), Some(Duration::days(-2)));
        assert_eq!(parse_duration("+90m"), Some(Duration::minutes(90)));
        assert_eq!(parse_duration("2d4h"), Some(Duration::hours(52)));
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("m5"), None);
        assert_eq!(parse_duration("5m2h"), None, "units must descend");
        assert_eq!(parse_duration("5x"), None);
    }

    #[test]
    fn event_type_round_trip() {
        for name in [
            "inject", "receive", "bulletin", "send", "deliver", "alert", "receipt", "reject",
            "start", "manual",
        ] {
            let et: EventType = name.parse().unwrap();
            assert_eq!(et.as_str(), name);
        }
        assert!("bogus".parse::<EventType>().is_err());
    }

    #[test]
    fn match_receive_shadowing() {
        let exact = MatchReceive {
            name: "A".into(),
            mtype: String::new(),
            subject: "Status Report".into(),
            subject_re: None,
        };
        let pattern = MatchReceive {
            name: "B".into(),
            mtype: String::new(),
            subject: String::new(),
            subject_re: Some(Regex::new("(?i)^status.*$").unwrap()),
        };
        assert!(exact.hidden_by(&pattern));
        assert!(!pattern.hidden_by(&exact));
    }
}
