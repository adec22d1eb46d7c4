//! The built-in form registry.

use super::{CompareKind, Field, Message, Presence, Role};

/// Version of the form container encoding this library writes.
pub const DEFAULT_PIFO_VERSION: &str = "3.12";

const HANDLING_CHOICES: &[&str] = &["IMMEDIATE", "PRIORITY", "ROUTINE"];
const SEVERITY_CHOICES: &[&str] = &["EMERGENCY", "URGENT", "OTHER"];
const PRIORITY_CHOICES: &[&str] = &["Now", "High", "Medium", "Low"];

struct FieldSpec {
    label: &'static str,
    role: Role,
    presence: Presence,
    choices: &'static [&'static str],
    compare: CompareKind,
}

macro_rules! field {
    ($label:literal, $role:ident, $presence:ident, $compare:ident) => {
        FieldSpec {
            label: $label,
            role: Role::$role,
            presence: Presence::$presence,
            choices: &[],
            compare: CompareKind::$compare,
        }
    };
    ($label:literal, $role:ident, $presence:ident, $compare:ident, $choices:expr) => {
        FieldSpec {
            label: $label,
            role: Role::$role,
            presence: Presence::$presence,
            choices: $choices,
            compare: CompareKind::$compare,
        }
    };
}

const PLAIN_FIELDS: &[FieldSpec] = &[
    field!("Origin Msg #", OriginMsgId, Required, None),
    field!("Handling", Handling, Required, Exact, HANDLING_CHOICES),
    field!("Subject", Subject, Required, Text),
    field!("Message", Body, Required, Text),
];

const ICS213_FIELDS: &[FieldSpec] = &[
    field!("Origin Msg #", OriginMsgId, Required, None),
    field!("Date", MessageDate, Required, Date),
    field!("Time", MessageTime, Required, Time),
    field!("Severity", Severity, Optional, Exact, SEVERITY_CHOICES),
    field!("Handling", Handling, Required, Exact, HANDLING_CHOICES),
    field!("To ICS Position", ToIcsPosition, Required, Text),
    field!("To Location", ToLocation, Required, Text),
    field!("From ICS Position", FromIcsPosition, Required, Text),
    field!("From Location", FromLocation, Required, Text),
    field!("Subject", Subject, Required, Text),
    field!("Message", Body, Required, Text),
];

const EOC213RR_FIELDS: &[FieldSpec] = &[
    field!("Origin Msg #", OriginMsgId, Required, None),
    field!("Date", MessageDate, Required, Date),
    field!("Time", MessageTime, Required, Time),
    field!("Handling", Handling, Required, Exact, HANDLING_CHOICES),
    field!("To ICS Position", ToIcsPosition, Required, Text),
    field!("To Location", ToLocation, Required, Text),
    field!("From ICS Position", FromIcsPosition, Required, Text),
    field!("From Location", FromLocation, Required, Text),
    field!("Incident Name", Subject, Required, Text),
    field!("Date/Time Initiated", Other, Optional, Text),
    field!("Requested By", Other, Optional, Text),
    field!("Priority", Priority, Required, Exact, PRIORITY_CHOICES),
    field!("Resource Description", Body, Required, Text),
];

const REGISTRY: &[(&str, &str, &[FieldSpec])] = &[
    ("plain", "1", PLAIN_FIELDS),
    ("ICS213", "2.2", ICS213_FIELDS),
    ("EOC213RR", "2.4", EOC213RR_FIELDS),
];

/// Whether `tag` names a registered message type.
pub fn is_registered(tag: &str) -> bool {
    REGISTRY.iter().any(|(t, _, _)| *t == tag)
}

/// Create a blank message of the named type. `version` defaults to the
/// form's current version when empty; any dotted-numeric version is
/// accepted.
pub fn create(tag: &str, version: &str) -> Option<Message> {
    let &(_, default_version, specs) = REGISTRY.iter().find(|(t, _, _)| *t == tag)?;
    let version = if version.is_empty() {
        default_version
    } else {
        if !version
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.')
            || !version.starts_with(|c: char| c.is_ascii_digit())
        {
            return None;
        }
        version
    };
    Some(Message {
        mtype: tag.to_owned(),
        version: version.to_string(),
        pifo_version: if tag == "plain" {
            String::new()
        } else {
            DEFAULT_PIFO_VERSION.to_owned()
        },
        fields: specs
            .iter()
            .map(|s| Field {
                label: s.label,
                value: String::new(),
                role: s.role,
                presence: s.presence,
                choices: s.choices,
                compare: s.compare,
            })
            .collect(),
        unknown_fields: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup() {
        assert!(is_registered("ICS213"));
        assert!(is_registered("plain"));
        assert!(!is_registered("ICS214"));
    }

    #[test]
    fn create_with_default_version() {
        let msg = create("ICS213", "").unwrap();
        assert_eq!(msg.version, "2.2");
        assert_eq!(msg.pifo_version, DEFAULT_PIFO_VERSION);
        assert!(msg.is_form());
    }

    #[test]
    fn create_with_bad_version() {
        assert!(create("ICS213", "x.y").is_none());
        assert!(create("ICS213", "2.1").is_some());
    }

    #[test]
    fn plain_is_not_a_form() {
        let msg = create("plain", "").unwrap();
        assert!(!msg.is_form());
        assert!(msg.pifo_version.is_empty());
    }
}
