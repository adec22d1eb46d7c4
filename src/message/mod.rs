//! Message model: envelopes, form messages, and the subject-line codec.
//!
//! This is a deliberately compact stand-in for a full form-encoding library.
//! It carries exactly the structure the generator and analyzer need: typed
//! fields with labels, presence, allowed values, and comparators, plus the
//! `msgid_handling_formtag_subject` subject-line convention and a PIFO-style
//! body encoding that round-trips through [`decode_body`].

mod compare;
mod forms;
mod store;

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Local};
use regex::Regex;

pub use compare::{render_compare, CompareKind, CompareResult};
pub use forms::{create, is_registered, DEFAULT_PIFO_VERSION};
pub use store::{inject_lmi, MessageStore, Received, ReceivedMessage, StoreError};

/// Message envelope: the transport-level wrapper around an encoded body.
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    pub subject_line: String,
    pub date: Option<DateTime<Local>>,
    pub bulletin: bool,
    /// The transport flagged the payload as something other than plain text.
    pub not_plain_text: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub name: String,
    pub address: String,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            f.write_str(&self.address)
        } else {
            write!(f, "{} <{}>", self.name, self.address)
        }
    }
}

/// Parse a comma-separated address list. Entries are either bare addresses
/// or `Name <address>`. Returns `None` if any entry is empty or malformed.
pub fn parse_address_list(s: &str) -> Option<Vec<Address>> {
    let mut addrs = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let addr = match (part.find('<'), part.rfind('>')) {
            (Some(open), Some(close)) if open < close => Address {
                name: part[..open].trim().trim_matches('"').to_owned(),
                address: part[open + 1..close].trim().to_owned(),
            },
            (None, None) => Address {
                name: String::new(),
                address: part.to_owned(),
            },
            _ => return None,
        };
        if addr.address.is_empty() || addr.address.contains(' ') {
            return None;
        }
        addrs.push(addr);
    }
    if addrs.is_empty() {
        None
    } else {
        Some(addrs)
    }
}

/// The semantic role of a field within a form, used by the generator's
/// default rules and by the analyzer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    OriginMsgId,
    MessageDate,
    MessageTime,
    Handling,
    Severity,
    Priority,
    ToIcsPosition,
    ToLocation,
    FromIcsPosition,
    FromLocation,
    Subject,
    Body,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Optional,
    Required,
}

#[derive(Clone, Debug)]
pub struct Field {
    pub label: &'static str,
    pub value: String,
    pub role: Role,
    pub presence: Presence,
    /// Allowed values; empty means free text.
    pub choices: &'static [&'static str],
    pub compare: CompareKind,
}

/// A decoded or generated message.
#[derive(Clone, Debug)]
pub struct Message {
    /// Form type tag, e.g. `ICS213`; `plain` for plain text.
    pub mtype: String,
    pub version: String,
    /// Version of the form container encoding; empty for plain text.
    pub pifo_version: String,
    pub fields: Vec<Field>,
    /// Labels present in a decoded body that the form does not define.
    pub unknown_fields: Vec<String>,
}

impl Message {
    pub fn field(&self, role: Role) -> Option<&Field> {
        self.fields.iter().find(|f| f.role == role)
    }

    pub fn field_mut(&mut self, role: Role) -> Option<&mut Field> {
        self.fields.iter_mut().find(|f| f.role == role)
    }

    pub fn field_by_label(&self, label: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.label == label)
    }

    pub fn field_by_label_mut(&mut self, label: &str) -> Option<&mut Field> {
        self.fields.iter_mut().find(|f| f.label == label)
    }

    pub fn value(&self, role: Role) -> &str {
        self.field(role).map(|f| f.value.as_str()).unwrap_or("")
    }

    /// Form messages carry a routing block; plain text does not.
    pub fn is_form(&self) -> bool {
        self.field(Role::ToIcsPosition).is_some()
    }

    /// Encode the subject line from the message contents.
    pub fn encode_subject(&self) -> String {
        let msgid = self.value(Role::OriginMsgId);
        let handling = handling_code(self.value(Role::Handling));
        let severity = severity_code(self.value(Role::Severity));
        let hseg = if severity.is_empty() {
            handling.to_owned()
        } else {
            format!("{severity}/{handling}")
        };
        let subject = self.value(Role::Subject);
        if self.is_form() {
            format!("{msgid}_{hseg}_{}_{subject}", self.mtype)
        } else {
            format!("{msgid}_{hseg}_{subject}")
        }
    }

    /// Encode the message body. Forms use the PIFO-style container; plain
    /// text is just the body field.
    pub fn encode_body(&self) -> String {
        if !self.is_form() {
            return self.value(Role::Body).to_owned();
        }
        let mut out = String::from("!SCCoPIFO!\n");
        out.push_str(&format!("#T: {}.html\n", self.mtype));
        out.push_str(&format!("#V: {}-{}\n", self.pifo_version, self.version));
        for f in &self.fields {
            if !f.value.is_empty() {
                out.push_str(&format!("{}: [{}]\n", f.label, f.value));
            }
        }
        out.push_str("!/ADDON!\n");
        out
    }

    /// Validate the message against the form's own rules. Returns one
    /// problem string per violation.
    pub fn pifo_valid(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for f in &self.fields {
            if f.presence == Presence::Required && f.value.is_empty() {
                problems.push(format!("the {:?} field is required", f.label));
            }
            if !f.value.is_empty() && !f.choices.is_empty() && !f.choices.contains(&f.value.as_str())
            {
                problems.push(format!("the {:?} field has a non-standard value", f.label));
            }
        }
        problems
    }
}

/// The pieces of a decoded subject line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodedSubject {
    /// Origin message ID; empty when the subject does not follow the
    /// convention at all.
    pub msgid: String,
    /// Severity code (`E`/`U`/`O`) if present.
    pub severity: String,
    /// Handling code (`R`/`P`/`I`), possibly empty or unrecognized text.
    pub handling: String,
    /// Form tag, when the third segment names a registered form.
    pub formtag: String,
    pub subject: String,
}

static SUBJECT_MSGID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9]{3}-[0-9]+[A-Z]$").unwrap());

/// Decode a subject line of the form `msgid_handling[_formtag]_subject`.
pub fn decode_subject(line: &str) -> DecodedSubject {
    let mut parts = line.splitn(4, '_');
    let msgid = parts.next().unwrap_or("");
    if !SUBJECT_MSGID_RE.is_match(msgid) {
        return DecodedSubject::default();
    }
    let mut dec = DecodedSubject {
        msgid: msgid.to_owned(),
        ..DecodedSubject::default()
    };
    let hseg = parts.next().unwrap_or("");
    match hseg.split_once('/') {
        Some((sev, h)) => {
            dec.severity = sev.to_owned();
            dec.handling = h.to_owned();
        }
        None => dec.handling = hseg.to_owned(),
    }
    let rest: Vec<&str> = parts.collect();
    match rest.as_slice() {
        [tag, subject] if is_registered(tag) => {
            dec.formtag = (*tag).to_owned();
            dec.subject = (*subject).to_owned();
        }
        parts => dec.subject = parts.join("_"),
    }
    dec
}

/// Decode a message body (with its already-parsed subject line) into a
/// `Message`. A body containing the form container marker decodes as a form;
/// anything else decodes as plain text.
pub fn decode_body(subject_line: &str, body: &str) -> Message {
    let dec = decode_subject(subject_line);
    if let Some(msg) = decode_form(body, &dec) {
        return msg;
    }
    let mut msg = forms::create("plain", "").expect("plain is registered");
    set_value(&mut msg, Role::OriginMsgId, &dec.msgid);
    set_value(&mut msg, Role::Handling, expand_handling(&dec.handling));
    set_value(&mut msg, Role::Subject, &dec.subject);
    set_value(&mut msg, Role::Body, body);
    msg
}

fn decode_form(body: &str, dec: &DecodedSubject) -> Option<Message> {
    let mut lines = body.lines();
    if lines.by_ref().find(|l| !l.trim().is_empty())? != "!SCCoPIFO!" {
        return None;
    }
    let mut tag = String::new();
    let mut pifo_version = String::new();
    let mut version = String::new();
    let mut values: Vec<(String, String)> = Vec::new();
    for line in lines {
        if line == "!/ADDON!" {
            break;
        }
        if let Some(t) = line.strip_prefix("#T: ") {
            tag = t.trim().trim_end_matches(".html").to_owned();
        } else if let Some(v) = line.strip_prefix("#V: ") {
            match v.trim().split_once('-') {
                Some((pv, fv)) => {
                    pifo_version = pv.to_owned();
                    version = fv.to_owned();
                }
                None => pifo_version = v.trim().to_owned(),
            }
        } else if let Some((label, rest)) = line.split_once(": ") {
            let value = rest
                .strip_prefix('[')
                .and_then(|r| r.strip_suffix(']'))
                .unwrap_or(rest);
            values.push((label.to_owned(), value.to_owned()));
        }
    }
    if tag.is_empty() {
        return None;
    }
    let mut msg = match forms::create(&tag, &version) {
        Some(m) => m,
        // A form of a type we don't know: keep the tag so the analyzer can
        // flag it, but expose only the subject-line fields.
        None => {
            let mut m = forms::create("plain", "").expect("plain is registered");
            m.mtype = tag.clone();
            set_value(&mut m, Role::Handling, expand_handling(&dec.handling));
            set_value(&mut m, Role::Subject, &dec.subject);
            m
        }
    };
    msg.pifo_version = pifo_version;
    for (label, value) in values {
        match msg.field_by_label_mut(&label) {
            Some(f) => f.value = value,
            None => msg.unknown_fields.push(label),
        }
    }
    if msg.value(Role::OriginMsgId).is_empty() {
        set_value(&mut msg, Role::OriginMsgId, &dec.msgid);
    }
    Some(msg)
}

fn set_value(msg: &mut Message, role: Role, value: &str) {
    if let Some(f) = msg.field_mut(role) {
        f.value = value.to_owned();
    }
}

/// One-letter handling code for a full handling order name.
pub fn handling_code(handling: &str) -> &str {
    match handling {
        "IMMEDIATE" => "I",
        "PRIORITY" => "P",
        "ROUTINE" => "R",
        other => other,
    }
}

/// Full handling order name for a one-letter code.
pub fn expand_handling(code: &str) -> &str {
    match code {
        "I" => "IMMEDIATE",
        "P" => "PRIORITY",
        "R" => "ROUTINE",
        other => other,
    }
}

fn severity_code(severity: &str) -> &str {
    match severity {
        "EMERGENCY" => "E",
        "URGENT" => "U",
        "OTHER" => "O",
        other => other,
    }
}

/// Whether version `a` is older than version `b`, comparing dotted numeric
/// segments (`3.9` is older than `3.12`).
pub fn older_version(a: &str, b: &str) -> bool {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|seg| {
                seg.chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (va, vb) = (parse(a), parse(b));
    for i in 0..va.len().max(vb.len()) {
        let (x, y) = (
            va.get(i).copied().unwrap_or(0),
            vb.get(i).copied().unwrap_or(0),
        );
        if x != y {
            return x < y;
        }
    }
    false
}

/// Render an envelope and body as the on-wire / on-disk text form.
pub fn encode_raw(env: &Envelope, body: &str) -> String {
    let mut out = String::new();
    if !env.from.is_empty() {
        out.push_str(&format!("From: {}\n", env.from));
    }
    if !env.to.is_empty() {
        out.push_str(&format!("To: {}\n", env.to));
    }
    out.push_str(&format!("Subject: {}\n", env.subject_line));
    if let Some(date) = env.date {
        out.push_str(&format!("Date: {}\n", date.format("%a, %d %b %Y %H:%M:%S %z")));
    }
    out.push('\n');
    out.push_str(body);
    out
}

/// Parse the on-wire text form into an envelope and body.
pub fn decode_raw(raw: &str) -> (Envelope, String) {
    let mut env = Envelope::default();
    let mut lines = raw.lines();
    for line in lines.by_ref() {
        if line.trim().is_empty() {
            break;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.to_ascii_lowercase().as_str() {
            "from" => env.from = value.to_owned(),
            "to" => env.to = value.to_owned(),
            "subject" => env.subject_line = value.to_owned(),
            "date" => {
                env.date = DateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S %z")
                    .ok()
                    .map(|d| d.with_timezone(&Local));
            }
            "content-type" => {
                if !value.starts_with("text/plain") {
                    env.not_plain_text = true;
                }
            }
            _ => {}
        }
    }
    let body: String = lines.collect::<Vec<_>>().join("\n");
    (env, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_list_parsing() {
        let addrs = parse_address_list("Joe Smith <ke6xyz@w1abc.ampr.org>, w6foo").unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].name, "Joe Smith");
        assert_eq!(addrs[0].address, "ke6xyz@w1abc.ampr.org");
        assert_eq!(addrs[1].address, "w6foo");
        assert!(parse_address_list("").is_none());
        assert!(parse_address_list("bad <").is_none());
    }

    #[test]
    fn subject_round_trip_form() {
        let mut msg = create("ICS213", "").unwrap();
        for (role, value) in [
            (Role::OriginMsgId, "XND-001P"),
            (Role::Handling, "ROUTINE"),
            (Role::Subject, "Supplies needed"),
        ] {
            msg.field_mut(role).unwrap().value = value.to_owned();
        }
        assert_eq!(msg.encode_subject(), "XND-001P_R_ICS213_Supplies needed");
        let dec = decode_subject(&msg.encode_subject());
        assert_eq!(dec.msgid, "XND-001P");
        assert_eq!(dec.handling, "R");
        assert_eq!(dec.formtag, "ICS213");
        assert_eq!(dec.subject, "Supplies needed");
    }

    #[test]
    fn subject_with_severity() {
        let dec = decode_subject("XND-002P_U/I_ICS213_Evacuation");
        assert_eq!(dec.severity, "U");
        assert_eq!(dec.handling, "I");
        assert_eq!(dec.formtag, "ICS213");
    }

    #[test]
    fn malformed_subject_yields_empty_msgid() {
        assert_eq!(decode_subject("hello world").msgid, "");
        assert_eq!(decode_subject("").msgid, "");
    }

    #[test]
    fn body_round_trip_form() {
        let mut msg = create("ICS213", "").unwrap();
        msg.field_mut(Role::Subject).unwrap().value = "Test".into();
        msg.field_mut(Role::Body).unwrap().value = "A message.".into();
        msg.field_mut(Role::Handling).unwrap().value = "ROUTINE".into();
        msg.field_mut(Role::ToIcsPosition).unwrap().value = "Planning".into();
        let body = msg.encode_body();
        let decoded = decode_body("XND-001P_R_ICS213_Test", &body);
        assert_eq!(decoded.mtype, "ICS213");
        assert_eq!(decoded.value(Role::Subject), "Test");
        assert_eq!(decoded.value(Role::ToIcsPosition), "Planning");
        assert!(decoded.unknown_fields.is_empty());
    }

    #[test]
    fn decode_body_plain() {
        let msg = decode_body("XND-003P_P_Checking in", "All stations normal.");
        assert_eq!(msg.mtype, "plain");
        assert_eq!(msg.value(Role::Handling), "PRIORITY");
        assert_eq!(msg.value(Role::Subject), "Checking in");
        assert_eq!(msg.value(Role::Body), "All stations normal.");
    }

    #[test]
    fn decode_body_unknown_form_tag() {
        let body = "!SCCoPIFO!\n#T: XX999.html\n#V: 3.12-1.0\nStuff: [x]\n!/ADDON!\n";
        let msg = decode_body("XND-004P_R_Unknown", body);
        assert_eq!(msg.mtype, "XX999");
        assert!(!msg.is_form());
    }

    #[test]
    fn unknown_field_recorded() {
        let body = "!SCCoPIFO!\n#T: ICS213.html\n#V: 3.12-2.2\nSubject: [Hi]\nBogus: [x]\n!/ADDON!\n";
        let msg = decode_body("XND-005P_R_ICS213_Hi", body);
        assert_eq!(msg.unknown_fields, vec!["Bogus".to_owned()]);
    }

    #[test]
    fn version_ordering() {
        assert!(older_version("3.9", "3.12"));
        assert!(!older_version("3.12", "3.9"));
        assert!(!older_version("2.2", "2.2"));
        assert!(older_version("2", "2.0.1"));
    }

    #[test]
    fn raw_round_trip() {
        let env = Envelope {
            from: "KE6XYZ <ke6xyz@w1abc.ampr.org>".into(),
            to: "xnd".into(),
            subject_line: "XND-001P_R_Test".into(),
            ..Envelope::default()
        };
        let raw = encode_raw(&env, "body text");
        let (decoded, body) = decode_raw(&raw);
        assert_eq!(decoded.from, env.from);
        assert_eq!(decoded.to, env.to);
        assert_eq!(decoded.subject_line, env.subject_line);
        assert_eq!(body, "body text");
        assert!(!decoded.not_plain_text);
    }

    #[test]
    fn non_plain_content_type_flagged() {
        let raw = "From: x\nContent-Type: text/html\nSubject: s\n\nbody";
        let (env, _) = decode_raw(raw);
        assert!(env.not_plain_text);
    }
}
