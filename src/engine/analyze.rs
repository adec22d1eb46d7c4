//! Analysis and scoring of received messages.

use std::sync::LazyLock;

use regex::Regex;

use crate::definition::{Station, PACK_IT_FORMS};
use crate::message::{
    self, inject_lmi, older_version, render_compare, Envelope, Message, Role,
};

use super::Engine;

static MSGNUM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[A-Z][A-Z][A-Z]|[A-Z][0-9][A-Z0-9]|[0-9][A-Z][A-Z])-\d\d\d+[AC-HJ-NPR-Y]$")
        .unwrap()
});

const FORM_MARKERS: [&str; 3] = ["!SCCoPIFO!", "!PACF!", "!/ADDON!"];

fn non_ascii(c: char) -> bool {
    c > '\x7e' || (c < ' ' && c != '\t' && c != '\n')
}

impl Engine {
    /// Analyze a received message against its model and the form rules.
    /// Returns the problems found and a percentage score.
    pub(crate) fn analyze(
        &mut self,
        station: &Station,
        msgname: &str,
        raw: &str,
        lmi: &str,
        env: &Envelope,
        msg: &Message,
    ) -> (Vec<String>, u32) {
        let mut problems: Vec<String> = Vec::new();
        let mut score = 0usize;
        let mut out_of = 0usize;
        let mut max_score = 100usize;

        // Prefer the model saved with the matching inject, if any.
        let rmi = msg.value(Role::OriginMsgId).to_owned();
        let mut model = None;
        if let Some(ev) = self.st.match_inject(&station.call_sign, msgname, &rmi) {
            let inj = inject_lmi(ev.id());
            match self.store.read_message(&inj) {
                Ok((_, m)) => model = Some(m),
                Err(err) => self.st.log_error(&format!(
                    "can't read inject {inj} for analysis of {lmi}: {err}"
                )),
            }
        }

        // Transport-level checks.
        out_of += 1;
        if env.not_plain_text {
            problems.push("not a plain text message".to_owned());
        } else {
            score += 1;
        }
        out_of += 1;
        if raw.chars().any(non_ascii) {
            problems.push("message has non-ASCII characters".to_owned());
        } else {
            score += 1;
        }

        if msg.is_form() {
            // The encoded subject must match the envelope subject (a
            // trailing space is tolerated).
            out_of += 1;
            let subject = msg.encode_subject();
            if env.subject_line != subject && env.subject_line != subject.trim_end_matches(' ') {
                problems.push("message subject doesn't agree with form contents".to_owned());
            } else {
                score += 1;
            }
            let pifo_problems = msg.pifo_valid();
            out_of += pifo_problems.len();
            problems.extend(pifo_problems);
            if let Some(fv) = self.def.form_validation.get(PACK_IT_FORMS) {
                if !fv.min_ver.is_empty() {
                    out_of += 1;
                    if older_version(&msg.pifo_version, &fv.min_ver) {
                        problems.push("PackItForms version out of date".to_owned());
                    } else {
                        score += 1;
                    }
                }
            }
            if let Some(fv) = self.def.form_validation.get(&msg.mtype) {
                if !fv.min_ver.is_empty() {
                    out_of += 1;
                    if older_version(&msg.version, &fv.min_ver) {
                        problems.push("form version out of date".to_owned());
                    } else {
                        score += 1;
                    }
                }
            }
            let omi = msg.value(Role::OriginMsgId);
            if !omi.is_empty() {
                out_of += 1;
                if !MSGNUM_RE.is_match(omi) {
                    problems.push("incorrect message number format".to_owned());
                } else if !station.prefix.is_empty() && !omi.starts_with(&station.prefix) {
                    problems.push("wrong message number prefix".to_owned());
                } else {
                    score += 1;
                }
            }
            out_of += 1;
            if !msg.unknown_fields.is_empty() {
                problems.push("form has extra fields".to_owned());
            } else {
                score += 1;
            }
        } else {
            // Plain text messages, and forms of unknown type.
            out_of += 1;
            let dec = message::decode_subject(&env.subject_line);
            if dec.msgid.is_empty() {
                problems.push("incorrect subject line format".to_owned());
            } else {
                let omi = msg.value(Role::OriginMsgId);
                if !MSGNUM_RE.is_match(omi) {
                    problems.push("incorrect message number format".to_owned());
                } else if !station.prefix.is_empty() && !omi.starts_with(&station.prefix) {
                    problems.push("wrong message number prefix".to_owned());
                } else {
                    score += 1;
                }
                out_of += 1;
                if !dec.severity.is_empty() {
                    problems.push("severity on subject line".to_owned());
                } else {
                    score += 1;
                }
                out_of += 1;
                match dec.handling.as_str() {
                    "R" | "P" | "I" => score += 1,
                    "" => problems.push("missing handling order code".to_owned()),
                    _ => problems.push("unknown handling order code".to_owned()),
                }
            }
            if msg.mtype == "plain" {
                out_of += 1;
                let body = msg.value(Role::Body);
                if FORM_MARKERS.iter().any(|m| body.contains(m)) {
                    problems.push("incorrectly encoded form".to_owned());
                } else if !dec.formtag.is_empty() {
                    problems.push("form name in subject of non-form message".to_owned());
                } else {
                    score += 1;
                }
            }
        }

        // Without an inject, regenerate the model from the template. It may
        // still be missing (template or station removed).
        if model.is_none() {
            model = self.generate_received_model(&station.call_sign, msgname);
        }
        // A model of a different type can't be compared field by field.
        if let Some(m) = &model {
            if m.mtype != msg.mtype {
                problems.push("incorrect message type".to_owned());
                max_score /= 2;
                model = None;
            }
        }
        if let Some(model) = model {
            for f in &model.fields {
                if f.value.is_empty() {
                    continue;
                }
                let actual = msg
                    .field_by_label(f.label)
                    .map(|mf| mf.value.as_str())
                    .unwrap_or("");
                if let Some(comp) = f.compare.compare(&f.value, actual) {
                    out_of += comp.out_of;
                    score += comp.score;
                    if comp.score != comp.out_of {
                        problems.push(format!(
                            "transcription error in {}: {}",
                            f.label,
                            render_compare(&comp)
                        ));
                    }
                }
            }
        } else if let Some(fv) = self.def.form_validation.get(&msg.mtype) {
            // No model: fall back to the form-validation preferences.
            let expected = match fv.handling.as_str() {
                "computed" => computed_expectation(msg),
                explicit => explicit.to_owned(),
            };
            let handling = msg.value(Role::Handling);
            if !handling.is_empty() && !expected.is_empty() {
                out_of += 1;
                if handling != expected {
                    problems.push("\"Handling\" value is not recommended".to_owned());
                } else {
                    score += 1;
                }
            }
            let topos = msg.value(Role::ToIcsPosition);
            if !topos.is_empty() && !fv.to_position.is_empty() {
                out_of += 1;
                if fv.to_position.iter().any(|p| p == topos) {
                    score += 1;
                } else {
                    problems.push("\"To ICS Position\" value is not recommended".to_owned());
                }
            }
            let toloc = msg.value(Role::ToLocation);
            if !toloc.is_empty() && !fv.to_location.is_empty() {
                out_of += 1;
                if fv.to_location.iter().any(|l| l == toloc) {
                    score += 1;
                } else {
                    problems.push("\"To Location\" value is not recommended".to_owned());
                }
            }
        }

        (problems, (score * max_score / out_of.max(1)) as u32)
    }
}

/// The handling order the form's own severity or priority implies.
fn computed_expectation(msg: &Message) -> String {
    match msg.mtype.as_str() {
        "ICS213" => match msg.value(Role::Severity) {
            "EMERGENCY" => "IMMEDIATE".to_owned(),
            "URGENT" => "PRIORITY".to_owned(),
            "OTHER" => "ROUTINE".to_owned(),
            _ => String::new(),
        },
        "EOC213RR" => match msg.value(Role::Priority) {
            "Now" | "High" => "IMMEDIATE".to_owned(),
            "Medium" => "PRIORITY".to_owned(),
            "Low" => "ROUTINE".to_owned(),
            _ => String::new(),
        },
        _ => String::new(),
    }
}
