//! Message generation from templates.

use std::sync::Arc;

use crate::definition::MessageDef;
use crate::message::{self, inject_lmi, Envelope, Message, Role};
use crate::state::Event;
use crate::vars::TemplateString;

use super::Engine;

impl Engine {
    /// Generate an outgoing private message for a pending send event.
    /// Returns `None` when the template or station no longer exists or the
    /// message can't be saved.
    pub(crate) fn generate_send_message(
        &mut self,
        ev: &Event,
    ) -> Option<(String, Envelope, Message)> {
        let lmi = match self
            .store
            .unique_message_id(&self.def.exercise.start_msg_id)
        {
            Ok(lmi) => lmi,
            Err(err) => {
                self.st.log_error(&err);
                return None;
            }
        };
        let def = Arc::clone(&self.def);
        let mut msg = self.generate_message(def.sends.get(ev.name()), ev.station())?;
        self.set_message_defaults(&mut msg, ev.station(), false);
        if let Some(f) = msg.field_mut(Role::OriginMsgId) {
            f.value = lmi.clone();
        }
        let env = Envelope {
            from: self.my_from(),
            to: self.st.address_for_station(ev.station()),
            subject_line: msg.encode_subject(),
            date: Some(self.st.now()),
            ..Envelope::default()
        };
        if let Err(err) = self.store.save_message(&lmi, &env, &msg.encode_body()) {
            self.st
                .log_error(&format!("saving generated message: {err}"));
            return None;
        }
        Some((lmi, env, msg))
    }

    /// Generate a bulletin for a pending bulletin event.
    pub(crate) fn generate_bulletin(&mut self, ev: &Event) -> Option<(String, Envelope, Message)> {
        let def = Arc::clone(&self.def);
        let tmpl = def.bulletins.get(ev.name())?;
        let lmi = match self
            .store
            .unique_message_id(&self.def.exercise.start_msg_id)
        {
            Ok(lmi) => lmi,
            Err(err) => {
                self.st.log_error(&err);
                return None;
            }
        };
        let env = Envelope {
            from: self.my_from(),
            to: tmpl.area.clone(),
            subject_line: tmpl.subject.clone(),
            date: Some(self.st.now()),
            bulletin: true,
            ..Envelope::default()
        };
        let mut msg = message::create("plain", "").expect("plain is registered");
        if let Some(f) = msg.field_mut(Role::Subject) {
            f.value = tmpl.subject.clone();
        }
        if let Some(f) = msg.field_mut(Role::Body) {
            f.value = tmpl.message.clone();
        }
        if let Err(err) = self.store.save_message(&lmi, &env, &msg.encode_body()) {
            self.st
                .log_error(&format!("saving generated bulletin: {err}"));
            return None;
        }
        Some((lmi, env, msg))
    }

    /// Generate the message we expect to receive for a pending inject
    /// event, so the operator can hand it to the station to send.
    pub(crate) fn generate_inject(&mut self, ev: &Event) -> Option<(String, Envelope, Message)> {
        let lmi = inject_lmi(ev.id());
        let def = Arc::clone(&self.def);
        let mut msg = self.generate_message(def.receives.get(ev.name()), ev.station())?;
        self.set_message_defaults(&mut msg, ev.station(), true);
        let env = Envelope::default();
        if let Err(err) = self.store.save_message(&lmi, &env, &msg.encode_body()) {
            self.st
                .log_error(&format!("saving generated inject: {err}"));
            return None;
        }
        Some((lmi, env, msg))
    }

    /// Regenerate the expected model of a received message from its
    /// template, for analysis when no stored inject is available.
    pub(crate) fn generate_received_model(
        &mut self,
        station: &str,
        msgname: &str,
    ) -> Option<Message> {
        let def = Arc::clone(&self.def);
        let mut msg = self.generate_message(def.receives.get(msgname), station)?;
        self.set_message_defaults(&mut msg, station, true);
        Some(msg)
    }

    /// Build a message from a template, interpolating variables into each
    /// field value.
    fn generate_message(&mut self, tmpl: Option<&MessageDef>, station: &str) -> Option<Message> {
        let tmpl = tmpl?;
        if !station.is_empty() && self.def.station(station).is_none() {
            return None;
        }
        let mut msg = message::create(&tmpl.mtype, &tmpl.version)?;
        for (fname, ftmpl) in &tmpl.fields {
            let value = self.generate_value(ftmpl, station);
            if let Some(f) = msg.field_by_label_mut(fname) {
                f.value = value;
            }
        }
        Some(msg)
    }

    /// Apply the default-value rules: date and time from the logical clock,
    /// handling from form validation, and the to/from routing block from
    /// the station entry and our own identity. `reverse` swaps to and from
    /// for injects (we will be the recipient).
    pub(crate) fn set_message_defaults(&mut self, msg: &mut Message, station: &str, reverse: bool) {
        let now = self.st.now();
        if let Some(f) = msg.field_mut(Role::MessageDate) {
            if f.value.is_empty() {
                f.value = now.format("%m/%d/%Y").to_string();
            }
        }
        if let Some(f) = msg.field_mut(Role::MessageTime) {
            if f.value.is_empty() {
                f.value = now.format("%H:%M").to_string();
            }
        }
        if msg.value(Role::Handling).is_empty() {
            if let Some(fv) = self.def.form_validation.get(&msg.mtype) {
                let handling = match fv.handling.as_str() {
                    "" => String::new(),
                    "computed" => computed_handling(msg),
                    explicit => explicit.to_owned(),
                };
                if !handling.is_empty() {
                    if let Some(f) = msg.field_mut(Role::Handling) {
                        f.value = handling;
                    }
                }
            }
        }
        let (mut topos, mut toloc) = match self.def.station(station) {
            Some(s) => (s.position.clone(), s.location.clone()),
            None => (String::new(), String::new()),
        };
        let mut frompos = self.def.exercise.my_position.clone();
        let mut fromloc = self.def.exercise.my_location.clone();
        if let Some(fv) = self.def.form_validation.get(&msg.mtype) {
            if topos.is_empty() {
                if let Some(p) = fv.to_position.first() {
                    topos = p.clone();
                }
            }
            if toloc.is_empty() {
                if let Some(l) = fv.to_location.first() {
                    toloc = l.clone();
                }
            }
        }
        if reverse {
            std::mem::swap(&mut topos, &mut frompos);
            std::mem::swap(&mut toloc, &mut fromloc);
        }
        for (role, value) in [
            (Role::FromIcsPosition, frompos),
            (Role::FromLocation, fromloc),
            (Role::ToIcsPosition, topos),
            (Role::ToLocation, toloc),
        ] {
            if let Some(f) = msg.field_mut(role) {
                if f.value.is_empty() {
                    f.value = value;
                }
            }
        }
    }

    /// Render one template value, logging any undefined variables.
    fn generate_value(&mut self, tmpl: &TemplateString, station: &str) -> String {
        let mut reports = Vec::new();
        let value = {
            let mut lookup = |name: &str| self.variable(name, station);
            tmpl.render(&mut lookup, &mut |report| reports.push(report))
        };
        for report in reports {
            self.st.log_error(&report);
        }
        value
    }
}

/// Handling order computed from the form's own severity or priority.
fn computed_handling(msg: &Message) -> String {
    match msg.mtype.as_str() {
        // ICS213 severity maps at analysis time; generation leaves it for
        // validation to flag.
        "ICS213" => String::new(),
        "EOC213RR" => match msg.value(Role::Priority) {
            "Now" | "High" => "IMMEDIATE".to_owned(),
            "Medium" => "PRIORITY".to_owned(),
            "Low" => "ROUTINE".to_owned(),
            _ => String::new(),
        },
        // The definition parser only allows computed handling for the two
        // forms above.
        other => panic!("computed handling order not supported for {other}"),
    }
}
