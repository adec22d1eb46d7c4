//! The per-tick BBS session: drain inbound mail, post bulletins, send
//! private messages.

use std::sync::Arc;

use crate::bbs::BbsConnection;
use crate::definition::EventType;
use crate::message::{parse_address_list, Envelope, Received, ReceivedMessage};
use crate::state::Event;

use super::Engine;

/// Outcome of a transmit attempt.
enum Transmit {
    Sent,
    /// The message can never be sent (bad addresses); its event was dropped.
    Dropped,
    /// The BBS failed; abort the session and retry next tick.
    Transient,
}

impl Engine {
    /// Run one BBS session. Connection and send failures are transient: the
    /// current tick is abandoned and the pending work retried next tick.
    pub(crate) fn run_bbs_session(&mut self) {
        let mut conn = match (self.connector)(&self.def.exercise) {
            Ok(conn) => conn,
            Err(err) => {
                self.st.log_error(&format!("BBS connect: {err}"));
                return;
            }
        };
        self.session_body(conn.as_mut());
        if let Err(err) = conn.close() {
            self.st.log_error(&format!("BBS close: {err}"));
        }
    }

    fn session_body(&mut self, conn: &mut dyn BbsConnection) {
        // Drain inbound messages.
        for msgnum in 1.. {
            if !self.receive_one(conn, msgnum) {
                break;
            }
        }
        // Post any bulletins that are due. The global send event records the
        // posting; a per-station event per recipient tracks visibility and
        // cascades its own downstream expectations.
        while let Some(ev) = self.st.pending_event(EventType::Bulletin).cloned() {
            let Some((lmi, env, msg)) = self.generate_bulletin(&ev) else {
                self.st.drop_event(&ev);
                continue;
            };
            match self.transmit(conn, &ev, &lmi, &env, &msg.encode_body()) {
                Transmit::Dropped => continue,
                Transmit::Transient => return,
                Transmit::Sent => {}
            }
            let gev = self.st.send_message(
                EventType::Bulletin,
                "",
                ev.name(),
                &lmi,
                &env.subject_line,
                ev.trigger(),
            );
            self.run_triggers(&gev);
            let def = Arc::clone(&self.def);
            for stn in &def.stations {
                let sev = self.st.send_message(
                    EventType::Bulletin,
                    &stn.call_sign,
                    ev.name(),
                    &lmi,
                    &env.subject_line,
                    ev.trigger(),
                );
                self.run_triggers(&sev);
            }
        }
        // Send any private messages that are due.
        while let Some(ev) = self.st.pending_event(EventType::Send).cloned() {
            let Some((lmi, env, msg)) = self.generate_send_message(&ev) else {
                self.st.drop_event(&ev);
                continue;
            };
            match self.transmit(conn, &ev, &lmi, &env, &msg.encode_body()) {
                Transmit::Dropped => continue,
                Transmit::Transient => return,
                Transmit::Sent => {}
            }
            let sev = self.st.send_message(
                EventType::Send,
                ev.station(),
                ev.name(),
                &lmi,
                &env.subject_line,
                ev.trigger(),
            );
            self.run_triggers(&sev);
        }
    }

    /// Receive and process one BBS message. Returns whether to continue
    /// draining.
    fn receive_one(&mut self, conn: &mut dyn BbsConnection, msgnum: usize) -> bool {
        let raw = match conn.read(msgnum) {
            Ok(raw) => raw,
            Err(err) => {
                self.st.log_error(&format!("BBS read message: {err}"));
                return false;
            }
        };
        if raw.is_empty() {
            return false;
        }
        let received = match self.store.receive_message(
            &raw,
            &self.def.exercise.start_msg_id,
            &self.my_from(),
            self.st.now(),
        ) {
            Ok(received) => received,
            Err(err) => {
                // A message we can't record is dropped; the session goes on.
                self.st
                    .log_error(&format!("record received message: {err}"));
                if let Err(err) = conn.kill(&[msgnum]) {
                    self.st.log_error(&format!("BBS kill message: {err}"));
                    return false;
                }
                return true;
            }
        };
        match received {
            Received::ReadReceipt => {}
            Received::DeliveryReceipt { msgid, their_lmi } => {
                self.handle_delivery_receipt(&msgid, &their_lmi);
            }
            Received::Message(rm) => {
                // Send the delivery receipt we owe before processing.
                if let Some((renv, rbody)) = &rm.receipt {
                    if let Err(err) = self.send_receipt(conn, &rm.lmi, renv, rbody) {
                        self.st.log_error(&err);
                        return false;
                    }
                }
                self.process_received(conn, &rm);
            }
        }
        if let Err(err) = conn.kill(&[msgnum]) {
            self.st.log_error(&format!("BBS kill message: {err}"));
            return false;
        }
        true
    }

    fn handle_delivery_receipt(&mut self, msgid: &str, their_lmi: &str) {
        if msgid.is_empty() {
            return;
        }
        if their_lmi.is_empty() {
            self.st
                .log_error(&format!("malformed delivery receipt for {msgid}"));
            return;
        }
        // A second receipt for the same message is a peer-side slip, not an
        // event.
        if self
            .st
            .all_events()
            .iter()
            .any(|e| e.etype() == EventType::Send && e.lmi() == msgid && !e.rmi().is_empty())
        {
            self.st
                .log_error(&format!("duplicate delivery receipt for {msgid}"));
            return;
        }
        if let Some(ev) = self.st.receive_delivery_receipt(msgid, their_lmi) {
            if self
                .def
                .station(ev.station())
                .is_some_and(|s| s.no_receipts)
            {
                self.st.log_note("WARNING: unexpected delivery receipt");
            }
        }
    }

    fn send_receipt(
        &mut self,
        conn: &mut dyn BbsConnection,
        lmi: &str,
        renv: &Envelope,
        rbody: &str,
    ) -> Result<(), String> {
        let to = match parse_address_list(&renv.to) {
            Some(addrs) => addrs.into_iter().map(|a| a.address).collect::<Vec<_>>(),
            None => return Err(format!("send delivery receipt for {lmi}: invalid To: address")),
        };
        conn.send(&renv.subject_line, rbody, &to)
            .map_err(|err| format!("send delivery receipt for {lmi}: {err}"))?;
        if let Err(err) = self.store.save_receipt(lmi, renv, rbody) {
            return Err(format!("save receipt: {err}"));
        }
        Ok(())
    }

    fn process_received(&mut self, conn: &mut dyn BbsConnection, rm: &ReceivedMessage) {
        // The return address we record for the station.
        let mut from = rm.env.from.clone();
        if let Some(addrs) = parse_address_list(&from) {
            from = addrs[0].address.clone();
        }
        if from.contains(' ') {
            from.clear();
        }
        // Which station is it from?
        let station_call = self.station_from_address(&rm.env.from);
        if station_call == "UNKNOWN" {
            self.st
                .record_reject("UNKNOWN", "UNKNOWN", &rm.lmi, &from, &rm.env.subject_line);
            self.reject_unknown_sender(conn, &rm.env);
            return;
        }
        // Which message template does it match?
        let msgname = self.match_message(&rm.env.subject_line, &rm.msg);
        if msgname == "UNKNOWN" {
            self.st.record_reject(
                &station_call,
                "UNKNOWN",
                &rm.lmi,
                &from,
                &rm.env.subject_line,
            );
            self.reject_unknown_message(conn, &rm.env);
            return;
        }
        let ev = self
            .st
            .receive_message(&station_call, &msgname, &rm.lmi, &from, &rm.env.subject_line);
        let station = self
            .def
            .station(&station_call)
            .cloned()
            .expect("station_from_address matched a defined station");
        let (problems, score) = self.analyze(&station, &msgname, &rm.raw, &rm.lmi, &rm.env, &rm.msg);
        let ev = self.st.score_message(&ev, &problems, score);
        if ev.expected().is_some() {
            self.run_triggers(&ev);
        } else {
            self.st.log_note("ERROR: unexpected/early message");
        }
    }

    /// The defined station whose call sign matches the local part of the
    /// address, or `UNKNOWN`.
    fn station_from_address(&self, addrs: &str) -> String {
        if let Some(list) = parse_address_list(addrs) {
            let local = list[0]
                .address
                .split('@')
                .next()
                .unwrap_or("")
                .to_uppercase();
            if self.def.station(&local).is_some() {
                return local;
            }
        }
        "UNKNOWN".to_owned()
    }

    /// The template name for an arriving message, per the match-receive
    /// rules in declaration order, or `UNKNOWN`.
    fn match_message(&self, subject_line: &str, msg: &crate::message::Message) -> String {
        let subject = match msg.field(crate::message::Role::Subject) {
            Some(f) => f.value.as_str(),
            None => subject_line,
        };
        let formtag = msg.mtype.as_str();
        for rule in &self.def.match_receive {
            if !rule.mtype.is_empty() && rule.mtype != formtag {
                continue;
            }
            if !rule.subject.is_empty() && !rule.subject.eq_ignore_ascii_case(subject) {
                continue;
            }
            if let Some(re) = &rule.subject_re {
                if !re.is_match(subject) {
                    continue;
                }
            }
            return rule.name.clone();
        }
        "UNKNOWN".to_owned()
    }

    /// Send a message through the connection. Bad addresses drop the event;
    /// BBS failures are transient.
    fn transmit(
        &mut self,
        conn: &mut dyn BbsConnection,
        ev: &Event,
        lmi: &str,
        env: &Envelope,
        body: &str,
    ) -> Transmit {
        let to = match parse_address_list(&env.to) {
            Some(addrs) => addrs.into_iter().map(|a| a.address).collect::<Vec<_>>(),
            None => {
                self.st
                    .log_error(&format!("can't send {lmi}: invalid To: address list"));
                self.st.drop_event(ev);
                return Transmit::Dropped;
            }
        };
        if let Err(err) = conn.send(&env.subject_line, body, &to) {
            self.st.log_error(&format!("can't send {lmi}: BBS send: {err}"));
            return Transmit::Transient;
        }
        Transmit::Sent
    }

    fn reject_unknown_sender(&mut self, conn: &mut dyn BbsConnection, reject: &Envelope) {
        let body = format!(
            "{} received a message from you with\n  Subject: {}\nThe mailbox you sent this \
             message from does not correspond to any station\nparticipating in the current \
             exercise.  Please make sure you are sending from\nthe correct mailbox (e.g., your \
             assigned tactical callsign, not your personal\nFCC callsign).  If you cannot find \
             the problem, ask for help from the exercise\nmanager.",
            self.def.exercise.my_name, reject.subject_line
        );
        self.send_reject(conn, reject, &body);
    }

    fn reject_unknown_message(&mut self, conn: &mut dyn BbsConnection, reject: &Envelope) {
        let body = format!(
            "{} received a message from you with\n  Subject: {}\nThis subject line does not \
             match any of the messages the exercise automation\nwas expecting to receive.  \
             Please check the subject line and try again.  If you\ncannot find the problem, ask \
             for help from the exercise manager.",
            self.def.exercise.my_name, reject.subject_line
        );
        self.send_reject(conn, reject, &body);
    }

    fn send_reject(&mut self, conn: &mut dyn BbsConnection, reject: &Envelope, body: &str) {
        let subject = format!("REJECT: {}", reject.subject_line);
        if let Err(err) = conn.send(&subject, body, &[reject.from.clone()]) {
            self.st
                .log_error(&format!("sending reject message: {err}"));
        }
    }
}
