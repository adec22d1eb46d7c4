//! Typed state mutations.
//!
//! Every method here builds a single log line, runs it through the executor,
//! and returns the resulting event. Calling one with arguments the executor
//! would reject is a programming error and panics.

use chrono::{DateTime, Local};

use crate::definition::EventType;

use super::{Event, State, EXPECTED_FORMAT};

fn safe_station(station: &str) -> &str {
    if station.is_empty() {
        "ALL"
    } else {
        station
    }
}

impl State {
    /// Record the start of the exercise. Valid only before any other event.
    pub fn start_exercise(&mut self) -> Event {
        assert!(self.events.is_empty(), "exercise already started");
        let line = format!("{} [1] ALL start", self.log_now());
        let id = self.apply(line).expect("start creates an event");
        self.events[id - 1].clone()
    }

    /// Record the start of a station's participation.
    pub fn start_station(&mut self, station: &str) -> Event {
        let line = format!(
            "{} [{}] {} start",
            self.log_now(),
            self.events.len() + 1,
            station
        );
        let id = self.apply(line).expect("start creates an event");
        self.events[id - 1].clone()
    }

    /// Record the transmission of a bulletin or private message.
    pub fn send_message(
        &mut self,
        etype: EventType,
        station: &str,
        name: &str,
        lmi: &str,
        subject: &str,
        trigger: usize,
    ) -> Event {
        let eid = match self.find_event(etype, station, name) {
            Some(e) => e.id(),
            None => self.events.len() + 1,
        };
        let mut line = format!(
            "{} [{eid}] {} {etype} {name} SENT LMI {lmi}",
            self.log_now(),
            safe_station(station),
        );
        if trigger != 0 {
            line = format!("{line} [{trigger}]");
        }
        let id = self.apply(line).expect("send creates an event");
        if !subject.is_empty() {
            self.apply(format!("    Subject: {subject}"));
        }
        self.events[id - 1].clone()
    }

    /// Record the materialization of an inject, with the dispatch method
    /// (`PRINTED`, `EMAILED`, or `CREATED`) and the origin message ID the
    /// peer is expected to use, if known.
    pub fn create_inject(
        &mut self,
        station: &str,
        name: &str,
        rmi: &str,
        method: &str,
        trigger: usize,
    ) -> Event {
        assert!(
            matches!(method, "PRINTED" | "EMAILED" | "CREATED"),
            "invalid inject method {method:?}"
        );
        let eid = match self.find_event(EventType::Inject, station, name) {
            Some(e) => e.id(),
            None => self.events.len() + 1,
        };
        let mut line = format!(
            "{} [{eid}] {station} inject {name} {method}",
            self.log_now()
        );
        if !rmi.is_empty() {
            line = format!("{line} RMI {rmi}");
        }
        if trigger != 0 {
            line = format!("{line} [{trigger}]");
        }
        let id = self.apply(line).expect("inject creates an event");
        self.events[id - 1].clone()
    }

    /// Record that a received message matched a previously created inject.
    /// Returns `None` when there is no matching inject.
    pub fn match_inject(&mut self, station: &str, name: &str, rmi: &str) -> Option<Event> {
        if rmi.is_empty() {
            return None;
        }
        let ev = self.find_event(EventType::Inject, station, name)?;
        if ev.occurred().is_none() || (!ev.rmi().is_empty() && ev.rmi() != rmi) {
            return None;
        }
        let line = format!(
            "{} [{}] {station} inject {name} MATCHED RMI {rmi}",
            self.log_now(),
            ev.id()
        );
        let id = self.apply(line)?;
        Some(self.events[id - 1].clone())
    }

    /// Record the rejection of an unusable received message.
    pub fn record_reject(
        &mut self,
        station: &str,
        name: &str,
        lmi: &str,
        from: &str,
        subject: &str,
    ) -> Event {
        let mut line = format!(
            "{} [{}] {station} reject {name} REJECTED LMI {lmi}",
            self.log_now(),
            self.events.len() + 1,
        );
        if !from.is_empty() && self.addrs.get(station).map(String::as_str) != Some(from) {
            line = format!("{line} FROM {from}");
        }
        let id = self.apply(line).expect("reject creates an event");
        self.apply(format!("    Subject: {subject}"));
        self.events[id - 1].clone()
    }

    /// Record the reception of a recognized message.
    pub fn receive_message(
        &mut self,
        station: &str,
        name: &str,
        lmi: &str,
        from: &str,
        subject: &str,
    ) -> Event {
        let eid = match self.find_event(EventType::Receive, station, name) {
            Some(e) if e.occurred().is_none() => e.id(),
            _ => self.events.len() + 1,
        };
        let mut line = format!(
            "{} [{eid}] {station} receive {name} RECEIVED LMI {lmi}",
            self.log_now()
        );
        if !from.is_empty() && self.addrs.get(station).map(String::as_str) != Some(from) {
            line = format!("{line} FROM {from}");
        }
        let id = self.apply(line).expect("receive creates an event");
        if !subject.is_empty() {
            self.apply(format!("    Subject: {subject}"));
        }
        self.events[id - 1].clone()
    }

    /// Record the analysis of a received message.
    pub fn score_message(&mut self, event: &Event, problems: &[String], score: u32) -> Event {
        let line = format!(
            "{} [{}] {} receive {} SCORE {score}",
            self.log_now(),
            event.id(),
            event.station(),
            event.name()
        );
        let id = self.apply(line).expect("score mutates the receive event");
        for problem in problems {
            self.apply(format!("    PROBLEM: {problem}"));
        }
        self.events[id - 1].clone()
    }

    /// Record a delivery receipt for a message we sent. Returns the send
    /// event, or `None` (after logging) when no send has that LMI.
    pub fn receive_delivery_receipt(&mut self, lmi: &str, rmi: &str) -> Option<Event> {
        let found = self
            .events
            .iter()
            .find(|e| e.etype() == EventType::Send && e.lmi() == lmi)
            .map(|e| (e.id(), e.station().to_owned(), e.name().to_owned()));
        match found {
            Some((eid, station, name)) => {
                let line = format!(
                    "{} [{eid}] {} send {name} DELIVERED RMI {rmi}",
                    self.log_now(),
                    safe_station(&station),
                );
                let id = self.apply(line).expect("delivery mutates the send event");
                Some(self.events[id - 1].clone())
            }
            None => {
                self.log_error(&format!(
                    "can't record delivery receipt: no send event for {lmi}->{rmi}"
                ));
                None
            }
        }
    }

    /// Create or refresh the schedule for a bulletin, send, or inject.
    /// Returns `None` (without logging anything) when the event has already
    /// occurred.
    pub fn schedule_event(
        &mut self,
        etype: EventType,
        station: &str,
        name: &str,
        at: DateTime<Local>,
        trigger: usize,
    ) -> Option<Event> {
        assert!(
            matches!(
                etype,
                EventType::Bulletin | EventType::Send | EventType::Inject
            ),
            "invalid etype {etype} for scheduled event"
        );
        let eid = match self.find_event(etype, station, name) {
            Some(e) if e.occurred().is_some() => return None,
            Some(e) => e.id(),
            None => self.events.len() + 1,
        };
        let mut line = format!(
            "{} [{eid}] {} {etype} {name} SCHEDULED {}",
            self.log_now(),
            safe_station(station),
            at.format(EXPECTED_FORMAT)
        );
        if trigger != 0 {
            line = format!("{line} [{trigger}]");
        }
        let id = self.apply(line).expect("schedule creates an event");
        Some(self.events[id - 1].clone())
    }

    /// Create or refresh the expectation for an alert, deliver, receive, or
    /// receipt. For a receive this may promote an early-arrived message to
    /// occurred.
    pub fn expect_event(
        &mut self,
        etype: EventType,
        station: &str,
        name: &str,
        by: DateTime<Local>,
        trigger: usize,
    ) -> Event {
        let eid = match etype {
            EventType::Alert | EventType::Deliver | EventType::Receipt => self.events.len() + 1,
            EventType::Receive => {
                // The message may have arrived before it was expected.
                match self.find_event(etype, station, name) {
                    Some(e) if e.expected().is_none() => e.id(),
                    _ => self.events.len() + 1,
                }
            }
            _ => panic!("invalid etype {etype} for expected event"),
        };
        let mut line = format!(
            "{} [{eid}] {} {etype} {name} EXPECTED {}",
            self.log_now(),
            safe_station(station),
            by.format(EXPECTED_FORMAT)
        );
        if trigger != 0 {
            line = format!("{line} [{trigger}]");
        }
        let id = self.apply(line).expect("expect creates an event");
        self.events[id - 1].clone()
    }

    /// Record the operator-observed completion of an alert, deliver, or
    /// receive. Returns `None` when the event has already occurred.
    pub fn record_event(&mut self, etype: EventType, station: &str, name: &str) -> Option<Event> {
        assert!(
            matches!(
                etype,
                EventType::Alert | EventType::Deliver | EventType::Receive
            ),
            "invalid etype {etype} for recorded event"
        );
        let eid = match self.find_event(etype, station, name) {
            Some(e) if e.occurred().is_some() => return None,
            Some(e) => e.id(),
            None => self.events.len() + 1,
        };
        let line = format!(
            "{} [{eid}] {} {etype} {name} RECORDED",
            self.log_now(),
            safe_station(station)
        );
        let id = self.apply(line).expect("record creates an event");
        Some(self.events[id - 1].clone())
    }

    /// Write `OVERDUE` for every expectation whose deadline passed without
    /// an occurrence.
    pub fn mark_overdue_events(&mut self, asof: DateTime<Local>) {
        let overdue: Vec<(usize, String, EventType, String)> = self
            .events
            .iter()
            .filter(|e| {
                matches!(
                    e.etype(),
                    EventType::Alert | EventType::Deliver | EventType::Receive | EventType::Receipt
                ) && e.occurred().is_none()
                    && !e.overdue()
                    && e.expected().is_some_and(|exp| exp < asof)
            })
            .map(|e| {
                (
                    e.id(),
                    e.station().to_owned(),
                    e.etype(),
                    e.name().to_owned(),
                )
            })
            .collect();
        for (eid, station, etype, name) in overdue {
            let line = format!(
                "{} [{eid}] {} {etype} {name} OVERDUE",
                self.log_now(),
                safe_station(&station)
            );
            self.apply(line);
        }
    }

    /// Record that a pending event's definition disappeared from the
    /// exercise; clears its expectation.
    pub fn drop_event(&mut self, event: &Event) {
        let line = format!(
            "{} [{}] {} {} {} DROPPED",
            self.log_now(),
            event.id(),
            safe_station(event.station()),
            event.etype(),
            event.name()
        );
        self.apply(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn fixed_state() -> State {
        let mut st = State::new();
        st.set_now_fn(|| Local.with_ymd_and_hms(2023, 9, 23, 8, 0, 0).unwrap());
        st
    }

    #[test]
    fn start_exercise_is_event_one() {
        let mut st = fixed_state();
        let e = st.start_exercise();
        assert_eq!(e.id(), 1);
        assert_eq!(e.etype(), EventType::Start);
        assert!(e.occurred().is_some());
    }

    #[test]
    #[should_panic(expected = "exercise already started")]
    fn start_exercise_twice_panics() {
        let mut st = fixed_state();
        st.start_exercise();
        st.start_exercise();
    }

    #[test]
    fn schedule_refresh_and_noop_after_send() {
        let mut st = fixed_state();
        st.start_exercise();
        let at = Local.with_ymd_and_hms(2023, 9, 23, 8, 5, 0).unwrap();
        let e = st
            .schedule_event(EventType::Send, "KE6XYZ", "FOO", at, 1)
            .unwrap();
        assert_eq!(e.expected(), Some(at));
        // Rescheduling replaces the expected time.
        let at2 = at + Duration::minutes(10);
        let e = st
            .schedule_event(EventType::Send, "KE6XYZ", "FOO", at2, 1)
            .unwrap();
        assert_eq!(e.id(), 2);
        assert_eq!(e.expected(), Some(at2));
        // Once sent, rescheduling is a no-op.
        st.send_message(EventType::Send, "KE6XYZ", "FOO", "XND-100P", "subj", 1);
        assert!(st
            .schedule_event(EventType::Send, "KE6XYZ", "FOO", at2, 1)
            .is_none());
    }

    #[test]
    fn send_records_subject_note() {
        let mut st = fixed_state();
        st.start_exercise();
        let e = st.send_message(
            EventType::Send,
            "KE6XYZ",
            "FOO",
            "XND-100P",
            "XND-100P_R_Test",
            1,
        );
        assert_eq!(e.lmi(), "XND-100P");
        let e = st.get_event(e.id()).unwrap();
        assert_eq!(e.notes(), ["Subject: XND-100P_R_Test"]);
    }

    #[test]
    fn record_event_is_idempotent_by_intent() {
        let mut st = fixed_state();
        st.start_exercise();
        assert!(st.record_event(EventType::Alert, "KE6XYZ", "GO").is_some());
        assert!(st.record_event(EventType::Alert, "KE6XYZ", "GO").is_none());
    }

    #[test]
    fn mark_overdue_scans_expectations() {
        let mut st = fixed_state();
        st.start_exercise();
        let by = Local.with_ymd_and_hms(2023, 9, 23, 8, 10, 0).unwrap();
        st.expect_event(EventType::Receive, "KE6XYZ", "FOO", by, 1);
        st.expect_event(EventType::Alert, "KE6XYZ", "GO", by, 1);
        st.mark_overdue_events(by);
        assert!(!st.get_event(2).unwrap().overdue(), "not yet past deadline");
        st.mark_overdue_events(by + Duration::minutes(1));
        assert!(st.get_event(2).unwrap().overdue());
        assert!(st.get_event(3).unwrap().overdue());
        // A second scan doesn't re-mark.
        let log_len = st.all_events().len();
        st.mark_overdue_events(by + Duration::minutes(2));
        assert_eq!(st.all_events().len(), log_len);
    }

    #[test]
    fn delivery_receipt_without_send_logs_error() {
        let mut st = fixed_state();
        st.start_exercise();
        assert!(st.receive_delivery_receipt("XND-999P", "KE6-001P").is_none());
    }

    #[test]
    fn reject_repeats_freely() {
        let mut st = fixed_state();
        st.start_exercise();
        let e1 = st.record_reject("UNKNOWN", "UNKNOWN", "XND-100P", "w1not@bbs", "junk");
        let e2 = st.record_reject("UNKNOWN", "UNKNOWN", "XND-101P", "w1not@bbs", "junk");
        assert_ne!(e1.id(), e2.id());
        assert!(e2.occurred().is_some());
    }
}
