//! The log-line executor: the only code that mutates events.

use std::sync::LazyLock;

use chrono::{DateTime, Local, NaiveDateTime};
use regex::Regex;

use crate::definition::EventType;

use super::{Event, State, StateError, EXPECTED_FORMAT, OCCURRED_FORMAT};

static STATE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{3}) \[(\d+)\] ([A-Z][A-Z0-9]*) (\S+)",
    )
    .unwrap()
});
static ERR_WARN_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{3} (?:ERROR|WARNING): ").unwrap()
});
static TRIGGER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\[(\d+)\]$").unwrap());

fn parse_local(s: &str, fmt: &str) -> Option<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(s, fmt).ok()?;
    let dt = naive.and_local_timezone(Local).earliest()?;
    // Round-trip check rejects lexically valid but non-canonical values.
    (dt.format(fmt).to_string() == s).then_some(dt)
}

impl State {
    /// Parse and execute a single state change line. Returns the ID of the
    /// event the line created or mutated, or `None` for blank, diagnostic,
    /// and unattached note lines.
    pub fn execute(&mut self, line: &str) -> Result<Option<usize>, StateError> {
        // Notify listeners of the new log line.
        for l in &mut self.listeners {
            l.on_log_line(line);
        }
        // Ignore blank lines, errors, and warnings.
        if line.trim().is_empty() || ERR_WARN_LINE_RE.is_match(line) {
            self.last_eid = 0;
            return Ok(None);
        }
        // Indented lines are notes on the event of the preceding entry.
        if line.starts_with(' ') || line.starts_with('\t') {
            if self.last_eid == 0 {
                return Ok(None);
            }
            let eid = self.last_eid;
            self.events[eid - 1].notes.push(line.trim().to_owned());
            let snapshot = self.events[eid - 1].clone();
            self.notify_change(&snapshot);
            return Ok(Some(eid));
        }
        // Everything else must match the state line shape.
        let caps = STATE_LINE_RE.captures(line).ok_or(StateError::Syntax)?;
        let tstamp = parse_local(&caps[1], OCCURRED_FORMAT).ok_or(StateError::BadTimestamp)?;
        let id: usize = caps[2].parse().map_err(|_| StateError::Syntax)?;
        let station = match &caps[3] {
            "ALL" => String::new(),
            s => s.to_owned(),
        };
        let etype: EventType = caps[4].parse().map_err(|_| StateError::BadEventType)?;
        let mut rest = line[caps.get(0).unwrap().end()..].trim_start_matches(' ');
        // Every event type except "start" carries a message name next.
        let name = if etype == EventType::Start {
            String::new()
        } else {
            match rest.split_once(' ') {
                Some((name, tail)) => {
                    let name = name.to_owned();
                    rest = tail;
                    name
                }
                None => {
                    let name = rest.to_owned();
                    rest = "";
                    name
                }
            }
        };
        // Find or create the event.
        let idx = if id > 0 && id <= self.events.len() {
            let e = &self.events[id - 1];
            if e.etype != etype || e.station != station || e.name != name {
                return Err(StateError::EventMismatch);
            }
            id - 1
        } else if id == self.events.len() + 1 {
            // New events must be unique by (type, station, name), except
            // receives and rejects which may repeat.
            if etype != EventType::Reject
                && etype != EventType::Receive
                && self
                    .events
                    .iter()
                    .any(|e| e.etype == etype && e.station == station && e.name == name)
            {
                return Err(StateError::RedundantEvent);
            }
            self.events.push(Event::new(id, etype, station, name));
            id - 1
        } else {
            return Err(StateError::InvalidEventId);
        };
        self.last_time = Some(tstamp);
        self.last_eid = id;

        let mut secondary: Option<usize> = None;
        let result = self.execute_verbs(idx, etype, tstamp, rest, &mut secondary);
        match result {
            Ok(()) => {
                let snapshot = self.events[idx].clone();
                self.notify_change(&snapshot);
                if let Some(sec) = secondary {
                    let snapshot = self.events[sec].clone();
                    self.notify_change(&snapshot);
                }
                Ok(Some(id))
            }
            Err(err) => Err(err),
        }
    }

    fn execute_verbs(
        &mut self,
        idx: usize,
        etype: EventType,
        tstamp: DateTime<Local>,
        rest: &str,
        secondary: &mut Option<usize>,
    ) -> Result<(), StateError> {
        let mut fields: Vec<&str> = rest.split_whitespace().collect();
        // A start event has no arguments; seeing one means it occurred.
        if etype == EventType::Start && fields.is_empty() {
            self.events[idx].occurred = Some(tstamp);
            return Ok(());
        }
        // A trailing bracketed number is the trigger event ID.
        if let Some(caps) = fields.last().and_then(|f| TRIGGER_RE.captures(f)) {
            let trigger: usize = caps[1].parse().map_err(|_| StateError::InvalidTriggerId)?;
            if trigger < 1 || trigger > self.events.len() {
                return Err(StateError::InvalidTriggerId);
            }
            self.events[idx].trigger = trigger;
            fields.pop();
        }
        // An expected event was dropped: its definition or template was
        // removed from the exercise before its expected time.
        if fields == ["DROPPED"] {
            if self.events[idx].occurred.is_some() {
                return Err(StateError::DropOccurred);
            }
            self.events[idx].expected = None;
            return Ok(());
        }
        // PRINTED, EMAILED, and CREATED all mean an inject occurred, and may
        // carry the RMI the peer is expected to use.
        if etype == EventType::Inject
            && matches!(
                fields.as_slice(),
                ["PRINTED" | "EMAILED" | "CREATED"] | ["PRINTED" | "EMAILED" | "CREATED", "RMI", _]
            )
        {
            if self.events[idx].occurred.is_some() {
                return Err(StateError::InjectRecreated);
            }
            if let [_, "RMI", rmi] = fields.as_slice() {
                self.events[idx].rmi = (*rmi).to_owned();
            }
            self.events[idx].occurred = Some(tstamp);
            return Ok(());
        }
        // MATCHED confirms which received message satisfied an inject.
        if etype == EventType::Inject {
            if let ["MATCHED", "RMI", rmi] = fields.as_slice() {
                if self.events[idx].occurred.is_none() {
                    return Err(StateError::MatchUncreated);
                }
                if !self.events[idx].rmi.is_empty() && self.events[idx].rmi != *rmi {
                    return Err(StateError::RmiMismatch);
                }
                self.events[idx].rmi = (*rmi).to_owned();
                return Ok(());
            }
        }
        // A bulletin or send followed by SENT and an LMI has occurred.
        if matches!(etype, EventType::Bulletin | EventType::Send) {
            if let ["SENT", "LMI", lmi] = fields.as_slice() {
                if self.events[idx].occurred.is_some() {
                    return Err(StateError::Resent);
                }
                self.events[idx].lmi = (*lmi).to_owned();
                self.events[idx].occurred = Some(tstamp);
                return Ok(());
            }
        }
        if etype == EventType::Reject {
            if let ["REJECTED", "LMI", lmi] | ["REJECTED", "LMI", lmi, "FROM", _] =
                fields.as_slice()
            {
                self.events[idx].lmi = (*lmi).to_owned();
                self.events[idx].occurred = Some(tstamp);
                return Ok(());
            }
        }
        // RECEIVED records a message arrival; the event only occurs if it
        // was already expected (otherwise it waits for the expectation).
        if etype == EventType::Receive {
            if let ["RECEIVED", "LMI", lmi] | ["RECEIVED", "LMI", lmi, "FROM", _] =
                fields.as_slice()
            {
                if self.events[idx].occurred.is_some() {
                    return Err(StateError::Rereceived);
                }
                if let ["RECEIVED", "LMI", _, "FROM", from] = fields.as_slice() {
                    let station = self.events[idx].station.clone();
                    self.addrs.insert(station, (*from).to_owned());
                }
                self.events[idx].lmi = (*lmi).to_owned();
                if self.events[idx].expected.is_some() {
                    self.events[idx].occurred = Some(tstamp);
                }
                return Ok(());
            }
            if let ["SCORE", score] = fields.as_slice() {
                if self.events[idx].lmi.is_empty() {
                    return Err(StateError::ScoreUnreceived);
                }
                let score: u32 = score.parse().map_err(|_| StateError::InvalidScore)?;
                if score > 100 {
                    return Err(StateError::InvalidScore);
                }
                self.events[idx].score = score;
                return Ok(());
            }
        }
        // DELIVERED stores the peer's ID for a sent message and completes
        // the earliest still-pending receipt event for the same message.
        if etype == EventType::Send {
            if let ["DELIVERED", "RMI", rmi] = fields.as_slice() {
                if self.events[idx].occurred.is_none() {
                    return Err(StateError::DeliveredUnsent);
                }
                self.events[idx].rmi = (*rmi).to_owned();
                let (station, name) = (
                    self.events[idx].station.clone(),
                    self.events[idx].name.clone(),
                );
                if let Some(rc) = self.events.iter().position(|e| {
                    e.etype == EventType::Receipt
                        && e.station == station
                        && e.name == name
                        && e.occurred.is_none()
                }) {
                    self.events[rc].occurred = Some(tstamp);
                    *secondary = Some(rc);
                }
                return Ok(());
            }
        }
        // Scheduling and expectation.
        match etype {
            EventType::Bulletin | EventType::Send | EventType::Inject => {
                if let ["SCHEDULED", at] = fields.as_slice() {
                    if self.events[idx].occurred.is_some() {
                        return Err(StateError::RescheduleCompleted);
                    }
                    let at =
                        parse_local(at, EXPECTED_FORMAT).ok_or(StateError::InvalidScheduledTime)?;
                    self.events[idx].expected = Some(at);
                    return Ok(());
                }
            }
            EventType::Alert | EventType::Receive | EventType::Deliver | EventType::Receipt => {
                if let ["EXPECTED", by] = fields.as_slice() {
                    if self.events[idx].occurred.is_some() {
                        return Err(StateError::ReexpectCompleted);
                    }
                    let by =
                        parse_local(by, EXPECTED_FORMAT).ok_or(StateError::InvalidExpectedTime)?;
                    self.events[idx].expected = Some(by);
                    // An early-arrived receive already has its message; the
                    // expectation materializing promotes it to occurred.
                    if etype == EventType::Receive && !self.events[idx].lmi.is_empty() {
                        self.events[idx].occurred = Some(tstamp);
                    }
                    return Ok(());
                }
                if fields == ["OVERDUE"] {
                    if self.events[idx].occurred.is_some() {
                        return Err(StateError::OverdueCompleted);
                    }
                    self.events[idx].overdue = true;
                    return Ok(());
                }
            }
            _ => {}
        }
        // Operator-recorded completion.
        if matches!(
            etype,
            EventType::Alert | EventType::Deliver | EventType::Receive
        ) && fields == ["RECORDED"]
        {
            if self.events[idx].occurred.is_some() {
                return Err(StateError::RecordCompleted);
            }
            self.events[idx].occurred = Some(tstamp);
            return Ok(());
        }
        Err(StateError::UnknownFormat)
    }
}
