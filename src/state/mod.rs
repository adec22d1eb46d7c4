//! Exercise state: the append-only event log and the records folded from it.
//!
//! The log is the sole source of truth. Every mutation is formatted as a log
//! line, appended to the file, and then executed in memory by the same code
//! that replays the file on startup. The typed APIs in [`change`] are thin
//! line builders over the executor.

mod change;
mod event;
mod execute;
mod logfile;
mod query;

use std::collections::HashMap;

use chrono::{DateTime, Local};
use thiserror::Error;

pub use event::Event;

pub(crate) const OCCURRED_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";
pub(crate) const EXPECTED_FORMAT: &str = "%Y-%m-%dT%H:%M";

#[derive(Error, Debug)]
pub enum StateError {
    #[error("syntax error")]
    Syntax,
    #[error("syntax error: bad timestamp format")]
    BadTimestamp,
    #[error("syntax error: bad event type")]
    BadEventType,
    #[error("syntax error: unknown entry format")]
    UnknownFormat,
    #[error("event data mismatch on type, station, or message name")]
    EventMismatch,
    #[error("creating redundant event")]
    RedundantEvent,
    #[error("invalid event ID")]
    InvalidEventId,
    #[error("invalid trigger ID")]
    InvalidTriggerId,
    #[error("can't drop occurred event")]
    DropOccurred,
    #[error("inject re-created")]
    InjectRecreated,
    #[error("match of non-created inject")]
    MatchUncreated,
    #[error("inject RMI mismatch")]
    RmiMismatch,
    #[error("message re-sent")]
    Resent,
    #[error("message re-received")]
    Rereceived,
    #[error("score on unreceived message")]
    ScoreUnreceived,
    #[error("invalid score")]
    InvalidScore,
    #[error("delivered on unsent message")]
    DeliveredUnsent,
    #[error("rescheduling completed event")]
    RescheduleCompleted,
    #[error("invalid scheduled time")]
    InvalidScheduledTime,
    #[error("re-expecting completed event")]
    ReexpectCompleted,
    #[error("invalid expected time")]
    InvalidExpectedTime,
    #[error("marking completed event overdue")]
    OverdueCompleted,
    #[error("recording completion of completed event")]
    RecordCompleted,
    #[error("{file}:{line}: {source}")]
    Replay {
        file: String,
        line: usize,
        #[source]
        source: Box<StateError>,
    },
    #[error("{file}: {err}")]
    LogIo {
        file: String,
        #[source]
        err: std::io::Error,
    },
}

/// A listener on the state. Either callback may be left defaulted.
///
/// To see every line and event from the beginning of the exercise, the
/// listener must be added before [`State::open`] replays the log file.
/// Listeners must not call back into the state.
pub trait StateListener: Send {
    /// Called for every line appended to (or replayed from) the state log.
    fn on_log_line(&mut self, _line: &str) {}
    /// Called whenever an event is created or updated.
    fn on_event_change(&mut self, _event: &Event) {}
}

/// The state of the exercise engine.
///
/// Not internally synchronized: the engine thread is the single writer, and
/// readers get immutable snapshots through change notifications.
pub struct State {
    /// Index `i` holds the event with ID `i + 1`.
    events: Vec<Event>,
    /// Last seen from-address per station.
    addrs: HashMap<String, String>,
    listeners: Vec<Box<dyn StateListener>>,
    now_fn: Box<dyn Fn() -> DateTime<Local> + Send>,
    last_time: Option<DateTime<Local>>,
    last_eid: usize,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    pub fn new() -> Self {
        State {
            events: Vec::new(),
            addrs: HashMap::new(),
            listeners: Vec::new(),
            now_fn: Box::new(Local::now),
            last_time: None,
            last_eid: 0,
        }
    }

    /// Override the clock, for replaying old exercises and for tests.
    pub fn set_now_fn(&mut self, now_fn: impl Fn() -> DateTime<Local> + Send + 'static) {
        self.now_fn = Box::new(now_fn);
    }

    /// The current logical time of day.
    pub fn now(&self) -> DateTime<Local> {
        (self.now_fn)()
    }

    /// Add a listener. Any number can be added.
    pub fn add_listener(&mut self, listener: impl StateListener + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Timestamp and event ID of the last log entry, if any.
    pub fn last_entry(&self) -> (Option<DateTime<Local>>, usize) {
        (self.last_time, self.last_eid)
    }

    /// Append an `ERROR:` diagnostic line to the log.
    pub fn log_error(&mut self, err: &dyn std::fmt::Display) {
        self.apply(format!("{} ERROR: {}", self.log_now(), err));
    }

    /// Append an indented note line, attaching it to the most recent event.
    pub fn log_note(&mut self, text: &str) {
        self.apply(format!("    {text}"));
    }

    pub(crate) fn log_now(&self) -> String {
        self.now().format(OCCURRED_FORMAT).to_string()
    }

    /// Record a state change line in the log and execute it. The engine only
    /// ever builds valid lines, so an executor rejection here is a bug.
    pub(crate) fn apply(&mut self, line: String) -> Option<usize> {
        match self.execute(&line) {
            Ok(id) => id,
            Err(err) => panic!("recording line {line:?}: {err}"),
        }
    }

    pub(crate) fn notify_change(&mut self, event: &Event) {
        for l in &mut self.listeners {
            l.on_event_change(event);
        }
    }
}
