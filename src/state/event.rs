//! The event record.

use chrono::{DateTime, Local};

use crate::definition::EventType;

/// A single event in the exercise, either expected or occurred.
///
/// Events are created and mutated only by the log executor; everything else
/// reads them through the accessors.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub(crate) id: usize,
    pub(crate) station: String,
    pub(crate) etype: EventType,
    pub(crate) name: String,
    pub(crate) trigger: usize,
    pub(crate) expected: Option<DateTime<Local>>,
    pub(crate) occurred: Option<DateTime<Local>>,
    pub(crate) overdue: bool,
    pub(crate) lmi: String,
    pub(crate) rmi: String,
    pub(crate) score: u32,
    pub(crate) notes: Vec<String>,
}

impl Event {
    pub(crate) fn new(id: usize, etype: EventType, station: String, name: String) -> Self {
        Event {
            id,
            station,
            etype,
            name,
            trigger: 0,
            expected: None,
            occurred: None,
            overdue: false,
            lmi: String::new(),
            rmi: String::new(),
            score: 0,
            notes: Vec::new(),
        }
    }

    /// Unique identifier; dense, starting at 1, never reused.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Call sign of the station for the event. `UNKNOWN` for a message from
    /// an unrecognized station; empty for global events such as the start
    /// event or the global posting of a bulletin.
    pub fn station(&self) -> &str {
        &self.station
    }

    pub fn etype(&self) -> EventType {
        self.etype
    }

    /// Message name. `UNKNOWN` for an unrecognized received message; empty
    /// for `start` events.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// ID of the event that caused this one, or zero.
    pub fn trigger(&self) -> usize {
        self.trigger
    }

    /// When this event is scheduled to happen or expected by.
    pub fn expected(&self) -> Option<DateTime<Local>> {
        self.expected
    }

    /// When this event occurred; `None` while it is still anticipated.
    pub fn occurred(&self) -> Option<DateTime<Local>> {
        self.occurred
    }

    /// Whether the event is (or was) overdue. Sticky: survives a late
    /// occurrence.
    pub fn overdue(&self) -> bool {
        self.overdue
    }

    /// Local message ID, on send/receive/reject events that have one.
    pub fn lmi(&self) -> &str {
        &self.lmi
    }

    /// Remote message ID: from the delivery receipt for a sent message,
    /// from the subject line for a received one.
    pub fn rmi(&self) -> &str {
        &self.rmi
    }

    /// Percentage score for an analyzed received message.
    pub fn score(&self) -> u32 {
        self.score
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }
}
