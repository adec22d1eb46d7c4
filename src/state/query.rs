//! Read-only queries over the event table.

use crate::definition::EventType;

use super::{Event, State};

impl State {
    /// The event with the given ID, if any.
    pub fn get_event(&self, eid: usize) -> Option<&Event> {
        if eid == 0 {
            return None;
        }
        self.events.get(eid - 1)
    }

    /// All events, in ID order.
    pub fn all_events(&self) -> &[Event] {
        &self.events
    }

    /// The latest event with the given type, station, and message name.
    pub fn find_event(&self, etype: EventType, station: &str, name: &str) -> Option<&Event> {
        self.events
            .iter()
            .rev()
            .find(|e| e.etype == etype && e.station == station && e.name == name)
    }

    /// The latest send or receive event for a station and message name;
    /// used to resolve prior-message variables.
    pub fn get_send_receive_event(&self, station: &str, name: &str) -> Option<&Event> {
        self.events.iter().rev().find(|e| {
            matches!(e.etype, EventType::Send | EventType::Receive)
                && e.station == station
                && e.name == name
        })
    }

    /// Whether the station has any event yet (i.e. has started).
    pub fn station_started(&self, station: &str) -> bool {
        self.events.iter().any(|e| e.station == station)
    }

    /// The last recorded address the station sent from, or the lowercased
    /// call sign when no message has been received from it.
    pub fn address_for_station(&self, station: &str) -> String {
        match self.addrs.get(station) {
            Some(addr) => addr.clone(),
            None => station.to_lowercase(),
        }
    }

    /// The due (scheduled in the past) but uncompleted event of the given
    /// type with the earliest scheduled time, if any.
    pub fn pending_event(&self, etype: EventType) -> Option<&Event> {
        let now = self.now();
        self.events
            .iter()
            .filter(|e| e.etype == etype && e.occurred.is_none())
            .filter(|e| e.expected.is_some_and(|exp| exp < now))
            .min_by_key(|e| e.expected)
    }

    /// Whether a received message with this station and name is currently
    /// expected.
    pub fn is_message_expected(&self, station: &str, name: &str) -> bool {
        self.find_event(EventType::Receive, station, name)
            .is_some_and(|e| e.occurred.is_none() && e.expected.is_some())
    }
}
