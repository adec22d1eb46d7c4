//! Monitor bridge: tracks every event in a station-by-event grid and feeds
//! change deltas to dashboard clients.
//!
//! The grid is static for the life of the exercise: one column per station
//! (plus the UNKNOWN column), one row per defined event, rows gathered into
//! the groups declared in the definition. Event changes mark cells dirty
//! per connection; the server side coalesces and ships them as JSON.

mod server;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::definition::{Definition, EventDef, EventType};
use crate::state::{Event, StateListener};

pub use server::start_server;

const UNKNOWN: &str = "UNKNOWN";

/// Grid coordinates and fresh content for one changed cell.
#[derive(Clone, Debug, Serialize)]
pub struct UpdateEntry {
    #[serde(rename = "G")]
    pub group: usize,
    #[serde(rename = "R")]
    pub row: usize,
    #[serde(rename = "C")]
    pub col: usize,
    #[serde(rename = "H")]
    pub html: String,
    #[serde(rename = "S")]
    pub severity: String,
}

/// One message on the monitor wire. The first message on a connection
/// carries the static framework; later ones only the clock and changed
/// cells.
#[derive(Clone, Debug, Serialize)]
pub struct Update {
    #[serde(rename = "Clock")]
    pub clock: String,
    #[serde(rename = "Title", skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(rename = "RHeads", skip_serializing_if = "String::is_empty")]
    pub rheads: String,
    #[serde(rename = "CHeads", skip_serializing_if = "String::is_empty")]
    pub cheads: String,
    #[serde(rename = "Grid", skip_serializing_if = "String::is_empty")]
    pub grid: String,
    #[serde(rename = "Cells")]
    pub cells: Vec<UpdateEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct EventKey {
    etype: EventType,
    station: String,
    name: String,
}

/// The monitor's cache of everything it needs to render cells. Shared
/// between the engine-side listener and the websocket tasks; locked
/// briefly, never across I/O.
pub struct MonitorState {
    def: Arc<Definition>,
    /// Ordered group names; `UNKNOWN` first, the unnamed group last.
    groups: Vec<String>,
    /// Station name (including `UNKNOWN`) to grid column.
    smap: HashMap<String, usize>,
    /// Event type and name to (group, row).
    emap: HashMap<EventType, HashMap<String, (usize, usize)>>,
    /// Latest version of every tracked event.
    events: HashMap<EventKey, Event>,
    /// Per-station unknown-message (reject) events.
    unknown: HashMap<String, Vec<Event>>,
    cheads: String,
    rheads: String,
    grid: String,
    /// Per-connection dirty cell sets.
    conns: HashMap<u64, HashSet<EventKey>>,
    next_conn: u64,
}

impl MonitorState {
    pub fn new(def: Arc<Definition>) -> Arc<Mutex<Self>> {
        let mut m = MonitorState {
            def,
            groups: Vec::new(),
            smap: HashMap::new(),
            emap: HashMap::new(),
            events: HashMap::new(),
            unknown: HashMap::new(),
            cheads: String::new(),
            rheads: String::new(),
            grid: String::new(),
            conns: HashMap::new(),
            next_conn: 1,
        };
        let want_receipts = m.build_station_map();
        m.build_group_list();
        m.build_event_map(want_receipts);
        Arc::new(Mutex::new(m))
    }

    /// Build the station-to-column map and the column headings. Returns
    /// whether any station expects delivery receipts.
    fn build_station_map(&mut self) -> bool {
        let mut want_receipts = false;
        let mut sb = String::from(r#"<div class="column unknownStation">UNKNOWN</div>"#);
        self.smap.insert(UNKNOWN.to_owned(), 0);
        let def = Arc::clone(&self.def);
        for (i, s) in def.stations.iter().enumerate() {
            self.smap.insert(s.call_sign.clone(), i + 1);
            if s.receipt_delay > chrono::Duration::zero() {
                want_receipts = true;
            }
            if !s.fcc_call.is_empty() && s.fcc_call != s.call_sign {
                sb.push_str(&format!(
                    r#"<div class=column>{}<div class=fcc>{}</div></div>"#,
                    esc(&s.call_sign),
                    esc(&s.fcc_call)
                ));
            } else {
                sb.push_str(&format!(r#"<div class=column>{}</div>"#, esc(&s.call_sign)));
            }
        }
        self.cheads = sb;
        want_receipts
    }

    /// Collect the event groups in declaration order. `UNKNOWN` is always
    /// first; the unnamed group, if referenced, is always last.
    fn build_group_list(&mut self) {
        self.groups.push(UNKNOWN.to_owned());
        for e in &self.def.events {
            if !e.group.is_empty() && !self.groups.contains(&e.group) {
                self.groups.push(e.group.clone());
            }
        }
        if self.def.events.iter().any(|e| e.group.is_empty()) {
            self.groups.push(String::new());
        }
    }

    /// Build the event-to-cell map, and render the row headings and the
    /// empty grid framework.
    fn build_event_map(&mut self, want_receipts: bool) {
        let def = Arc::clone(&self.def);
        let mut rheads = String::new();
        let mut grid = String::new();
        for (g, group) in self.groups.clone().into_iter().enumerate() {
            // The synthetic rows: "reject UNKNOWN" leads the UNKNOWN group,
            // and each send row gets a paired receipt row when any station
            // expects receipts.
            let mut rows: Vec<(EventType, String)> = Vec::new();
            if group == UNKNOWN {
                rows.push((EventType::Reject, UNKNOWN.to_owned()));
            }
            for e in def.events.iter().filter(|e| e.group == group) {
                rows.push((e.etype, e.name.clone()));
                if want_receipts && e.etype == EventType::Send {
                    rows.push((EventType::Receipt, e.name.clone()));
                }
            }
            for (r, (etype, name)) in rows.iter().enumerate() {
                self.emap
                    .entry(*etype)
                    .or_default()
                    .insert(name.clone(), (g, r));
            }
            if group == UNKNOWN {
                rheads.push_str(&format!(
                    r#"<div class="group unknownMessage" style="--span:{}"><div class=groupName>?</div>"#,
                    rows.len()
                ));
                grid.push_str(r#"<div class="group unknownMessage">"#);
            } else if !group.is_empty() {
                rheads.push_str(&format!(
                    r#"<div class=group style="--span:{}"><div class=groupName>{}</div>"#,
                    rows.len(),
                    esc(&group)
                ));
                grid.push_str(r#"<div class=group>"#);
            } else {
                rheads.push_str(r#"<div class=group>"#);
                grid.push_str(r#"<div class=group>"#);
            }
            for (r, (etype, name)) in rows.iter().enumerate() {
                if r > 0 && rows[r - 1].1 == *name {
                    rheads.push_str(r#"<div class="eventName ditto">"</div>"#);
                } else {
                    rheads.push_str(&format!(r#"<div class=eventName>{}</div>"#, esc(name)));
                }
                rheads.push_str(&format!(r#"<div class=eventType>{etype}</div>"#));
                grid.push_str(r#"<div class=event><div class="cell unknownStation"></div>"#);
                for _ in &def.stations {
                    grid.push_str(r#"<div class=cell></div>"#);
                }
                grid.push_str("</div>");
            }
            rheads.push_str("</div>");
            grid.push_str("</div>");
        }
        self.rheads = rheads;
        self.grid = grid;
    }

    /// Fold an event change into the cache. Returns the cell key needing a
    /// repaint, or `None` when the event has no cell.
    fn save_event(&mut self, e: &Event) -> Option<EventKey> {
        if e.station() == UNKNOWN || e.name() == UNKNOWN {
            let list = self.unknown.entry(e.station().to_owned()).or_default();
            match list.iter_mut().find(|u| u.id() == e.id()) {
                Some(slot) => *slot = e.clone(),
                None => list.push(e.clone()),
            }
            return Some(EventKey {
                etype: e.etype(),
                station: e.station().to_owned(),
                name: UNKNOWN.to_owned(),
            });
        }
        let key = EventKey {
            etype: e.etype(),
            station: e.station().to_owned(),
            name: e.name().to_owned(),
        };
        self.events.insert(key.clone(), e.clone());
        Some(key)
    }

    fn register_conn(&mut self) -> u64 {
        let id = self.next_conn;
        self.next_conn += 1;
        self.conns.insert(id, HashSet::new());
        id
    }

    fn drop_conn(&mut self, id: u64) {
        self.conns.remove(&id);
    }

    fn take_dirty(&mut self, id: u64) -> Vec<EventKey> {
        match self.conns.get_mut(&id) {
            Some(set) => set.drain().collect(),
            None => Vec::new(),
        }
    }

    fn render_initial(&self, clock: String) -> Update {
        let mut cells = Vec::new();
        for station in self.smap.keys() {
            for (etype, names) in &self.emap {
                for name in names.keys() {
                    if let Some(cell) = self.render_event(&EventKey {
                        etype: *etype,
                        station: station.clone(),
                        name: name.clone(),
                    }) {
                        cells.push(cell);
                    }
                }
            }
        }
        Update {
            clock,
            title: format!(
                "{} {}",
                self.def.exercise.activation, self.def.exercise.incident
            ),
            rheads: self.rheads.clone(),
            cheads: self.cheads.clone(),
            grid: self.grid.clone(),
            cells,
        }
    }

    fn render_update(&self, keys: &[EventKey], clock: String) -> Update {
        Update {
            clock,
            title: String::new(),
            rheads: String::new(),
            cheads: String::new(),
            grid: String::new(),
            cells: keys.iter().filter_map(|k| self.render_event(k)).collect(),
        }
    }

    /// Render a single cell: icon, status text, and severity class.
    fn render_event(&self, key: &EventKey) -> Option<UpdateEntry> {
        if key.name == UNKNOWN {
            return self.render_unknown_events(&key.station);
        }
        let col = *self.smap.get(&key.station)?;
        if col == 0 {
            return None;
        }
        let (g, r) = *self.emap.get(&key.etype)?.get(&key.name)?;
        let (severity, html) = match self.events.get(key) {
            None => {
                // Never scheduled; only worth a cell if it awaits a manual
                // trigger.
                let edef: Option<&EventDef> = self.def.event(key.etype, &key.name);
                if edef.map(|e| e.trigger_type) != Some(EventType::Manual) {
                    return None;
                }
                ("pending", r##"<svg><use href="#clock"/></svg> MANUAL"##.to_owned())
            }
            Some(e) => render_cell(e),
        };
        Some(UpdateEntry {
            group: g,
            row: r,
            col,
            html,
            severity: severity.to_owned(),
        })
    }

    /// Render the unknown-messages tally cell for a station.
    fn render_unknown_events(&self, station: &str) -> Option<UpdateEntry> {
        let unk = self.unknown.get(station)?;
        if unk.is_empty() {
            return None;
        }
        let label = if unk.len() == 1 {
            "1 msg".to_owned()
        } else {
            format!("{} msgs", unk.len())
        };
        Some(UpdateEntry {
            group: 0,
            row: 0,
            col: *self.smap.get(station)?,
            html: format!(r##"<svg><use href="#cross"/></svg> {label}"##),
            severity: "error".to_owned(),
        })
    }
}

/// The cell severity ladder. Order matters: an error note outranks a low
/// score, which outranks lateness, and so on down to success.
fn render_cell(e: &Event) -> (&'static str, String) {
    let has_note = |prefix: &str| e.notes().iter().any(|n| n.starts_with(prefix));
    let fmt_time = |t: Option<chrono::DateTime<chrono::Local>>| {
        t.map(|t| t.format("%H:%M").to_string())
            .unwrap_or_else(|| "00:00".to_owned())
    };
    if has_note("ERROR:") {
        ("error", r##"<svg><use href="#cross"/></svg> ERROR"##.to_owned())
    } else if e.score() != 0 && e.score() < 90 {
        (
            "error",
            format!(r##"<svg><use href="#cross"/></svg> {}%"##, e.score()),
        )
    } else if e.overdue() && e.occurred().is_some() {
        ("error", r##"<svg><use href="#cross"/></svg> LATE"##.to_owned())
    } else if e.overdue() {
        ("error", r##"<svg><use href="#clock"/></svg> OVERDUE"##.to_owned())
    } else if has_note("WARNING:") {
        (
            "warning",
            r##"<svg><use href="#warning"/></svg> WARNING"##.to_owned(),
        )
    } else if e.score() != 0 && e.score() != 100 {
        (
            "warning",
            format!(r##"<svg><use href="#warning"/></svg> {}%"##, e.score()),
        )
    } else if e.occurred().is_none() {
        let preposition = match e.etype() {
            EventType::Bulletin | EventType::Inject | EventType::Send => "at",
            _ => "by",
        };
        (
            "pending",
            format!(
                r##"<svg><use href="#clock"/></svg> {preposition} {}"##,
                fmt_time(e.expected())
            ),
        )
    } else {
        (
            "success",
            format!(
                r##"<svg><use href="#check"/></svg> at {}"##,
                fmt_time(e.occurred())
            ),
        )
    }
}

fn esc(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// The engine-side listener: folds event changes into the shared monitor
/// state and wakes the websocket tasks.
pub struct MonitorListener {
    state: Arc<Mutex<MonitorState>>,
    notify: Arc<tokio::sync::watch::Sender<u64>>,
}

impl MonitorListener {
    pub fn new(
        state: Arc<Mutex<MonitorState>>,
        notify: Arc<tokio::sync::watch::Sender<u64>>,
    ) -> Self {
        MonitorListener { state, notify }
    }
}

impl StateListener for MonitorListener {
    fn on_event_change(&mut self, event: &Event) {
        let Ok(mut m) = self.state.lock() else {
            return;
        };
        if let Some(key) = m.save_event(event) {
            for dirty in m.conns.values_mut() {
                dirty.insert(key.clone());
            }
        }
        drop(m);
        self.notify.send_modify(|v| *v += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;
    use chrono::TimeZone;

    fn test_def() -> Arc<Definition> {
        crate::definition::fixtures::sample_definition()
    }

    #[test]
    fn grid_layout_includes_unknown_and_receipts() {
        let def = test_def();
        let state = MonitorState::new(Arc::clone(&def));
        let m = state.lock().unwrap();
        assert_eq!(m.groups[0], "UNKNOWN");
        assert_eq!(m.smap["UNKNOWN"], 0);
        assert_eq!(m.smap["KE6XYZ"], 1);
        // The send event has a paired receipt row (KE6ABC expects receipts).
        assert!(m.emap[&EventType::Receipt].contains_key("STATUS_REQ"));
        assert!(m.cheads.contains("KE6XYZ"));
        assert!(m.grid.contains("unknownStation"));
    }

    #[test]
    fn event_changes_mark_cells_dirty() {
        let def = test_def();
        let shared = MonitorState::new(Arc::clone(&def));
        let (tx, rx) = tokio::sync::watch::channel(0u64);
        let mut st = State::new();
        st.set_now_fn(|| chrono::Local.with_ymd_and_hms(2023, 9, 23, 8, 0, 0).unwrap());
        st.add_listener(MonitorListener::new(Arc::clone(&shared), Arc::new(tx)));
        let conn = shared.lock().unwrap().register_conn();
        st.start_exercise();
        st.start_station("KE6XYZ");
        assert!(*rx.borrow() > 0);
        let dirty = shared.lock().unwrap().take_dirty(conn);
        assert!(!dirty.is_empty());
        assert!(shared.lock().unwrap().take_dirty(conn).is_empty());
    }

    #[test]
    fn severity_ladder() {
        let def = test_def();
        let shared = MonitorState::new(Arc::clone(&def));
        let mut st = State::new();
        st.set_now_fn(|| chrono::Local.with_ymd_and_hms(2023, 9, 23, 8, 0, 0).unwrap());
        st.start_exercise();
        let by = chrono::Local.with_ymd_and_hms(2023, 9, 23, 8, 10, 0).unwrap();
        st.expect_event(EventType::Receive, "KE6XYZ", "STATUS_RPT", by, 1);
        {
            let mut m = shared.lock().unwrap();
            let e = st.get_event(2).unwrap().clone();
            let key = m.save_event(&e).unwrap();
            let cell = m.render_event(&key).unwrap();
            assert_eq!(cell.severity, "pending");
            assert!(cell.html.contains("by 08:10"));
        }
        st.mark_overdue_events(by + chrono::Duration::minutes(1));
        {
            let mut m = shared.lock().unwrap();
            let e = st.get_event(2).unwrap().clone();
            let key = m.save_event(&e).unwrap();
            let cell = m.render_event(&key).unwrap();
            assert_eq!(cell.severity, "error");
            assert!(cell.html.contains("OVERDUE"));
        }
    }

    #[test]
    fn unknown_messages_tally() {
        let def = test_def();
        let shared = MonitorState::new(Arc::clone(&def));
        let mut st = State::new();
        st.set_now_fn(|| chrono::Local.with_ymd_and_hms(2023, 9, 23, 8, 0, 0).unwrap());
        st.start_exercise();
        let e = st.record_reject("UNKNOWN", "UNKNOWN", "XND-100P", "w1not@bbs", "junk");
        let mut m = shared.lock().unwrap();
        let key = m.save_event(&e).unwrap();
        let cell = m.render_event(&key).unwrap();
        assert_eq!(cell.severity, "error");
        assert!(cell.html.contains("1 msg"));
        assert_eq!(cell.col, 0);
    }
}
