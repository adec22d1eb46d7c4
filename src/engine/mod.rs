//! The engine that drives the exercise.
//!
//! One engine thread performs all state-mutating work, fed by a minute
//! ticker and a manual-trigger channel. The BBS session, inject generation,
//! and overdue marking all run on that thread; listeners observe through
//! change notifications.

mod analyze;
mod generate;
mod inject;
mod manual;
mod session;
mod ticker;
mod trigger;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Local};
use crossbeam::channel::Receiver;

use crate::bbs::Connector;
use crate::definition::{Definition, EventType};
use crate::message::{Envelope, Message, MessageStore};
use crate::state::State;

pub use inject::{InjectMethod, InjectSink, NoopSink};
pub use ticker::start_ticker;

/// An operator-issued trigger, delivered from the monitor server.
#[derive(Clone, Debug)]
pub struct ManualTrigger {
    pub etype: EventType,
    pub station: String,
    pub name: String,
}

pub struct Engine {
    def: Arc<Definition>,
    st: State,
    store: MessageStore,
    connector: Connector,
    inject_sink: Box<dyn InjectSink>,
    offline: bool,
    /// The last message resolved for a prior-message variable; repeated
    /// lookups against the same message skip the disk read.
    var_cache: Option<(String, Envelope, Message)>,
}

impl Engine {
    pub fn new(
        def: Arc<Definition>,
        st: State,
        store: MessageStore,
        connector: Connector,
        inject_sink: Box<dyn InjectSink>,
    ) -> Self {
        Engine {
            def,
            st,
            store,
            connector,
            inject_sink,
            offline: false,
            var_cache: None,
        }
    }

    /// Disable the BBS session (the `-offline` flag).
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    pub fn state(&self) -> &State {
        &self.st
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.st
    }

    /// The engine loop: handle ticks and manual triggers until shutdown.
    pub fn run(
        &mut self,
        ticks: Receiver<DateTime<Local>>,
        manual: Receiver<ManualTrigger>,
        shutdown: Arc<AtomicBool>,
    ) {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            crossbeam::select! {
                recv(ticks) -> msg => match msg {
                    Ok(tick) => self.clock_tick(tick),
                    Err(_) => return,
                },
                recv(manual) -> msg => match msg {
                    Ok(mt) => self.manual_trigger(mt),
                    Err(_) => return,
                },
                default(std::time::Duration::from_millis(200)) => {}
            }
        }
    }

    /// Handle one tick of the clock, performing all time-based actions.
    pub fn clock_tick(&mut self, tick: DateTime<Local>) {
        if self.st.get_event(1).is_none() {
            self.start_exercise_events();
        }
        // While catching up from replay the tick lags the clock; only
        // connect to the BBS once we're current.
        if !self.offline && tick + Duration::minutes(1) > self.st.now() {
            self.run_bbs_session();
        }
        self.generate_injects();
        self.st.mark_overdue_events(tick);
    }

    /// Materialize the start events on the first tick and cascade from them.
    fn start_exercise_events(&mut self) {
        let ev = self.st.start_exercise();
        self.run_triggers(&ev);
        let def = Arc::clone(&self.def);
        for stn in &def.stations {
            let ev = self.st.start_station(&stn.call_sign);
            self.run_triggers(&ev);
        }
    }

    /// Our envelope From address.
    pub(crate) fn my_from(&self) -> String {
        let ex = &self.def.exercise;
        format!(
            "{} <{}@{}.ampr.org>",
            ex.my_name,
            ex.my_call.to_lowercase(),
            ex.bbs_name.to_lowercase()
        )
    }

    /// Resolve a variable reference in the context of a station.
    pub(crate) fn variable(&mut self, name: &str, station: &str) -> Option<String> {
        let (group, item) = name.split_once('.').unwrap_or((name, ""));
        match group {
            "exercise" => self.def.exercise.variables.get(item).cloned(),
            "station" => self
                .def
                .station(station)?
                .variables
                .get(item)
                .cloned(),
            "now" => match item {
                "date" => Some(self.st.now().format("%m/%d/%Y").to_string()),
                "time" => Some(self.st.now().format("%H:%M").to_string()),
                "datetime" => Some(self.st.now().format("%m/%d/%Y %H:%M").to_string()),
                _ => None,
            },
            msgname => {
                let ev = self.st.get_send_receive_event(station, msgname)?;
                if ev.lmi().is_empty() {
                    return None;
                }
                let lmi = ev.lmi().to_owned();
                let occurred = ev.occurred();
                let cached = self
                    .var_cache
                    .as_ref()
                    .filter(|(clmi, _, _)| *clmi == lmi)
                    .map(|(_, env, msg)| (env.clone(), msg.clone()));
                let (env, msg) = match cached {
                    Some(pair) => pair,
                    None => {
                        let (env, msg) = self.store.read_message(&lmi).ok()?;
                        self.var_cache = Some((lmi.clone(), env.clone(), msg.clone()));
                        (env, msg)
                    }
                };
                match item {
                    "msgid" => {
                        let msgid = msg.value(crate::message::Role::OriginMsgId);
                        (!msgid.is_empty()).then(|| msgid.to_owned())
                    }
                    "subjectline" => Some(env.subject_line),
                    "time" => occurred.map(|t| t.format("%m/%d/%Y %H:%M").to_string()),
                    _ => None,
                }
            }
        }
    }
}
