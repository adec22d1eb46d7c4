//! Inject materialization and handoff.
//!
//! An inject is a message we expect a station to send to us; the engine
//! renders it and hands it to the station's operator. Actual printing and
//! mailing live behind [`InjectSink`]; the engine records which method was
//! used.

use crate::definition::{EventType, Station};
use crate::message::Role;

use super::Engine;

/// How an inject reached (or failed to reach) the station's operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InjectMethod {
    Printed,
    Emailed,
    /// Only the on-disk artifact was created.
    Created,
}

impl InjectMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            InjectMethod::Printed => "PRINTED",
            InjectMethod::Emailed => "EMAILED",
            InjectMethod::Created => "CREATED",
        }
    }
}

/// Physical dispatch of a materialized inject.
pub trait InjectSink: Send {
    /// Hand the saved inject for `lmi` to the station's operator, honoring
    /// the station's `inject` attribute. Falls back to `Created` when the
    /// handoff isn't possible.
    fn dispatch(&mut self, station: &Station, lmi: &str) -> InjectMethod;
}

/// A sink that never prints or mails; every inject is just `Created`.
pub struct NoopSink;

impl InjectSink for NoopSink {
    fn dispatch(&mut self, _station: &Station, _lmi: &str) -> InjectMethod {
        InjectMethod::Created
    }
}

impl Engine {
    /// Materialize every inject that is due.
    pub(crate) fn generate_injects(&mut self) {
        while let Some(ev) = self.st.pending_event(EventType::Inject).cloned() {
            let Some((lmi, _env, msg)) = self.generate_inject(&ev) else {
                self.st.drop_event(&ev);
                continue;
            };
            let rmi = msg.value(Role::OriginMsgId).to_owned();
            let method = self.dispatch_inject(&ev, &lmi);
            let iev =
                self.st
                    .create_inject(ev.station(), ev.name(), &rmi, method.as_str(), ev.trigger());
            self.run_triggers(&iev);
        }
    }

    fn dispatch_inject(&mut self, ev: &crate::state::Event, lmi: &str) -> InjectMethod {
        let Some(stn) = self.def.station(ev.station()).cloned() else {
            return InjectMethod::Created;
        };
        if stn.inject.is_empty() {
            return InjectMethod::Created;
        }
        self.inject_sink.dispatch(&stn, lmi)
    }
}
