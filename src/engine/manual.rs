//! Operator-issued manual triggers.

use crate::definition::EventType;

use super::{Engine, ManualTrigger};

impl Engine {
    /// Handle a manual trigger from the operator.
    pub fn manual_trigger(&mut self, mt: ManualTrigger) {
        match mt.etype {
            EventType::Bulletin if mt.station.is_empty() => {
                // (Re-)schedule the bulletin posting for the next tick.
                let now = self.st.now();
                self.st
                    .schedule_event(EventType::Bulletin, "", &mt.name, now, 0);
            }
            EventType::Inject | EventType::Send if !mt.station.is_empty() => {
                let now = self.st.now();
                self.st
                    .schedule_event(mt.etype, &mt.station, &mt.name, now, 0);
            }
            EventType::Alert | EventType::Deliver | EventType::Receive
                if !mt.station.is_empty() =>
            {
                // Mark the event as occurred (creating it if need be) and
                // cascade.
                if let Some(ev) = self.st.record_event(mt.etype, &mt.station, &mt.name) {
                    self.run_triggers(&ev);
                }
            }
            _ => {}
        }
        // Bulletins and sends wait for the next BBS connection, but injects
        // can be generated right away so the operator sees the effect.
        self.generate_injects();
    }
}
