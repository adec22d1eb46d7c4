//! The trigger cascade: converting occurrences into downstream
//! expectations and schedules.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Duration;

use crate::definition::{CondOp, EventDef, EventType};
use crate::state::Event;

use super::Engine;

impl Engine {
    /// Run the trigger cascade for an occurred event. The cascade is a BFS
    /// over a queue of occurred events to keep fan-out deterministic.
    pub(crate) fn run_triggers(&mut self, ev: &Event) {
        let mut queue = VecDeque::from([ev.clone()]);
        while let Some(trigger) = queue.pop_front() {
            queue.extend(self.run_triggers_for_one(&trigger));
        }
    }

    fn run_triggers_for_one(&mut self, trigger: &Event) -> Vec<Event> {
        let def = Arc::clone(&self.def);
        let base = trigger.occurred().unwrap_or_else(|| self.st.now());
        // A send to a station with a delivery-receipt delay expects the
        // receipt.
        if trigger.etype() == EventType::Send {
            if let Some(stn) = def.station(trigger.station()) {
                if stn.receipt_delay > Duration::zero() {
                    self.st.expect_event(
                        EventType::Receipt,
                        &stn.call_sign,
                        trigger.name(),
                        base + stn.receipt_delay,
                        trigger.id(),
                    );
                }
            }
        }
        let mut cascade = Vec::new();
        for edef in &def.events {
            cascade.extend(self.maybe_trigger_event(trigger, edef));
        }
        cascade
    }

    fn maybe_trigger_event(&mut self, trigger: &Event, edef: &EventDef) -> Option<Event> {
        if edef.trigger_type != trigger.etype() || edef.trigger_name != trigger.name() {
            return None;
        }
        if !self.trigger_condition_met(edef, trigger) {
            return None;
        }
        // Bulletins cascade only from global triggers; everything else only
        // from station-specific ones.
        if (edef.etype == EventType::Bulletin) != trigger.station().is_empty() {
            return None;
        }
        let at = trigger.occurred().unwrap_or_else(|| self.st.now()) + edef.delay;
        match edef.etype {
            EventType::Bulletin => {
                // Schedule globally, then per station to track visibility.
                self.st
                    .schedule_event(EventType::Bulletin, "", &edef.name, at, trigger.id());
                let def = Arc::clone(&self.def);
                for stn in &def.stations {
                    self.st.schedule_event(
                        EventType::Bulletin,
                        &stn.call_sign,
                        &edef.name,
                        at,
                        trigger.id(),
                    );
                }
                None
            }
            EventType::Inject | EventType::Send => {
                self.st
                    .schedule_event(edef.etype, trigger.station(), &edef.name, at, trigger.id());
                None
            }
            EventType::Alert | EventType::Deliver | EventType::Receive => {
                let target = self.st.expect_event(
                    edef.etype,
                    trigger.station(),
                    &edef.name,
                    at,
                    trigger.id(),
                );
                // A message that arrived before it was expected is promoted
                // by the expectation; cascade from it in turn.
                if !target.lmi().is_empty() && target.occurred().is_some() {
                    return Some(target);
                }
                None
            }
            // The definition parser only admits the types above.
            _ => panic!("unexpected event type {} in trigger cascade", edef.etype),
        }
    }

    fn trigger_condition_met(&mut self, edef: &EventDef, trigger: &Event) -> bool {
        let Some(cond) = edef.condition.clone() else {
            return true;
        };
        // An undefined variable fails the condition.
        let Some(have) = self.variable(&cond.var, trigger.station()) else {
            return false;
        };
        match cond.op {
            CondOp::Eq => have == cond.val,
            CondOp::Ne => have != cond.val,
            CondOp::Lt => have < cond.val,
            CondOp::Le => have <= cond.val,
            CondOp::Gt => have > cond.val,
            CondOp::Ge => have >= cond.val,
            CondOp::Matches => cond.re.as_ref().is_some_and(|re| re.is_match(&have)),
        }
    }
}
