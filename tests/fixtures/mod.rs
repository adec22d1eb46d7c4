//! Shared test rig: a small exercise definition, a controllable clock, and
//! an engine wired to a scripted BBS.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Local, TimeZone};

use packet_drill::bbs::testing::ScriptedBbs;
use packet_drill::bbs::Connector;
use packet_drill::definition::{self, Definition};
use packet_drill::engine::{Engine, NoopSink};
use packet_drill::message::MessageStore;
use packet_drill::state::State;

pub const SAMPLE_DEF: &str = "\
[EXERCISE]
incident      Jade Dragon
activation    XND-23-01
opstart       09/23/2023 08:00
opend         09/23/2023 17:00
mycall        XNDEOC
myname        Exercise EOC
myposition    Operations
mylocation    County EOC
opcall        W6XYZ
opname        Pat Operator
bbsname       W1ABC
bbsaddress    w1abc.ampr.org:8080
bbspassword   secret
startmsgid    XND-100P

[FORM VALIDATION]
tag       minver  handling  toposition            tolocation
ICS213    2.0     ROUTINE   Planning, Operations  County EOC

[STATIONS]
callsign  prefix  fcccall  inject  position   location   receipt
KE6XYZ    6KE     •        print   Planning   City Hall  •
KE6ABC    6KA     •        •       Logistics  Firehouse  15m

[EVENTS]
group    type      name        trigger           delay  react
Startup  bulletin  WX_ALERT    manual            •      •
Startup  inject    FOO_REQ     start             3m     5m
Flow     send      STATUS_REQ  start             5m     •
Flow     receive   STATUS_RPT  send STATUS_REQ   10m    •

[MATCH RECEIVE]
name        type    subject  subjectre
FOO_REQ     ICS213  •        Resource.*
STATUS_RPT  •       •        .*status.*

[BULLETIN WX_ALERT]
Area      XSC@ALLXSC
Subject   Weather Alert
Message   Severe weather expected this afternoon.

[SEND STATUS_REQ]
type      ICS213
Subject   Status request
Message   Please report your station status.

[RECEIVE FOO_REQ]
type      ICS213
Subject   Resource request
Message   Need sandbags at «station.location».

[RECEIVE STATUS_RPT]
type      ICS213
Subject   «station.callsign» status
Message   Status normal.
";

/// A local time on the exercise day.
pub fn at(hour: u32, minute: u32) -> DateTime<Local> {
    Local.with_ymd_and_hms(2023, 9, 23, hour, minute, 0).unwrap()
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub clock: Arc<Mutex<DateTime<Local>>>,
    pub bbs: ScriptedBbs,
    pub engine: Engine,
    pub def: Arc<Definition>,
}

impl Harness {
    pub fn new() -> Harness {
        Self::with_definition(SAMPLE_DEF)
    }

    pub fn with_definition(def_text: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let def_path = dir.path().join("exercise.def");
        std::fs::write(&def_path, def_text).unwrap();
        let def = Arc::new(definition::load(def_path.to_str().unwrap()).unwrap());
        let clock = Arc::new(Mutex::new(at(8, 0)));
        let mut st = State::new();
        let clock2 = Arc::clone(&clock);
        st.set_now_fn(move || *clock2.lock().unwrap());
        st.open(&dir.path().join("exercise.log")).unwrap();
        let bbs = ScriptedBbs::new();
        let bbs2 = bbs.clone();
        let connector: Connector = Box::new(move |_| Ok(bbs2.connect()));
        let store = MessageStore::new(dir.path());
        let engine = Engine::new(Arc::clone(&def), st, store, connector, Box::new(NoopSink));
        Harness {
            dir,
            clock,
            bbs,
            engine,
            def,
        }
    }

    /// Advance the clock just past `t` and run the tick for `t`. The extra
    /// second mirrors real operation, where the engine code runs after the
    /// minute boundary, and lets strictly-before deadline checks fire.
    pub fn tick_at(&mut self, t: DateTime<Local>) {
        *self.clock.lock().unwrap() = t + Duration::seconds(1);
        self.engine.clock_tick(t);
    }

    pub fn store(&self) -> MessageStore {
        MessageStore::new(self.dir.path())
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.path().join("exercise.log")
    }
}

/// Wrap a subject and body in the on-wire form the BBS hands the engine.
pub fn raw_message(from: &str, subject: &str, body: &str) -> String {
    format!("From: {from}\nTo: xndeoc@w1abc.ampr.org\nSubject: {subject}\n\n{body}")
}
