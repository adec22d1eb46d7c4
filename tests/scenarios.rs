//! End-to-end engine scenarios against a scripted BBS.

mod fixtures;

use chrono::Duration;

use packet_drill::definition::EventType;
use packet_drill::engine::ManualTrigger;
use packet_drill::message::Role;
use packet_drill::state::State;

use fixtures::{at, raw_message, Harness};

#[test]
fn cold_start_materializes_start_events_and_schedules() {
    let mut h = Harness::new();
    h.tick_at(at(8, 0));
    let st = h.engine.state();
    let start = st.get_event(1).unwrap();
    assert_eq!(start.etype(), EventType::Start);
    assert_eq!(start.station(), "");
    assert!(start.occurred().is_some());
    for (id, call) in [(2, "KE6XYZ"), (5, "KE6ABC")] {
        let e = st.get_event(id).unwrap();
        assert_eq!(e.etype(), EventType::Start);
        assert_eq!(e.station(), call);
        assert!(e.occurred().is_some());
    }
    // Each station start cascades its trigger=start events.
    for call in ["KE6XYZ", "KE6ABC"] {
        let inj = st.find_event(EventType::Inject, call, "FOO_REQ").unwrap();
        assert_eq!(inj.expected(), Some(at(8, 3)));
        assert!(inj.occurred().is_none());
        let snd = st.find_event(EventType::Send, call, "STATUS_REQ").unwrap();
        assert_eq!(snd.expected(), Some(at(8, 5)));
    }
    // The manual bulletin is not scheduled by start.
    assert!(st.find_event(EventType::Bulletin, "", "WX_ALERT").is_none());
}

#[test]
fn inject_generates_artifact_and_expected_receive_scores_100() {
    let mut h = Harness::new();
    h.tick_at(at(8, 0));
    h.tick_at(at(8, 3));
    let store = h.store();

    // The inject was materialized and recorded.
    let inj = h
        .engine
        .state()
        .find_event(EventType::Inject, "KE6XYZ", "FOO_REQ")
        .unwrap()
        .clone();
    assert!(inj.occurred().is_some());
    let inj_lmi = format!("INJ-{:03}I", inj.id());
    let (_, inj_msg) = store.read_message(&inj_lmi).unwrap();
    assert_eq!(inj_msg.value(Role::Subject), "Resource request");
    assert_eq!(
        inj_msg.value(Role::Body),
        "Need sandbags at City Hall."
    );
    // The inject swaps the routing block: the station reports to us.
    assert_eq!(inj_msg.value(Role::ToIcsPosition), "Operations");
    assert_eq!(inj_msg.value(Role::FromIcsPosition), "Planning");
    // Its cascade expects the station to send it back within five minutes.
    let rcv = h
        .engine
        .state()
        .find_event(EventType::Receive, "KE6XYZ", "FOO_REQ")
        .unwrap();
    assert_eq!(rcv.expected(), Some(at(8, 8)));

    // The station transcribes the inject perfectly and sends it in.
    let mut echo = inj_msg;
    echo.field_mut(Role::OriginMsgId).unwrap().value = "6KE-101P".into();
    let raw = raw_message(
        "KE6XYZ <ke6xyz@w1abc.ampr.org>",
        &echo.encode_subject(),
        &echo.encode_body(),
    );
    h.bbs.push_inbound(raw);
    h.tick_at(at(8, 5));

    let rcv = h
        .engine
        .state()
        .find_event(EventType::Receive, "KE6XYZ", "FOO_REQ")
        .unwrap();
    assert!(rcv.occurred().is_some());
    assert_eq!(rcv.score(), 100);
    assert!(!rcv.lmi().is_empty());
    // The inject now knows the station's message ID for it.
    let inj = h.engine.state().get_event(inj.id()).unwrap();
    assert_eq!(inj.rmi(), "6KE-101P");
    // A delivery receipt went back, and the message was killed.
    assert!(h
        .bbs
        .sent()
        .iter()
        .any(|m| m.subject.starts_with("DELIVERED: ")));
    assert_eq!(h.bbs.killed(), vec![1]);
}

#[test]
fn wrong_prefix_is_a_problem_not_a_failure() {
    let mut h = Harness::new();
    h.tick_at(at(8, 0));
    h.tick_at(at(8, 3));
    let store = h.store();
    let inj = h
        .engine
        .state()
        .find_event(EventType::Inject, "KE6XYZ", "FOO_REQ")
        .unwrap()
        .clone();
    let (_, mut echo) = store
        .read_message(&format!("INJ-{:03}I", inj.id()))
        .unwrap();
    // 6KX is not KE6XYZ's assigned prefix.
    echo.field_mut(Role::OriginMsgId).unwrap().value = "6KX-001P".into();
    h.bbs.push_inbound(raw_message(
        "KE6XYZ <ke6xyz@w1abc.ampr.org>",
        &echo.encode_subject(),
        &echo.encode_body(),
    ));
    h.tick_at(at(8, 5));
    let rcv = h
        .engine
        .state()
        .find_event(EventType::Receive, "KE6XYZ", "FOO_REQ")
        .unwrap();
    assert!(rcv.score() >= 90 && rcv.score() < 100, "score {}", rcv.score());
    assert!(rcv
        .notes()
        .iter()
        .any(|n| n.contains("wrong message number prefix")));
}

#[test]
fn early_receive_is_held_then_promoted_by_expectation() {
    let mut h = Harness::new();
    h.tick_at(at(8, 0));
    // A status report arrives before anything asked for it.
    h.bbs.push_inbound(raw_message(
        "KE6XYZ <ke6xyz@w1abc.ampr.org>",
        "6KE-102P_R_KE6XYZ status",
        "Status normal.",
    ));
    h.tick_at(at(8, 2));
    let rcv = h
        .engine
        .state()
        .find_event(EventType::Receive, "KE6XYZ", "STATUS_RPT")
        .unwrap()
        .clone();
    assert!(rcv.occurred().is_none(), "no expectation yet");
    assert!(!rcv.lmi().is_empty());
    assert!(rcv
        .notes()
        .iter()
        .any(|n| n.contains("unexpected/early message")));
    // Plain text against an ICS213 model halves the ceiling.
    assert!(rcv.notes().iter().any(|n| n.contains("incorrect message type")));
    assert_eq!(rcv.score(), 50);

    // The status request goes out at 08:05 and expects the report, which
    // promotes the early arrival.
    h.tick_at(at(8, 5));
    let rcv = h.engine.state().get_event(rcv.id()).unwrap();
    assert!(rcv.occurred().is_some());
    assert_eq!(rcv.expected(), Some(at(8, 15)));
}

#[test]
fn bulletin_fanout_shares_one_lmi() {
    let mut h = Harness::new();
    h.tick_at(at(8, 0));
    h.engine.manual_trigger(ManualTrigger {
        etype: EventType::Bulletin,
        station: String::new(),
        name: "WX_ALERT".to_owned(),
    });
    h.tick_at(at(9, 1));
    let st = h.engine.state();
    let global = st.find_event(EventType::Bulletin, "", "WX_ALERT").unwrap();
    assert!(global.occurred().is_some());
    assert!(!global.lmi().is_empty());
    for call in ["KE6XYZ", "KE6ABC"] {
        let e = st.find_event(EventType::Bulletin, call, "WX_ALERT").unwrap();
        assert!(e.occurred().is_some());
        assert_eq!(e.lmi(), global.lmi());
    }
    let posted = h.bbs.sent();
    assert!(posted.iter().any(|m| m.subject == "Weather Alert"
        && m.to == ["XSC@ALLXSC".to_owned()]
        && m.body.contains("Severe weather")));
}

#[test]
fn late_delivery_receipt_completes_overdue_receipt_event() {
    let mut h = Harness::new();
    h.tick_at(at(8, 0));
    h.tick_at(at(8, 5));
    let st = h.engine.state();
    // The send to the receipt-expecting station spawned a receipt
    // expectation fifteen minutes out.
    let send = st
        .find_event(EventType::Send, "KE6ABC", "STATUS_REQ")
        .unwrap()
        .clone();
    assert!(send.occurred().is_some());
    let receipt = st
        .find_event(EventType::Receipt, "KE6ABC", "STATUS_REQ")
        .unwrap()
        .clone();
    assert_eq!(receipt.expected(), Some(at(8, 20)));
    // No station without a receipt delay gets one.
    assert!(st
        .find_event(EventType::Receipt, "KE6XYZ", "STATUS_REQ")
        .is_none());

    // Deadline passes with no receipt.
    h.tick_at(at(8, 21));
    let receipt = h.engine.state().get_event(receipt.id()).unwrap().clone();
    assert!(receipt.overdue());
    assert!(receipt.occurred().is_none());

    // The receipt finally arrives.
    let subject = format!("DELIVERED: {}_R_ICS213_Status request", send.lmi());
    h.bbs.push_inbound(raw_message(
        "KE6ABC <ke6abc@w1abc.ampr.org>",
        &subject,
        "!LMI!KE6-042P!DR!09/23/2023 08:25:00",
    ));
    h.tick_at(at(8, 25));
    let st = h.engine.state();
    let send = st.get_event(send.id()).unwrap();
    assert_eq!(send.rmi(), "KE6-042P");
    let receipt = st.get_event(receipt.id()).unwrap();
    assert!(receipt.occurred().is_some());
    assert!(receipt.overdue(), "overdue is sticky");
}

#[test]
fn unknown_sender_is_rejected_with_reply() {
    let mut h = Harness::new();
    h.tick_at(at(8, 0));
    h.bbs.push_inbound(raw_message(
        "W1NOT <w1not@w1abc.ampr.org>",
        "W1N-001P_R_hello there",
        "who am I",
    ));
    h.tick_at(at(8, 2));
    let st = h.engine.state();
    let reject = st.find_event(EventType::Reject, "UNKNOWN", "UNKNOWN").unwrap();
    assert!(reject.occurred().is_some());
    assert!(!reject.lmi().is_empty());
    // No receive event was created and no cascade fired.
    assert!(st.find_event(EventType::Receive, "UNKNOWN", "UNKNOWN").is_none());
    let sent = h.bbs.sent();
    assert!(sent
        .iter()
        .any(|m| m.subject == "REJECT: W1N-001P_R_hello there"
            && m.body.contains("does not correspond to any station")));
    assert_eq!(h.bbs.killed(), vec![1]);
}

#[test]
fn unknown_message_is_rejected_per_station() {
    let mut h = Harness::new();
    h.tick_at(at(8, 0));
    h.bbs.push_inbound(raw_message(
        "KE6XYZ <ke6xyz@w1abc.ampr.org>",
        "6KE-103P_R_lunch order",
        "two sandwiches",
    ));
    h.tick_at(at(8, 2));
    let st = h.engine.state();
    let reject = st.find_event(EventType::Reject, "KE6XYZ", "UNKNOWN").unwrap();
    assert!(reject.occurred().is_some());
    assert!(h
        .bbs
        .sent()
        .iter()
        .any(|m| m.subject.starts_with("REJECT: ")
            && m.body.contains("does not match any of the messages")));
}

#[test]
fn transient_send_failure_retries_next_tick() {
    let mut h = Harness::new();
    h.tick_at(at(8, 0));
    h.bbs.fail_sends(true);
    h.tick_at(at(8, 5));
    let pending = h
        .engine
        .state()
        .find_event(EventType::Send, "KE6XYZ", "STATUS_REQ")
        .unwrap()
        .clone();
    assert!(pending.occurred().is_none(), "send aborted, still pending");
    h.bbs.fail_sends(false);
    h.tick_at(at(8, 6));
    let sent = h.engine.state().get_event(pending.id()).unwrap();
    assert!(sent.occurred().is_some());
    assert!(!sent.lmi().is_empty());
}

#[test]
fn manual_inject_trigger_generates_immediately() {
    let mut h = Harness::new();
    h.tick_at(at(8, 0));
    // Nudge the clock past the minute so the freshly scheduled event is due.
    *h.clock.lock().unwrap() = at(8, 1) + Duration::seconds(30);
    h.engine.manual_trigger(ManualTrigger {
        etype: EventType::Inject,
        station: "KE6ABC".to_owned(),
        name: "FOO_REQ".to_owned(),
    });
    // No tick needed: manual handling generates injects right away.
    let inj = h
        .engine
        .state()
        .find_event(EventType::Inject, "KE6ABC", "FOO_REQ")
        .unwrap();
    assert!(inj.occurred().is_some());
}

#[test]
fn replaying_the_log_reconstructs_identical_state() {
    let mut h = Harness::new();
    h.tick_at(at(8, 0));
    h.tick_at(at(8, 3));
    let store = h.store();
    let inj = h
        .engine
        .state()
        .find_event(EventType::Inject, "KE6XYZ", "FOO_REQ")
        .unwrap()
        .clone();
    let (_, mut echo) = store
        .read_message(&format!("INJ-{:03}I", inj.id()))
        .unwrap();
    echo.field_mut(Role::OriginMsgId).unwrap().value = "6KE-101P".into();
    h.bbs.push_inbound(raw_message(
        "KE6XYZ <ke6xyz@w1abc.ampr.org>",
        &echo.encode_subject(),
        &echo.encode_body(),
    ));
    h.tick_at(at(8, 5));
    h.tick_at(at(8, 21));

    let mut replayed = State::new();
    replayed.open(&h.log_path()).unwrap();
    assert_eq!(replayed.all_events(), h.engine.state().all_events());
    let (last_time, last_eid) = replayed.last_entry();
    assert!(last_time.is_some());
    assert!(last_eid > 0);
}
