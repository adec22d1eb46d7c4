//! On-disk message store for the exercise directory.
//!
//! Every sent, received, and injected message is kept as a text file named
//! `<LMI>.txt` next to the event log. Delivery receipts we send are kept as
//! `<LMI>.DR.txt`, which doubles as the duplicate-receipt check across
//! restarts.

use std::path::PathBuf;

use chrono::{DateTime, Local};
use thiserror::Error;

use super::{decode_body, decode_raw, encode_raw, Envelope, Message};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{path}: {err}")]
    Io {
        path: String,
        #[source]
        err: std::io::Error,
    },
    #[error("message {lmi} not found")]
    NotFound { lmi: String },
    #[error("duplicate delivery receipt for {lmi}")]
    DuplicateReceipt { lmi: String },
    #[error("can't assign a local message ID from {start:?}")]
    BadStartMsgId { start: String },
}

/// Classification of a message read from the BBS.
#[derive(Debug)]
pub enum Received {
    /// A read receipt; ignored.
    ReadReceipt,
    /// A delivery receipt for a message we sent. `msgid` is our local
    /// message ID (recovered from the quoted subject); `their_lmi` is the
    /// peer's ID for it.
    DeliveryReceipt { msgid: String, their_lmi: String },
    /// Anything else.
    Message(Box<ReceivedMessage>),
}

#[derive(Debug)]
pub struct ReceivedMessage {
    /// The local message ID assigned on receipt.
    pub lmi: String,
    pub env: Envelope,
    pub msg: Message,
    pub raw: String,
    /// The delivery receipt owed to the sender, if any.
    pub receipt: Option<(Envelope, String)>,
}

/// Message store rooted at the exercise directory.
#[derive(Clone, Debug)]
pub struct MessageStore {
    dir: PathBuf,
}

impl MessageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        MessageStore { dir: dir.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn io_err(&self, name: &str, err: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path(name).display().to_string(),
            err,
        }
    }

    /// Save a message under the given local message ID.
    pub fn save_message(
        &self,
        lmi: &str,
        env: &Envelope,
        body: &str,
    ) -> Result<(), StoreError> {
        let name = format!("{lmi}.txt");
        std::fs::write(self.path(&name), encode_raw(env, body))
            .map_err(|err| self.io_err(&name, err))
    }

    /// Read a previously saved message back.
    pub fn read_message(&self, lmi: &str) -> Result<(Envelope, Message), StoreError> {
        let name = format!("{lmi}.txt");
        let raw = std::fs::read_to_string(self.path(&name)).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound {
                    lmi: lmi.to_owned(),
                }
            } else {
                self.io_err(&name, err)
            }
        })?;
        let (env, body) = decode_raw(&raw);
        let msg = decode_body(&env.subject_line, &body);
        Ok((env, msg))
    }

    /// Save a delivery receipt we sent for the message with the given LMI.
    /// Fails with `DuplicateReceipt` if one was already saved.
    pub fn save_receipt(&self, lmi: &str, env: &Envelope, body: &str) -> Result<(), StoreError> {
        let name = format!("{lmi}.DR.txt");
        if self.path(&name).exists() {
            return Err(StoreError::DuplicateReceipt {
                lmi: lmi.to_owned(),
            });
        }
        std::fs::write(self.path(&name), encode_raw(env, body))
            .map_err(|err| self.io_err(&name, err))
    }

    /// Assign the next unused local message ID at or after `start`
    /// (`XXX-NNNL` format).
    pub fn unique_message_id(&self, start: &str) -> Result<String, StoreError> {
        let bad = || StoreError::BadStartMsgId {
            start: start.to_owned(),
        };
        let (prefix, rest) = start.split_once('-').ok_or_else(bad)?;
        if rest.len() < 2 {
            return Err(bad());
        }
        let (digits, suffix) = rest.split_at(rest.len() - 1);
        let width = digits.len();
        let mut num: u64 = digits.parse().map_err(|_| bad())?;
        loop {
            let candidate = format!("{prefix}-{num:0width$}{suffix}");
            if !self.path(&format!("{candidate}.txt")).exists() {
                return Ok(candidate);
            }
            num += 1;
        }
    }

    /// Process a raw message read from the BBS: classify it, assign a local
    /// ID, save it, and build the delivery receipt owed to the sender.
    pub fn receive_message(
        &self,
        raw: &str,
        start_msg_id: &str,
        my_from: &str,
        now: DateTime<Local>,
    ) -> Result<Received, StoreError> {
        let (env, body) = decode_raw(raw);
        if env.subject_line.starts_with("READ: ") {
            return Ok(Received::ReadReceipt);
        }
        if let Some(quoted) = env.subject_line.strip_prefix("DELIVERED: ") {
            let msgid = quoted.split('_').next().unwrap_or("").to_owned();
            let their_lmi = parse_receipt_body(&body).unwrap_or_default();
            return Ok(Received::DeliveryReceipt { msgid, their_lmi });
        }
        let msg = decode_body(&env.subject_line, &body);
        let lmi = self.unique_message_id(start_msg_id)?;
        self.save_message(&lmi, &env, &body)?;
        // Bulletins don't get delivery receipts; everything else does.
        let receipt = if env.bulletin || env.from.is_empty() {
            None
        } else {
            let renv = Envelope {
                from: my_from.to_owned(),
                to: env.from.clone(),
                subject_line: format!("DELIVERED: {}", env.subject_line),
                date: Some(now),
                ..Envelope::default()
            };
            let rbody = format!("!LMI!{lmi}!DR!{}\n", now.format("%m/%d/%Y %H:%M:%S"));
            Some((renv, rbody))
        };
        Ok(Received::Message(Box::new(ReceivedMessage {
            lmi,
            env,
            msg,
            raw: raw.to_owned(),
            receipt,
        })))
    }
}

/// Extract the sender's local message ID from a delivery-receipt body.
fn parse_receipt_body(body: &str) -> Option<String> {
    let rest = body.lines().next()?.strip_prefix("!LMI!")?;
    let (lmi, _) = rest.split_once("!DR!")?;
    Some(lmi.to_owned())
}

/// The local message ID for the inject materialized from the event with the
/// given ID.
pub fn inject_lmi(event_id: usize) -> String {
    format!("INJ-{event_id:03}I")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    fn store() -> (tempfile::TempDir, MessageStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn unique_ids_skip_used_ones() {
        let (_dir, store) = store();
        assert_eq!(store.unique_message_id("XND-100P").unwrap(), "XND-100P");
        store
            .save_message("XND-100P", &Envelope::default(), "x")
            .unwrap();
        assert_eq!(store.unique_message_id("XND-100P").unwrap(), "XND-101P");
    }

    #[test]
    fn save_and_read_round_trip() {
        let (_dir, store) = store();
        let env = Envelope {
            from: "ke6xyz@w1abc.ampr.org".into(),
            to: "xnd@w1abc.ampr.org".into(),
            subject_line: "XND-001P_R_Test".into(),
            ..Envelope::default()
        };
        store.save_message("XND-001P", &env, "hello").unwrap();
        let (env2, msg) = store.read_message("XND-001P").unwrap();
        assert_eq!(env2.subject_line, env.subject_line);
        assert_eq!(msg.value(Role::Body), "hello");
    }

    #[test]
    fn read_missing_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.read_message("XND-999P"),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn receive_assigns_lmi_and_builds_receipt() {
        let (_dir, store) = store();
        let raw = "From: ke6xyz@w1abc.ampr.org\nTo: xnd\nSubject: 6KE-001P_R_Hello\n\nhi there";
        let received = store
            .receive_message(raw, "XND-100P", "xnd@w1abc.ampr.org", Local::now())
            .unwrap();
        let Received::Message(rm) = received else {
            panic!("expected a message");
        };
        assert_eq!(rm.lmi, "XND-100P");
        let (renv, rbody) = rm.receipt.as_ref().unwrap();
        assert_eq!(renv.subject_line, "DELIVERED: 6KE-001P_R_Hello");
        assert!(rbody.starts_with("!LMI!XND-100P!DR!"));
    }

    #[test]
    fn receive_classifies_receipts() {
        let (_dir, store) = store();
        let raw = "From: ke6xyz@w1abc\nSubject: READ: XND-001P_R_Test\n\nread";
        assert!(matches!(
            store
                .receive_message(raw, "XND-100P", "me", Local::now())
                .unwrap(),
            Received::ReadReceipt
        ));
        let raw = "From: ke6xyz@w1abc\nSubject: DELIVERED: XND-042P_R_Test\n\n!LMI!KE6-007P!DR!09/23/2023 10:20:00";
        let Received::DeliveryReceipt { msgid, their_lmi } = store
            .receive_message(raw, "XND-100P", "me", Local::now())
            .unwrap()
        else {
            panic!("expected a delivery receipt");
        };
        assert_eq!(msgid, "XND-042P");
        assert_eq!(their_lmi, "KE6-007P");
    }

    #[test]
    fn duplicate_receipt_detected() {
        let (_dir, store) = store();
        store
            .save_receipt("XND-001P", &Envelope::default(), "!LMI!X!DR!now")
            .unwrap();
        assert!(matches!(
            store.save_receipt("XND-001P", &Envelope::default(), "again"),
            Err(StoreError::DuplicateReceipt { .. })
        ));
    }

    #[test]
    fn inject_naming() {
        assert_eq!(inject_lmi(7), "INJ-007I");
        assert_eq!(inject_lmi(123), "INJ-123I");
    }
}
