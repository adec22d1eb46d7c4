//! The BBS transport seam.
//!
//! The engine drives a mailbox session through [`BbsConnection`]; the real
//! connector (a telnet JNOS client) lives outside this crate. [`testing`]
//! provides a scripted in-memory connection for tests.

use std::io;

use crate::definition::Exercise;

/// One connected mailbox session.
pub trait BbsConnection {
    /// Read the message with the given number (1-based). An empty string
    /// means there are no more messages.
    fn read(&mut self, msgnum: usize) -> io::Result<String>;

    /// Send a message to the given addresses.
    fn send(&mut self, subject: &str, body: &str, to: &[String]) -> io::Result<()>;

    /// Delete messages from the mailbox.
    fn kill(&mut self, msgnums: &[usize]) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;
}

/// Opens a connection to the exercise BBS. Transient failures are reported
/// as errors; the engine retries on the next tick.
pub type Connector = Box<dyn FnMut(&Exercise) -> io::Result<Box<dyn BbsConnection>> + Send>;

/// A connector that always fails; used with `-offline`.
pub fn offline_connector() -> Connector {
    Box::new(|_| {
        Err(io::Error::new(
            io::ErrorKind::NotConnected,
            "BBS connection disabled",
        ))
    })
}

pub mod testing {
    //! Scripted in-memory BBS for tests.

    use std::io;
    use std::sync::{Arc, Mutex};

    use super::BbsConnection;

    /// A message recorded by [`ScriptedBbs`] when the engine sends.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct SentMessage {
        pub subject: String,
        pub body: String,
        pub to: Vec<String>,
    }

    #[derive(Default)]
    struct Shared {
        inbound: Vec<String>,
        sent: Vec<SentMessage>,
        killed: Vec<usize>,
        pending_kills: Vec<usize>,
        closed: usize,
        fail_sends: bool,
    }

    /// Shared scripted mailbox. Clone handles freely; each tick's
    /// connection sees the current inbound queue.
    #[derive(Clone, Default)]
    pub struct ScriptedBbs {
        shared: Arc<Mutex<Shared>>,
    }

    impl ScriptedBbs {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a raw message for the engine to read on its next session.
        pub fn push_inbound(&self, raw: impl Into<String>) {
            self.shared.lock().unwrap().inbound.push(raw.into());
        }

        /// Make subsequent sends fail, to exercise transient-error paths.
        pub fn fail_sends(&self, fail: bool) {
            self.shared.lock().unwrap().fail_sends = fail;
        }

        pub fn sent(&self) -> Vec<SentMessage> {
            self.shared.lock().unwrap().sent.clone()
        }

        pub fn killed(&self) -> Vec<usize> {
            self.shared.lock().unwrap().killed.clone()
        }

        pub fn close_count(&self) -> usize {
            self.shared.lock().unwrap().closed
        }

        /// A connection view over this mailbox.
        pub fn connect(&self) -> Box<dyn BbsConnection> {
            Box::new(Connection {
                shared: Arc::clone(&self.shared),
            })
        }
    }

    struct Connection {
        shared: Arc<Mutex<Shared>>,
    }

    impl BbsConnection for Connection {
        fn read(&mut self, msgnum: usize) -> io::Result<String> {
            let shared = self.shared.lock().unwrap();
            Ok(shared
                .inbound
                .get(msgnum - 1)
                .cloned()
                .unwrap_or_default())
        }

        fn send(&mut self, subject: &str, body: &str, to: &[String]) -> io::Result<()> {
            let mut shared = self.shared.lock().unwrap();
            if shared.fail_sends {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "send failed"));
            }
            shared.sent.push(SentMessage {
                subject: subject.to_owned(),
                body: body.to_owned(),
                to: to.to_vec(),
            });
            Ok(())
        }

        fn kill(&mut self, msgnums: &[usize]) -> io::Result<()> {
            let mut shared = self.shared.lock().unwrap();
            shared.killed.extend_from_slice(msgnums);
            shared.pending_kills.extend_from_slice(msgnums);
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            let mut shared = self.shared.lock().unwrap();
            shared.closed += 1;
            // Killed messages disappear (and the rest renumber) once the
            // session ends, like a real mailbox.
            let mut kills = std::mem::take(&mut shared.pending_kills);
            kills.sort_unstable();
            kills.dedup();
            for n in kills.into_iter().rev() {
                if n >= 1 && n <= shared.inbound.len() {
                    shared.inbound.remove(n - 1);
                }
            }
            Ok(())
        }
    }
}
