//! Durable storage for the event log.
//!
//! On open, any existing log is replayed through the executor to rebuild the
//! in-memory state, then an appender listener is installed so every
//! subsequent line lands in the file before it is folded in memory. A crash
//! can therefore lose at most the intent of an unlogged change, never invent
//! one.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use super::{State, StateError, StateListener};

struct LogAppender {
    file: File,
}

impl StateListener for LogAppender {
    fn on_log_line(&mut self, line: &str) {
        // Unbuffered and flushed: the write must precede the in-memory fold.
        if let Err(err) = writeln!(self.file, "{line}").and_then(|_| self.file.flush()) {
            tracing::error!("event log append failed: {err}");
        }
    }
}

impl State {
    /// Connect the state to a log file, creating it if needed. Replays every
    /// entry already in the file, then installs the appender.
    pub fn open(&mut self, fname: &Path) -> Result<(), StateError> {
        let display_name = fname.display().to_string();
        let io_err = |err: std::io::Error| StateError::LogIo {
            file: display_name.clone(),
            err,
        };
        let mut contents = match std::fs::read_to_string(fname) {
            Ok(c) => c,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(io_err(err)),
        };
        // A crash mid-append leaves a partial final line; truncate back to
        // the last complete one.
        if !contents.is_empty() && !contents.ends_with('\n') {
            let keep = contents.rfind('\n').map(|i| i + 1).unwrap_or(0);
            tracing::warn!(
                file = %display_name,
                "truncating {} bytes of incomplete final log line",
                contents.len() - keep
            );
            contents.truncate(keep);
            std::fs::write(fname, &contents).map_err(io_err)?;
        }
        for (lnum, line) in contents.lines().enumerate() {
            self.execute(line).map_err(|err| StateError::Replay {
                file: display_name.clone(),
                line: lnum + 1,
                source: Box::new(err),
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(fname)
            .map_err(io_err)?;
        self.add_listener(LogAppender { file });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Local, TimeZone};

    use crate::definition::EventType;
    use crate::state::State;

    fn fixed(min: u32, sec: u32) -> chrono::DateTime<Local> {
        Local.with_ymd_and_hms(2023, 9, 23, 8, min, sec).unwrap()
    }

    #[test]
    fn replay_reconstructs_identical_state() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("exercise.log");
        let mut st = State::new();
        st.set_now_fn(|| fixed(0, 0));
        st.open(&log).unwrap();
        st.start_exercise();
        st.start_station("KE6XYZ");
        st.schedule_event(EventType::Inject, "KE6XYZ", "FOO_REQ", fixed(3, 0), 1);
        st.create_inject("KE6XYZ", "FOO_REQ", "XND-900P", "PRINTED", 1);
        st.expect_event(EventType::Receive, "KE6XYZ", "FOO_REQ", fixed(8, 0), 3);
        st.receive_message("KE6XYZ", "FOO_REQ", "XND-100P", "ke6xyz@w1abc", "subj");
        let scored = st.find_event(EventType::Receive, "KE6XYZ", "FOO_REQ").unwrap().clone();
        st.score_message(&scored, &["transcription error in Subject".to_owned()], 90);
        let original: Vec<_> = st.all_events().to_vec();

        let mut replayed = State::new();
        replayed.open(&log).unwrap();
        assert_eq!(replayed.all_events(), &original[..]);
        assert_eq!(
            replayed.address_for_station("KE6XYZ"),
            "ke6xyz@w1abc"
        );
    }

    #[test]
    fn partial_final_line_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("exercise.log");
        std::fs::write(
            &log,
            "2023-09-23T08:00:00.000 [1] ALL start\n2023-09-23T08:00:00.001 [2] KE6",
        )
        .unwrap();
        let mut st = State::new();
        st.open(&log).unwrap();
        assert_eq!(st.all_events().len(), 1);
        let contents = std::fs::read_to_string(&log).unwrap();
        assert_eq!(contents, "2023-09-23T08:00:00.000 [1] ALL start\n");
    }

    #[test]
    fn corrupt_line_reports_file_and_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("exercise.log");
        std::fs::write(
            &log,
            "2023-09-23T08:00:00.000 [1] ALL start\nnot a log line\n",
        )
        .unwrap();
        let mut st = State::new();
        let err = st.open(&log).unwrap_err();
        assert!(err.to_string().contains("exercise.log:2:"));
    }

    #[test]
    fn appender_persists_new_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("exercise.log");
        let mut st = State::new();
        st.set_now_fn(|| fixed(0, 0));
        st.open(&log).unwrap();
        st.start_exercise();
        st.log_error(&"boom");
        let contents = std::fs::read_to_string(&log).unwrap();
        assert!(contents.contains("[1] ALL start"));
        assert!(contents.contains("ERROR: boom"));
    }
}
