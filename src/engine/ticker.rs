//! The minute-aligned tick source.

use chrono::{DateTime, Duration, Local, Timelike};
use crossbeam::channel::{bounded, Receiver};

/// Round a time up to the next whole minute unless it already is one.
fn ceil_minute(t: DateTime<Local>) -> DateTime<Local> {
    if t.second() == 0 && t.nanosecond() == 0 {
        t
    } else {
        truncate_minute(t) + Duration::minutes(1)
    }
}

/// Round a time down to its whole minute.
pub fn truncate_minute(t: DateTime<Local>) -> DateTime<Local> {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// Compute the first tick time and start the ticker thread. The returned
/// channel carries all integral minutes beginning with the first tick; if
/// that is in the past, ticks are delivered as fast as the engine consumes
/// them until caught up. The channel is unbuffered, so no tick is delivered
/// until the engine is waiting for it.
pub fn start_ticker(
    op_start: Option<DateTime<Local>>,
    last_entry: Option<DateTime<Local>>,
) -> Receiver<DateTime<Local>> {
    let start = match (last_entry, op_start) {
        // No previous state, or opstart was moved later than the log.
        (None, Some(op)) => Some(op),
        (Some(last), Some(op)) if last < op => Some(op),
        // Resume at the integral minute after the last log entry.
        (Some(last), _) => Some(last + Duration::nanoseconds(1)),
        (None, None) => None,
    };
    let start = match start {
        Some(t) => ceil_minute(t),
        None => truncate_minute(Local::now()),
    };
    if start - Local::now() > Duration::minutes(1) {
        eprintln!(
            "NOTICE: engine won't start until opstart: {}",
            start.format("%Y-%m-%d %H:%M")
        );
    }
    run_ticker(start)
}

fn run_ticker(start: DateTime<Local>) -> Receiver<DateTime<Local>> {
    let (tx, rx) = bounded(0);
    std::thread::Builder::new()
        .name("ticker".into())
        .spawn(move || {
            let mut tick = start;
            loop {
                let delay = tick - Local::now();
                if delay > Duration::zero() {
                    std::thread::sleep(delay.to_std().unwrap_or_default());
                }
                if tx.send(tick).is_err() {
                    return;
                }
                tick += Duration::minutes(1);
            }
        })
        .expect("spawn ticker thread");
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2023, 9, 23, h, m, s).unwrap()
    }

    #[test]
    fn minute_rounding() {
        assert_eq!(ceil_minute(at(8, 0, 0)), at(8, 0, 0));
        assert_eq!(ceil_minute(at(8, 0, 1)), at(8, 1, 0));
        assert_eq!(truncate_minute(at(8, 0, 59)), at(8, 0, 0));
    }

    #[test]
    fn catchup_ticks_are_consecutive_minutes() {
        let rx = run_ticker(at(8, 0, 0));
        let t1 = rx.recv().unwrap();
        let t2 = rx.recv().unwrap();
        let t3 = rx.recv().unwrap();
        assert_eq!(t1, at(8, 0, 0));
        assert_eq!(t2, at(8, 1, 0));
        assert_eq!(t3, at(8, 2, 0));
    }
}
