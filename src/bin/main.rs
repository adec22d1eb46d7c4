//! Exercise automation engine.
//!
//! usage: pktdrill [definition-file]
//!
//! The argument is the exercise definition file, default `exercise.def` in
//! the current directory. The engine changes to the definition's directory
//! before opening it, so the event log and message files land beside it.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;

use packet_drill::engine::{start_ticker, Engine, NoopSink};
use packet_drill::monitor::{start_server, MonitorListener, MonitorState};
use packet_drill::message::MessageStore;
use packet_drill::state::State;
use packet_drill::{bbs, definition, telemetry};

#[derive(Parser)]
#[command(name = "pktdrill", version, about = "Packet exercise automation engine")]
struct Cli {
    /// Exercise definition file.
    #[arg(default_value = "exercise.def")]
    definition: String,

    /// Disable the ticker and the BBS connection.
    #[arg(long)]
    offline: bool,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);
    if let Err(err) = run(cli) {
        eprintln!("ERROR: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> packet_drill::Result<()> {
    // Work out of the exercise directory; everything the engine writes
    // lands beside the definition.
    let path = Path::new(&cli.definition);
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::env::set_current_dir(dir).map_err(packet_drill::Error::Io)?;
    }
    let fname = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "exercise.def".to_owned());
    let def = Arc::new(definition::load(&fname)?);
    let stem = Path::new(&fname)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "exercise".to_owned());

    let mut st = State::new();
    // Wire the monitor before opening the log so it sees the full history.
    let shared = MonitorState::new(Arc::clone(&def));
    let (notify, _) = tokio::sync::watch::channel(0u64);
    let notify = Arc::new(notify);
    st.add_listener(MonitorListener::new(
        Arc::clone(&shared),
        Arc::clone(&notify),
    ));
    st.open(Path::new(&format!("{stem}.log")))?;

    let (manual_tx, manual_rx) = crossbeam::channel::unbounded();
    start_server(&def.exercise.listen_addr, shared, notify, manual_tx)
        .map_err(packet_drill::Error::Io)?;

    let last_entry = st.last_entry().0;
    let store = MessageStore::new(".");
    let mut engine = Engine::new(
        Arc::clone(&def),
        st,
        store,
        bbs::offline_connector(),
        Box::new(NoopSink),
    );
    // The BBS transport is provided by the embedding application; this
    // binary always runs the mailbox side offline.
    engine.set_offline(true);
    if !cli.offline {
        tracing::warn!("no BBS transport configured; mailbox session disabled");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown));

    let ticks = if cli.offline {
        crossbeam::channel::never()
    } else {
        start_ticker(def.exercise.op_start, last_entry)
    };
    engine.run(ticks, manual_rx, shutdown);
    tracing::info!("engine stopped");
    Ok(())
}
