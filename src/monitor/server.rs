//! The monitor's web server: a websocket feed of grid updates and the
//! manual-trigger endpoint.
//!
//! Runs a small tokio runtime on its own thread. Websocket tasks read the
//! shared monitor state under a brief lock and never call back into the
//! engine; operator triggers flow to the engine thread over a channel.

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use chrono::Local;
use serde::Deserialize;
use tokio::sync::watch;

use crate::definition::EventType;
use crate::engine::ManualTrigger;

use super::MonitorState;

/// Bursts of updates within this window coalesce into one message.
const DEBOUNCE: Duration = Duration::from_millis(200);
/// Idle connections get a clock-only message this often.
const KEEP_ALIVE: Duration = Duration::from_secs(60);

struct ServerState {
    monitor: Arc<Mutex<MonitorState>>,
    notify: Arc<watch::Sender<u64>>,
    manual_tx: crossbeam::channel::Sender<ManualTrigger>,
}

/// Start the monitor server on its own thread. `listen_addr` defaults to
/// port 8000 on all interfaces when empty.
pub fn start_server(
    listen_addr: &str,
    monitor: Arc<Mutex<MonitorState>>,
    notify: Arc<watch::Sender<u64>>,
    manual_tx: crossbeam::channel::Sender<ManualTrigger>,
) -> std::io::Result<()> {
    let addr = normalize_addr(listen_addr);
    let listener = std::net::TcpListener::bind(&addr)?;
    listener.set_nonblocking(true)?;
    tracing::info!("monitor listening on http://{addr}/");
    let state = Arc::new(ServerState {
        monitor,
        notify,
        manual_tx,
    });
    std::thread::Builder::new()
        .name("monitor".into())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("build monitor runtime");
            rt.block_on(async move {
                let listener =
                    tokio::net::TcpListener::from_std(listener).expect("adopt monitor listener");
                let app = Router::new()
                    .route("/ws", get(serve_ws))
                    .route("/manualTrigger", post(serve_manual_trigger))
                    .with_state(state);
                if let Err(err) = axum::serve(listener, app).await {
                    tracing::error!("monitor server failed: {err}");
                }
            });
        })?;
    Ok(())
}

fn normalize_addr(addr: &str) -> String {
    match addr {
        "" => "0.0.0.0:8000".to_owned(),
        a if a.starts_with(':') => format!("0.0.0.0{a}"),
        a => a.to_owned(),
    }
}

async fn serve_ws(State(state): State<Arc<ServerState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| follow_events(socket, state))
}

/// Send grid updates to one dashboard client until its socket fails.
async fn follow_events(mut socket: WebSocket, state: Arc<ServerState>) {
    let conn_id = state.monitor.lock().unwrap().register_conn();
    let mut versions = state.notify.subscribe();
    versions.mark_unchanged();
    let initial = {
        let m = state.monitor.lock().unwrap();
        m.render_initial(clock())
    };
    if send_update(&mut socket, &initial).await.is_err() {
        state.monitor.lock().unwrap().drop_conn(conn_id);
        return;
    }
    loop {
        tokio::select! {
            changed = versions.changed() => {
                if changed.is_err() {
                    break; // engine gone
                }
                // Let a burst of changes accumulate before rendering.
                tokio::time::sleep(DEBOUNCE).await;
                versions.mark_unchanged();
                let update = {
                    let mut m = state.monitor.lock().unwrap();
                    let dirty = m.take_dirty(conn_id);
                    if dirty.is_empty() {
                        continue;
                    }
                    m.render_update(&dirty, clock())
                };
                if send_update(&mut socket, &update).await.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(KEEP_ALIVE) => {
                let update = {
                    let m = state.monitor.lock().unwrap();
                    m.render_update(&[], clock())
                };
                if send_update(&mut socket, &update).await.is_err() {
                    break;
                }
            }
        }
    }
    state.monitor.lock().unwrap().drop_conn(conn_id);
}

async fn send_update(
    socket: &mut WebSocket,
    update: &super::Update,
) -> Result<(), axum::Error> {
    let buf = serde_json::to_string(update).unwrap_or_else(|_| "{}".to_owned());
    socket.send(Message::Text(buf.into())).await
}

fn clock() -> String {
    Local::now().format("%H:%M").to_string()
}

#[derive(Deserialize)]
struct ManualTriggerForm {
    #[serde(rename = "type")]
    etype: String,
    #[serde(default)]
    station: String,
    #[serde(default)]
    name: String,
}

/// `POST /manualTrigger`: queue an operator trigger for the engine.
async fn serve_manual_trigger(
    State(state): State<Arc<ServerState>>,
    Form(form): Form<ManualTriggerForm>,
) -> StatusCode {
    let Ok(etype) = EventType::from_str(&form.etype) else {
        return StatusCode::BAD_REQUEST;
    };
    let trigger = ManualTrigger {
        etype,
        station: form.station,
        name: form.name,
    };
    if state.manual_tx.send(trigger).is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::NO_CONTENT
}
