use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Form, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    sync::Mutex,
};
use tower_http::services::ServeDir;
use tracing::{info, warn};

use outlet_common::{persist, Outlet, RuntimeConfig, Schedule};

use crate::{
    console::{self, Effect},
    device::Device,
};

#[derive(Clone)]
struct AppState {
    device: Arc<Mutex<Device>>,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    schedule_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct CommandReply {
    reply: String,
}

/// Stand-in for the relay when running on a workstation.
#[derive(Debug, Default)]
struct SimulatedRelay {
    closed: bool,
}

impl Outlet for SimulatedRelay {
    fn set_outlet(&mut self, on: bool) {
        if self.closed != on {
            info!("relay {}", if on { "closed" } else { "opened" });
        }
        self.closed = on;
    }

    fn is_outlet_on(&self) -> bool {
        self.closed
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let schedule = store.load_schedule().await.unwrap_or_else(|err| {
        warn!("failed to load schedule from store: {err:#}");
        Schedule::default()
    });

    let mut device = Device::new(runtime, schedule, Box::new(SimulatedRelay::default()));
    // The host clock is assumed to be disciplined by the OS.
    device.set_time_synced(true);

    let app_state = AppState {
        device: Arc::new(Mutex::new(device)),
        store,
    };

    spawn_control_loop(app_state.clone());
    spawn_console(app_state.clone());

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/outlet", post(handle_set_outlet))
        .route("/api/outlet/toggle", post(handle_toggle_outlet))
        .route("/api/schedule", get(handle_get_schedule))
        .route("/schedule", post(handle_post_schedule))
        .route("/api/cmd", post(handle_command))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state);

    let port = std::env::var("OUTLET_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind outlet server at {addr}"))?;

    info!("outlet listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_control_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));

        loop {
            interval.tick().await;

            let mut device = app_state.device.lock().await;
            let now = device.now();
            device.tick(now);
        }
    });
}

fn spawn_console(app_state: AppState) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("console input closed");
                    return;
                }
                Err(err) => {
                    warn!("console read failed: {err}");
                    return;
                }
            };

            let reply = {
                let mut device = app_state.device.lock().await;
                console::dispatch(&line, &mut device)
            };
            if !reply.text.is_empty() {
                println!("{}", reply.text);
            }
            if reply.effect == Effect::Save {
                match persist_all(&app_state).await {
                    Ok(()) => println!("Configuration saved."),
                    Err(err) => {
                        warn!("failed to save configuration: {err:#}");
                        println!("Saving failed: {err:#}");
                    }
                }
            }
        }
    });
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let device = state.device.lock().await;
    Json(device.status(device.now()))
}

async fn handle_set_outlet(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let on = match params.get("value").map(|value| value.to_ascii_lowercase()) {
        Some(value) if value == "on" => true,
        Some(value) if value == "off" => false,
        Some(_) => {
            return error_response(StatusCode::BAD_REQUEST, "Invalid value. Use 'on' or 'off'")
        }
        None => return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter"),
    };

    state.device.lock().await.set_outlet(on);
    handle_get_status(State(state)).await.into_response()
}

async fn handle_toggle_outlet(State(state): State<AppState>) -> impl IntoResponse {
    state.device.lock().await.toggle();
    handle_get_status(State(state)).await.into_response()
}

async fn handle_get_schedule(State(state): State<AppState>) -> impl IntoResponse {
    let schedule = state.device.lock().await.schedule().clone();
    Json(schedule)
}

async fn handle_post_schedule(
    State(state): State<AppState>,
    Form(form): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    let result = state.device.lock().await.apply_form(&form);
    if let Err(err) = result {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }

    if let Err(err) = persist_schedule(&state).await {
        warn!("failed to persist schedule update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist schedule",
        );
    }

    handle_get_schedule(State(state)).await.into_response()
}

async fn handle_command(
    State(state): State<AppState>,
    Form(params): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(line) = params.get("cmd") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'cmd' field");
    };

    let reply = {
        let mut device = state.device.lock().await;
        console::dispatch(line, &mut device)
    };

    let mut text = reply.text;
    if reply.effect == Effect::Save {
        if let Err(err) = persist_all(&state).await {
            warn!("failed to save configuration: {err:#}");
            text.push_str("\nSaving failed.");
        }
    }

    Json(CommandReply { reply: text }).into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("OUTLET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.outlet"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            schedule_path: Arc::new(data_dir.join("schedule.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let payload = serde_json::to_vec_pretty(runtime)?;
        write_file(self.runtime_path.as_ref(), &payload).await
    }

    async fn load_schedule(&self) -> anyhow::Result<Schedule> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.schedule_path.as_ref()).await {
            Ok(raw) => Ok(persist::load_or_default(Some(&raw))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Schedule::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_schedule(&self, blob: &[u8]) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        write_file(self.schedule_path.as_ref(), blob).await
    }
}

async fn write_file(path: &Path, payload: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, payload)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}

async fn persist_schedule(state: &AppState) -> anyhow::Result<()> {
    let blob = state.device.lock().await.schedule_blob()?;
    state.store.save_schedule(&blob).await
}

async fn persist_all(state: &AppState) -> anyhow::Result<()> {
    let (blob, runtime) = {
        let device = state.device.lock().await;
        (device.schedule_blob()?, device.runtime().clone())
    };
    state.store.save_schedule(&blob).await?;
    state.store.save_runtime_config(&runtime).await
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
