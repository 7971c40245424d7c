use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use irrigation_common::{
    wrapping_clock_ms, ConfigBackend, ConfigPatch, ConfigStore, ControlCommand, ControlError,
    ControlFacade, ControlReply, ControlRequest, ControlResponse, ControllerConfig, ErrorBody,
    FileBackend, HardwareError, IrrigationSystem, MoistureSensor, Relay,
};

const REQUEST_QUEUE_DEPTH: usize = 16;
const DEFAULT_SIM_START_RAW: i32 = 900;
const SIM_DRY_STEP: i32 = 3;
const SIM_WET_STEP: i32 = 20;
const SIM_RAW_MAX: i32 = 4095;

type Envelope = (ControlRequest, oneshot::Sender<ControlReply>);
type HostSystem<B> = IrrigationSystem<B, SimulatedProbe, LoggingRelay>;

#[derive(Clone)]
struct AppState {
    control: mpsc::Sender<Envelope>,
}

/// Stand-in for the capacitive probe. Raw readings rise slowly as the soil
/// dries and fall while the valve is open.
#[derive(Debug)]
struct SimulatedProbe {
    raw: i32,
    valve_open: Arc<AtomicBool>,
}

impl SimulatedProbe {
    fn new(start_raw: i32, valve_open: Arc<AtomicBool>) -> Self {
        Self {
            raw: start_raw.clamp(0, SIM_RAW_MAX),
            valve_open,
        }
    }
}

impl MoistureSensor for SimulatedProbe {
    fn read_raw(&mut self) -> Result<i32, HardwareError> {
        let step = if self.valve_open.load(Ordering::Relaxed) {
            -SIM_WET_STEP
        } else {
            SIM_DRY_STEP
        };
        self.raw = (self.raw + step).clamp(0, SIM_RAW_MAX);
        Ok(self.raw)
    }
}

#[derive(Debug)]
struct LoggingRelay {
    energized: Arc<AtomicBool>,
}

impl LoggingRelay {
    fn new(energized: Arc<AtomicBool>) -> Self {
        energized.store(false, Ordering::Relaxed);
        Self { energized }
    }
}

impl Relay for LoggingRelay {
    fn set(&mut self, energized: bool) -> Result<(), HardwareError> {
        self.energized.store(energized, Ordering::Relaxed);
        info!(energized, "valve relay {}", if energized { "on" } else { "off" });
        Ok(())
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let timing = controller_config_from_env();
    let config_path = data_dir().join("config.json");
    let store = ConfigStore::load(FileBackend::new(&config_path));
    info!(
        "config store at {} (healthy: {})",
        config_path.display(),
        store.storage_healthy()
    );

    let valve_open = Arc::new(AtomicBool::new(false));
    let probe = SimulatedProbe::new(
        env_or("SIM_START_RAW", DEFAULT_SIM_START_RAW),
        valve_open.clone(),
    );
    let relay = LoggingRelay::new(valve_open);
    let system = IrrigationSystem::new(store, probe, relay, &timing);

    let (control, requests) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    spawn_control_loop(system, requests, timing.loop_idle_ms);

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = router(AppState { control }, web_root);

    let port = env_or("CONTROLLER_HTTP_PORT", 8080_u16);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!(
        "controller listening on http://{addr} (sample every {} ms, auto check every {} ms)",
        timing.sample_interval_ms, timing.auto_check_interval_ms
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("controller stopped");
    Ok(())
}

fn router(state: AppState, web_root: impl AsRef<Path>) -> Router {
    Router::new()
        .route("/api/sensors", get(handle_get_sensors))
        .route(
            "/api/config",
            get(handle_get_config)
                .put(handle_put_config)
                .post(handle_put_config),
        )
        .route("/api/control", post(handle_post_control))
        .fallback_service(ServeDir::new(web_root.as_ref()))
        .with_state(state)
}

/// The loop is the only owner of the system. Requests and timer work are
/// handled strictly one after another.
fn spawn_control_loop<B>(
    mut system: HostSystem<B>,
    mut requests: mpsc::Receiver<Envelope>,
    idle_ms: u32,
) -> JoinHandle<()>
where
    B: ConfigBackend + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(idle_ms.into()));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                envelope = requests.recv() => {
                    let Some((request, reply)) = envelope else {
                        info!("request channel closed; control loop exiting");
                        break;
                    };
                    let outcome = system.handle(request, monotonic_ms());
                    if reply.send(outcome).is_err() {
                        debug!("requester went away before the reply");
                    }
                }
                _ = interval.tick() => {
                    let outcome = system.service(monotonic_ms());
                    if outcome.sampled {
                        let snapshot = system.sensors();
                        debug!(
                            moisture = snapshot.moisture,
                            irrigation = snapshot.irrigation,
                            auto_mode = snapshot.auto_mode,
                            "sample taken"
                        );
                    }
                }
            }
        }
    })
}

async fn handle_get_sensors(State(state): State<AppState>) -> Response {
    dispatch(&state, ControlRequest::Sensors).await
}

async fn handle_get_config(State(state): State<AppState>) -> Response {
    dispatch(&state, ControlRequest::Config).await
}

async fn handle_put_config(State(state): State<AppState>, body: Bytes) -> Response {
    match ConfigPatch::from_json(&body) {
        Ok(patch) => dispatch(&state, ControlRequest::UpdateConfig(patch)).await,
        Err(reason) => control_error_response(&reason.into()),
    }
}

async fn handle_post_control(State(state): State<AppState>, body: Bytes) -> Response {
    match ControlCommand::from_json(&body) {
        Ok(command) => dispatch(&state, ControlRequest::Control(command)).await,
        Err(reason) => control_error_response(&reason.into()),
    }
}

async fn dispatch(state: &AppState, request: ControlRequest) -> Response {
    let (reply_tx, reply_rx) = oneshot::channel();
    if state.control.send((request, reply_tx)).await.is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "control loop is not running");
    }

    match reply_rx.await {
        Ok(Ok(ControlResponse::Sensors(snapshot))) => Json(snapshot).into_response(),
        Ok(Ok(ControlResponse::Config(config))) => Json(config).into_response(),
        Ok(Err(err)) => control_error_response(&err),
        Err(_) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "control loop dropped the request",
        ),
    }
}

fn control_error_response(err: &ControlError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!("request failed: {err}");
    } else {
        debug!("request rejected: {err}");
    }
    (status, Json(err.body())).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
            config: None,
        }),
    )
        .into_response()
}

fn controller_config_from_env() -> ControllerConfig {
    let defaults = ControllerConfig::default();
    let mut config = ControllerConfig {
        sample_interval_ms: env_or("SAMPLE_INTERVAL_MS", defaults.sample_interval_ms),
        auto_check_interval_ms: env_or("AUTO_CHECK_INTERVAL_MS", defaults.auto_check_interval_ms),
        ..defaults
    };
    config.sanitize();
    config
}

fn data_dir() -> PathBuf {
    std::env::var("IRRIGATION_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.irrigation"))
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn monotonic_ms() -> u32 {
    static START: OnceLock<Instant> = OnceLock::new();
    let elapsed = START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX);
    wrapping_clock_ms(elapsed)
}
