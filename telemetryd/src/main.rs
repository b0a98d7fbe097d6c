use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::time::timeout;

use telemetryd::{AppContext, Config, WorkerManager};

#[derive(Parser, Debug)]
#[command(name = "telemetryd")]
#[command(about = "Real-time telemetry ingestion, transformation and visualization daemon")]
struct Args {
    /// Path to config file. Overridden by TELEMETRYD_CONFIG if set.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Bootstrap script for a worker thread. Repeatable: one worker is
    /// spawned per occurrence.
    #[arg(long = "script", value_name = "PATH")]
    scripts: Vec<PathBuf>,
    /// Bootstrap script for the UI-thread runtime (on_frame/on_alert).
    #[arg(long, value_name = "PATH")]
    ui_script: Option<PathBuf>,
    /// Skip the HTTP status server.
    #[arg(long)]
    headless: bool,
    /// Overrides the configured worker join timeout, in milliseconds.
    #[arg(long)]
    join_timeout_ms: Option<u64>,
}

struct AppState {
    manager: Arc<tokio::sync::Mutex<WorkerManager>>,
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let manager = state.manager.lock().await;
    manager.context().metrics.render_text()
}

/// Waits for Ctrl+C or, on unix, SIGTERM, flipping the app-running flag
/// exactly once either way (§10.1).
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            error!("[telemetryd] failed to install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    if let Some(path) = &args.config {
        // SAFETY: single-threaded at this point in startup, before any
        // worker or the tokio runtime's own worker threads read env vars.
        unsafe {
            std::env::set_var("TELEMETRYD_CONFIG", path);
        }
    }
    let mut config = Config::load();
    if let Some(ms) = args.join_timeout_ms {
        config.scheduler.join_timeout_ms = ms;
    }

    info!("[telemetryd] starting with {} worker script(s)", args.scripts.len());

    let ctx = AppContext::new(&config);
    let mut manager = WorkerManager::new(ctx, &config);

    let mut startup_failed = false;
    for path in &args.scripts {
        match std::fs::read_to_string(path) {
            Ok(source) => match manager.spawn_worker(source) {
                Ok(id) => info!("[telemetryd] worker {id} started from {}", path.display()),
                Err(err) => {
                    warn!("[telemetryd] worker script {} failed to start: {err}; continuing with remaining workers", path.display());
                }
            },
            Err(err) => {
                error!("[telemetryd] failed to read worker script {}: {err}", path.display());
                startup_failed = true;
            }
        }
    }

    if let Some(path) = &args.ui_script {
        match std::fs::read_to_string(path) {
            Ok(source) => {
                if let Err(err) = manager.start_ui_runtime(&source) {
                    error!("[telemetryd] UI runtime script {} failed to start: {err}", path.display());
                    startup_failed = true;
                }
            }
            Err(err) => {
                error!("[telemetryd] failed to read UI runtime script {}: {err}", path.display());
                startup_failed = true;
            }
        }
    }

    if startup_failed && manager.worker_count() == 0 {
        error!("[telemetryd] no workers started; aborting");
        return ExitCode::FAILURE;
    }

    let join_timeout = Duration::from_millis(config.scheduler.join_timeout_ms);
    let manager = Arc::new(tokio::sync::Mutex::new(manager));

    if config.http.enabled && !args.headless {
        let state = Arc::new(AppState { manager: manager.clone() });
        let app = Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics_text))
            .with_state(state);

        match TcpListener::bind(&config.http.bind).await {
            Ok(listener) => {
                info!("[telemetryd] HTTP status server on http://{}", config.http.bind);
                tokio::spawn(async move {
                    if let Err(err) = axum::serve(listener, app).await {
                        error!("[telemetryd] HTTP server error: {err}");
                    }
                });
            }
            Err(err) => {
                warn!("[telemetryd] failed to bind HTTP status server on {}: {err}", config.http.bind);
            }
        }
    }

    let frame_loop = {
        let manager = manager.clone();
        tokio::task::spawn_blocking(move || {
            let mut last = Instant::now();
            loop {
                let running = {
                    let mgr = manager.blocking_lock();
                    mgr.context().app_running.load(Ordering::Acquire)
                };
                if !running {
                    return;
                }
                let now = Instant::now();
                let dt = now.duration_since(last).as_secs_f64();
                last = now;
                {
                    let mut mgr = manager.blocking_lock();
                    mgr.tick(dt);
                }
                std::thread::sleep(Duration::from_millis(16));
            }
        })
    };

    info!("[telemetryd] running. press Ctrl+C to exit.");
    wait_for_shutdown_signal().await;
    info!("[telemetryd] shutdown requested");

    {
        let mgr = manager.lock().await;
        mgr.context().app_running.store(false, Ordering::Release);
    }

    if timeout(Duration::from_secs(1), frame_loop).await.is_err() {
        warn!("[telemetryd] frame loop did not stop promptly; proceeding with shutdown anyway");
    }

    {
        let mut mgr = manager.lock().await;
        mgr.shutdown();
    }

    let timed_out = {
        let mgr = manager.lock().await;
        mgr.context().metrics.worker_join_timeouts_total() > 0
    };
    if timed_out {
        warn!("[telemetryd] one or more workers exceeded the join timeout of {join_timeout:?}; exit code is unaffected");
    }

    info!("[telemetryd] shutdown complete");
    ExitCode::SUCCESS
}
