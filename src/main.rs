use std::process::ExitCode;
use std::sync::Arc;

mod cli;
mod config;
mod docker;
mod events;
mod git;
mod http;
mod reconcile;
mod refresh;
mod render;
mod signals;
mod state;

use config::{LogFormat, LogLevel};
use events::EventType;
use state::{Broadcaster, Store};

#[tokio::main]
async fn main() -> ExitCode {
    let cfg = match config::Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            for error in &e.errors {
                eprintln!("config error: {error}");
            }
            return ExitCode::FAILURE;
        }
    };

    init_logger(cfg.log_level, cfg.log_format);
    log::info!("docker-cd starting with PID {}", std::process::id());

    // The shutdown token reaches every long-running call; signalling it
    // kills subprocesses and aborts in-flight git transfers.
    let (shutdown_tx, shutdown) = signals::Shutdown::channel();
    tokio::spawn(signals::handle_termination(shutdown_tx));

    // Read-only check that the repository is reachable and the revision
    // exists, bounded by the validation timeout.
    let ref_type = match git::validate_repository(
        &shutdown,
        &cfg.git_repo_url,
        &cfg.git_access_token,
        &cfg.git_revision,
    )
    .await
    {
        Ok(ref_type) => ref_type,
        Err(e) => {
            log::error!("repository validation failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    log::info!(
        "repository validated: {} ({} {})",
        cfg.git_repo_url,
        ref_type.as_str(),
        cfg.git_revision
    );

    if cli::get_cli_args().test {
        eprintln!("docker-cd config is ok.");
        return ExitCode::SUCCESS;
    }

    let runner: Arc<dyn docker::CommandRunner> = Arc::new(docker::ExecRunner);
    let store = Arc::new(Store::new());
    let broadcaster = Arc::new(Broadcaster::new());
    let event_bus = Arc::new(events::EventBus::new());
    setup_event_handlers(&event_bus, &broadcaster, &store);

    let queue = Arc::new(refresh::TriggerQueue::new());
    let reader = Arc::new(git::GitComposeReader);

    let compose: Arc<dyn reconcile::ComposeRunner> = Arc::new(reconcile::DockerComposeRunner::new(
        Arc::clone(&runner),
        &cfg.docker_socket,
    ));
    let inspector = Arc::new(reconcile::DockerContainerInspector::new(docker::Client::new(
        Arc::clone(&runner),
        &cfg.docker_socket,
    )));
    let acks = Arc::new(reconcile::AckStore::new());
    let state_manager = Arc::new(reconcile::StateManager::new(
        Arc::clone(&store),
        Arc::clone(&compose),
        Arc::clone(&event_bus),
    ));

    let policy = reconcile::ReconciliationPolicy {
        enabled: cfg.reconcile_enabled,
        remove_enabled: cfg.reconcile_remove_enabled,
        drift_policy: cfg.drift_policy,
    };
    log::info!(
        "reconcile policy: enabled={} remove_enabled={} drift_policy={}",
        policy.enabled,
        policy.remove_enabled,
        policy.drift_policy.as_str()
    );
    let reconciler = Arc::new(reconcile::Reconciler::new(
        Arc::clone(&store),
        policy,
        compose,
        inspector,
        Arc::clone(&acks),
        state_manager,
        Arc::clone(&event_bus),
        "",
    ));

    let mut refresh_svc = refresh::Service::new(
        cfg.clone(),
        Arc::clone(&store),
        Arc::clone(&queue),
        reader,
    );
    refresh_svc.set_reconcile_hook(Arc::clone(&reconciler) as Arc<dyn refresh::ReconcileHook>);
    refresh_svc.set_broadcaster(Arc::clone(&broadcaster));
    let refresh_svc = Arc::new(refresh_svc);

    tokio::spawn(Arc::clone(&refresh_svc).start(shutdown.clone()));

    let app_state = Arc::new(http::AppState {
        config: cfg.clone(),
        store,
        refresh: refresh_svc,
        reconciler,
        acks,
        broadcaster,
        docker: docker::Client::new(runner, &cfg.docker_socket),
        shutdown: shutdown.clone(),
    });
    let app = http::router(Arc::clone(&app_state));

    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("failed to bind {addr}: {e}");
            return ExitCode::FAILURE;
        }
    };
    log::info!("http server listening on {addr}");

    let server_shutdown = shutdown.clone();
    let shutdown_broadcaster = Arc::clone(&app_state.broadcaster);
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        server_shutdown.cancelled().await;
        log::info!("shutdown signal received, stopping gracefully");
        // Terminate open SSE streams so graceful shutdown can complete.
        shutdown_broadcaster.close_all();
    });
    if let Err(e) = serve.await {
        log::error!("server error: {e}");
        return ExitCode::FAILURE;
    }

    log::info!("shutdown complete");
    ExitCode::SUCCESS
}

fn init_logger(level: LogLevel, format: LogFormat) {
    let filter = match level {
        LogLevel::Debug => log::LevelFilter::Debug,
        LogLevel::Info => log::LevelFilter::Info,
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(filter);

    if format == LogFormat::Json {
        builder.format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{}",
                serde_json::json!({
                    "ts": chrono::Utc::now()
                        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                    "level": record.level().to_string().to_lowercase(),
                    "target": record.target(),
                    "msg": record.args().to_string(),
                })
            )
        });
    }

    builder.init();
}

/// Wires the domain events onto the SSE broadcaster. Handlers read the
/// affected record from the store and forward it; they never block.
fn setup_event_handlers(
    event_bus: &events::EventBus,
    broadcaster: &Arc<Broadcaster>,
    store: &Arc<Store>,
) {
    for event_type in [
        EventType::StackStatusChanged,
        EventType::StackSynced,
        EventType::ContainersUpdated,
        EventType::DriftDetected,
    ] {
        let broadcaster = Arc::clone(broadcaster);
        let store = Arc::clone(store);
        event_bus.subscribe(event_type, move |event| {
            let path = event.stack_path();
            if let Some(record) = store.get_stacks().into_iter().find(|s| s.path == path) {
                broadcaster.publish_stack_upsert(&record);
            }
            Ok(())
        });
    }

    let broadcaster = Arc::clone(broadcaster);
    event_bus.subscribe(EventType::StackRemoved, move |event| {
        broadcaster.publish_stack_delete(event.stack_path());
        Ok(())
    });
}
