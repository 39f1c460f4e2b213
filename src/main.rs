use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use work_engine::task::{NewTask, Priority};
use work_engine::{EngineConfig, WorkEngine};

/// One entry of the tasks file. `depends_on` holds indexes of earlier entries.
#[derive(Debug, Deserialize)]
struct TaskSpec {
    name: String,
    #[serde(default)]
    description: String,
    action: String,
    #[serde(default)]
    parameters: Map<String, Value>,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    depends_on: Vec<usize>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    context: Map<String, Value>,
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match std::env::var("WORK_ENGINE_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "work-engine.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(false))
                .with(fmt::layer().with_target(false).with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}

async fn submit_file(engine: &WorkEngine, path: &Path) -> anyhow::Result<Vec<Uuid>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let specs: Vec<TaskSpec> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;

    let mut ids: Vec<Uuid> = Vec::with_capacity(specs.len());
    for (index, spec) in specs.into_iter().enumerate() {
        let mut new = NewTask::new(spec.name, spec.action)
            .with_description(spec.description)
            .with_parameters(spec.parameters)
            .with_priority(spec.priority)
            .with_context(spec.context);
        if let Some(max_retries) = spec.max_retries {
            new = new.with_max_retries(max_retries);
        }
        for dep in spec.depends_on {
            let dep_id = ids.get(dep).copied().with_context(|| {
                format!("task #{index} depends on #{dep}, which is not an earlier entry")
            })?;
            new = new.depends_on(dep_id);
        }
        ids.push(engine.submit(new).await?);
    }
    Ok(ids)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = EngineConfig::from_env().context("invalid WORK_ENGINE_* configuration")?;

    eprintln!("⚙️  Work Engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Workers: {}", config.max_workers);
    eprintln!("   Press Ctrl-C to stop.\n");

    let engine = WorkEngine::open(config)
        .await
        .context("failed to open work engine")?;

    let mut events = engine.events();
    let event_log = tokio::spawn(async move {
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => info!(
                    task_id = %event.task_id,
                    event = ?event.event_type,
                    payload = %event.payload,
                    "Task event"
                ),
                Err(e) => warn!(error = %e, "Event stream lagged"),
            }
        }
    });

    let report = engine.start().await?;
    info!(?report, "Recovery finished");

    if let Some(path) = std::env::args().nth(1) {
        let ids = submit_file(&engine, Path::new(&path)).await?;
        info!(count = ids.len(), file = %path, "Submitted tasks");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received"),
        _ = engine.stopped() => warn!("Engine stopped after a store failure"),
    }

    engine.shutdown().await;
    event_log.abort();
    Ok(())
}
