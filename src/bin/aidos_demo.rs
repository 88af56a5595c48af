//! AIDOS demo — a smoke-test harness for the orchestration engine.
//!
//! Spawns a mock session end to end (decompose an objective, schedule and
//! execute its task graph) and prints the event stream as it happens. This
//! is not the CLI/TUI surface described in the design's external
//! interfaces — that's an external collaborator's responsibility. It
//! exists only so the library can be exercised outside of its test suite.

use std::time::Duration;

use aidos_core::config::AidosConfig;
use aidos_core::events::{AidosEvent, EventBus};
use aidos_core::logging;
use aidos_core::orchestrator::{Orchestrator, SessionOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AidosConfig::load(&std::env::current_dir()?).unwrap_or_default();
    let _log_guard = logging::init(&config.log)?;

    let objective = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Webアプリのログイン機能を作成する".to_string());

    tracing::info!(%objective, "aidos-demo starting");

    let events: EventBus<AidosEvent> = EventBus::new();
    let mut rx = events.subscribe();

    let printer = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            println!("{}", describe(&event));
        }
    });

    let options = SessionOptions {
        max_concurrent_agents: config.agents.max_concurrent,
        ..SessionOptions::default()
    };
    let mut orchestrator = Orchestrator::new(events, options);
    orchestrator.start_session(&objective).await?;

    // Give the printer a moment to drain the broadcast channel before the
    // process exits; the orchestrator itself has already reached a
    // terminal phase by the time `start_session` returns.
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();

    println!();
    println!("phase:   {:?}", orchestrator.phase());
    if let Some(session) = orchestrator.session() {
        println!("session: {} ({:?})", session.id, session.status);
    }
    for task in orchestrator.tasks() {
        println!(
            "  [{:?}] {} — {:?} ({}%)",
            task.status, task.task.id, task.task.category, task.progress
        );
    }

    Ok(())
}

fn describe(event: &AidosEvent) -> String {
    format!("{:?}", event)
}
