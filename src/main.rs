use proc_supervisor::logger::logs_tracing;
use proc_supervisor::parse::{parser, DEFAULT_CONFIG_PATH};
use proc_supervisor::runtime::Supervisor;
use proc_supervisor::shell::run_shell;
use tracing::{error, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let cfg = parser(&path)?;
    let guard = logs_tracing(&cfg.logging)?;

    let supervisor = Supervisor::new(cfg.specs(), cfg.max_restarts);
    let done = supervisor.start_all().await?;

    if cfg.shell {
        if let Err(e) = run_shell(&supervisor).await {
            error!(error = %e, "control shell failed");
        }
        supervisor.stop_all().await;
    }

    if done.await.is_err() {
        warn!("coordinator ended without signalling completion");
    }

    println!(
        "completed: {}  crashed: {}  exhausted: {}",
        supervisor.success_count().await,
        supervisor.crash_count().await,
        supervisor.exhausted_count().await
    );
    for (program, text) in supervisor.read_stdout().await {
        println!("--- {} (stdout) ---\n{}", program, text);
    }
    for (program, text) in supervisor.read_stderr().await {
        println!("--- {} (stderr) ---\n{}", program, text);
    }

    if supervisor.was_interrupted() {
        // flush buffered log lines before leaving with the signal status
        drop(guard);
        std::process::exit(1);
    }

    Ok(())
}
