use citesyncd::config::DaemonConfig;
use citesyncd::runtime::{DaemonRuntime, QueueStatus};
use citesyncd::sync::engine::DrainReport;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Status,
    Sync,
    RetryFailed,
    Clear,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Status;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "status" => mode = CliMode::Status,
            "sync" => mode = CliMode::Sync,
            "retry-failed" => mode = CliMode::RetryFailed,
            "clear" => mode = CliMode::Clear,
            "--help" | "-h" | "help" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_status(status: &QueueStatus, ceiling: u32) {
    let state = &status.state;
    println!("online:     {}", state.is_online);
    println!("pending:    {}", state.pending_count);
    println!("parked:     {}", status.parked(ceiling));
    for item in &status.items {
        println!(
            "  {} {} {} {} retries={}{}",
            item.id,
            item.mutation_type,
            item.entity_kind,
            item.entity_id,
            item.retry_count,
            item.last_error
                .as_deref()
                .map(|err| format!(" last_error={err}"))
                .unwrap_or_default()
        );
    }
}

fn print_report(report: &DrainReport) {
    if let Some(reason) = report.skipped {
        println!("drain skipped: {reason:?}");
        return;
    }
    println!(
        "synced={} failed={} deferred={}",
        report.synced, report.failed, report.deferred
    );
    for failure in &report.errors {
        println!(
            "  {} {} {} {}: {}{}",
            failure.item_id,
            failure.mutation_type,
            failure.entity_kind,
            failure.entity_id,
            failure.error,
            if failure.permanent { " (permanent)" } else { "" }
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: citesyncd [status|sync|retry-failed|clear]");
        println!("  status        Show queued mutations (default)");
        println!("  sync          Drain the queue once");
        println!("  retry-failed  Reset parked mutations and drain");
        println!("  clear         Drop every queued mutation");
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    let ceiling = config.engine.retry_ceiling;
    let runtime = DaemonRuntime::bootstrap(config).await?;
    let result = match mode {
        CliMode::Status => runtime
            .status()
            .await
            .map(|status| print_status(&status, ceiling)),
        CliMode::Sync => runtime.sync().await.map(|report| print_report(&report)),
        CliMode::RetryFailed => runtime
            .retry_failed()
            .await
            .map(|report| print_report(&report)),
        CliMode::Clear => runtime
            .clear()
            .await
            .map(|removed| println!("removed {removed} queued mutations")),
        CliMode::Help => Ok(()),
    };
    runtime.shutdown().await;
    result
}
