use std::fmt::Debug;
use std::fmt::Display;

use docflow::configuration::get_configuration;
use docflow::parsing;
use docflow::publishing;
use docflow::startup::Application;
use docflow::telemetry::get_subscriber;
use docflow::telemetry::init_subscriber;
use tokio::task::JoinError;

fn report_exit(
    name: &str,
    outcome: Result<Result<(), impl Debug + Display>, JoinError>,
) {
    match outcome {
        Ok(Ok(())) => {
            tracing::info!("{name} exited gracefully")
        }
        Ok(Err(e)) => {
            tracing::error!(
                error.cause_chain = ?e,
                error.message = %e,
                "{name} failed"
            )
        }
        Err(e) => {
            tracing::error!(
                error.cause_chain = ?e,
                error.message = %e,
                "{name} task panicked or was cancelled"
            )
        }
    }
}

/// One process running all three roles: the API plus both lease loops. The
/// standalone `inbox-worker` and `outbox-publisher` binaries exist for
/// horizontally-scaled deployments.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let subscriber = get_subscriber("docflow", "info", std::io::stdout);
    init_subscriber(subscriber);

    let cfg = get_configuration()?;
    parsing::preflight(&cfg)?;
    publishing::preflight(&cfg)?;

    let server = Application::build(cfg.clone()).await?.run_until_stopped();
    let parse_worker = parsing::run_until_stopped(cfg.clone(), true);
    let publish_worker = publishing::run_until_stopped(cfg, true);

    let server_task = tokio::spawn(server);
    let parse_task = tokio::spawn(parse_worker);
    let publish_task = tokio::spawn(publish_worker);

    // first exit wins; the remaining branches are cancelled with the process
    tokio::select! {
        o = server_task => report_exit("API", o),
        o = parse_task => report_exit("inbox worker", o),
        o = publish_task => report_exit("outbox publisher", o),
    }

    Ok(())
}
