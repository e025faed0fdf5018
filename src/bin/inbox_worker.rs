use clap::Parser;
use clap::Subcommand;
use docflow::configuration::get_configuration;
use docflow::parsing;
use docflow::telemetry::get_subscriber;
use docflow::telemetry::init_subscriber;

/// Lease and parse validated inbox documents.
#[derive(Parser)]
#[command(name = "inbox-worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the lease loop until stopped.
    Run {
        /// Exit 0 after the first idle batch instead of sleeping (timer mode).
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() {
    let subscriber = get_subscriber("inbox-worker", "info", std::io::stdout);
    init_subscriber(subscriber);

    let Command::Run { once } = Cli::parse().command;

    let cfg = match get_configuration() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error.message = %e, "configuration failed to load");
            std::process::exit(1);
        }
    };
    if let Err(e) = parsing::preflight(&cfg) {
        tracing::error!(error.message = %e, "fatal configuration error");
        std::process::exit(1);
    }

    match parsing::run_until_stopped(cfg, !once).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(error.cause_chain = ?e, "worker failed");
            std::process::exit(1);
        }
    }
}
