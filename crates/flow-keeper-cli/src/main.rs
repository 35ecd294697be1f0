use flow_keeper_cli::run_cli;
use tracing::error;

#[tokio::main]
async fn main() {
    if let Err(e) = run_cli().await {
        error!("CLI error: {}", e);
        // Logging may not be initialized yet when configuration fails.
        eprintln!("flow-keeper: {e}");
        std::process::exit(e.exit_code());
    }
}
