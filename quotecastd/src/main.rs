use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = quotecastd::Cli::parse();
    if let Err(err) = quotecastd::run(cli).await {
        tracing::error!(error = %err, "terminated by an unrecoverable error");
        eprintln!("quotecastd: {err}");
        // Failure is signalled through logs and alerts; the supervisor
        // restarts the process regardless of the exit code.
        std::process::exit(0);
    }
}
