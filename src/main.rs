use clap::Parser;

use llm_translate::{init_tracing, run, Cli};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let _ = dotenvy::dotenv();
    init_tracing();

    match run(Cli::parse()).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "translation failed");
            eprintln!("error: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}
