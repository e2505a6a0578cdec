use std::process::ExitCode;

use crossterm::style::Stylize;
use tidewatch::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    // Optional; a missing .env is not an error.
    dotenvy::dotenv().ok();
    let cli = Cli::parse_args();

    match tidewatch::app::run(cli).await {
        Ok(code) => ExitCode::from((code & 0xff) as u8),
        Err(err) => {
            eprintln!("{} {err}", "error:".red().bold());
            eprintln!("  {} {}", "hint:".yellow(), err.hint());
            ExitCode::FAILURE
        }
    }
}
