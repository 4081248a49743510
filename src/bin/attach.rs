use std::env;
use std::process::ExitCode;

use attach_dl::cli::{self, Command};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match cli::parse_args(env::args().skip(1)) {
        Ok(Command::Run(args)) => args,
        Ok(Command::Help) => {
            cli::print_usage();
            return ExitCode::SUCCESS;
        }
        Err(message) => {
            eprintln!("Error: {message}");
            eprintln!();
            cli::print_usage();
            return ExitCode::from(2);
        }
    };

    match cli::run(args).await {
        Ok(Some(report)) if !report.is_clean() => ExitCode::FAILURE,
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}
