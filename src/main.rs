use std::process::ExitCode;

use qircard::start_server;

#[tokio::main]
async fn main() -> ExitCode {
    match start_server().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("qircard: {e}");
            ExitCode::FAILURE
        }
    }
}
