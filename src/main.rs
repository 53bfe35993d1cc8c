use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    pretty_env_logger::init();

    match asset_forge_lib::run().await {
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
        Ok(()) => ExitCode::SUCCESS,
    }
}
