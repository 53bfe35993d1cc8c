pub mod bundle;
pub mod catalog;
pub mod commands;
pub mod error;
pub mod inference;
pub mod models;
pub mod prompt;
pub mod storage;
pub mod store;
pub mod studio;

use clap::Parser;

use commands::Cli;
use error::AppResult;

pub async fn run() -> AppResult<()> {
    load_env_files();
    let cli = Cli::parse();
    commands::execute(cli).await
}

fn load_env_files() {
    let _ = dotenvy::from_filename(".env");
    let _ = dotenvy::from_filename("../.env");
}
