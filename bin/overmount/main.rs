mod handlers;

use std::process;

use clap::{error::ErrorKind, Parser};
use overmount::cli::OvermountArgs;
use tracing_subscriber::EnvFilter;

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = match OvermountArgs::try_parse() {
        Ok(args) => args,
        Err(error) => {
            let code = match error.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = error.print();
            process::exit(code);
        }
    };

    if let Err(error) = handlers::run(args) {
        eprintln!("Error: {}", error);
        process::exit(2);
    }
}
