use super::args::*;

pub mod align;
pub mod cache;
pub mod validate;

use crate::exit_codes::OK;

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Cache(args) => cache::run(args),
        Command::Align(args) => align::run_align(args),
        Command::Annotate(args) => align::run_annotate(args),
        Command::Validate(args) => validate::run(args),
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(OK)
        }
    }
}
