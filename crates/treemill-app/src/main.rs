#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Binary entrypoint: parse arguments, run the batch, exit with its status.

use std::process;

use clap::Parser;
use treemill_app::{Cli, run_app};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match run_app(cli).await {
        Ok(outcome) => outcome.exit_code(),
        Err(err) => {
            eprintln!("error: {}", err.display_message());
            err.exit_code()
        }
    };
    if exit_code != 0 {
        process::exit(exit_code);
    }
}
