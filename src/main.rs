#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]

mod cmd;
mod config;
mod transfer;

use std::process::ExitCode;

use env_logger::{Builder, Env};

fn main() -> ExitCode {
    // Warnings only, unless BLOCKBUF_LOG asks for more.
    Builder::from_env(Env::new().filter_or("BLOCKBUF_LOG", "warn"))
        .format_timestamp(None)
        .format_target(false)
        .init();

    cmd::run().unwrap_or_else(|e| {
        eprintln!("blockbuf: {e:#}");
        ExitCode::FAILURE
    })
}
