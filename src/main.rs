use std::process::ExitCode;

mod app;
mod circuit_breaker;
mod classifier;
mod cli;
mod config;
mod countdown;
mod executor;
mod ledger;
mod logger;
mod rate_limit;
mod reset_time;
mod run_loop;
mod shell;
mod status;


fn main() -> ExitCode {
    app::main()
}
