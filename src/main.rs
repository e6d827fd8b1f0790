//! Binary entry point. All startup sequencing lives in [`originserve::run`]; this just sizes and
//! starts the `tokio` runtime first.
//!
//! The `threads` configuration key (spec §6) sizes the thread-pool, which `#[tokio::main]` can't
//! do — its worker count is fixed at compile time. So the runtime is built by hand instead,
//! reading just that one key synchronously off the configuration file before any async machinery
//! exists to do it the normal way; `originserve::run` re-reads the full configuration (and reports
//! any error in it) once the runtime is up.

use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let threads = originserve::peek_thread_count(args.first().map(String::as_str));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads.max(1))
        .enable_all()
        .build()
        .expect("failed to start the Tokio runtime");

    runtime.block_on(originserve::run())
}
