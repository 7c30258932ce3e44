pub mod cli;
#[cfg(feature = "desktop")]
pub mod desktop;
pub mod plugins;
pub mod services;

use clap::Parser;

/// `RUST_LOG` overrides the default `info` filter. Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}

/// Terminal entry point. Returns the process exit code.
pub fn run() -> i32 {
    init_logging();
    let cli = cli::Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("Failed to start async runtime: {}", err);
            return 1;
        }
    };

    let code = match runtime.block_on(cli::run(cli)) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{err}");
            1
        }
    };
    // A REPL left by Ctrl-C still has a blocking stdin read in flight.
    runtime.shutdown_background();
    code
}
