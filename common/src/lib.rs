//! Shared building blocks of `scpw`: local tree walking and metadata, download replacement,
//! progress reporting, configuration, and the runtime/logging bootstrap used by the binary.

pub mod config;
pub mod meta;
pub mod progress;
pub mod replace;
pub mod walk;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig};

fn init_logging(output: &OutputConfig) -> anyhow::Result<()> {
    if output.quiet {
        return Ok(());
    }
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize logging: {error}"))
}

fn build_runtime(runtime: &RuntimeConfig) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    builder.build()
}

/// Sets up logging and a tokio runtime, then runs `func` to completion.
///
/// Returns `None` if setup failed or `func` returned an error (which is logged); the summary is
/// printed when requested by `output`.
pub fn run<Fut, Summary, Error>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    if let Err(error) = init_logging(&output) {
        eprintln!("{error:#}");
        return None;
    }
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("failed to start tokio runtime: {}", &error);
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(summary) => {
            if output.print_summary {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                tracing::error!("{:#}", &error);
            }
            None
        }
    }
}
