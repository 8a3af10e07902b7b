//! Common utilities for podcp
//!
//! This crate holds the local half of a copy into a container:
//!
//! - [`archive`]: encodes single filesystem nodes as tar entries
//! - [`walk`]: resolves the source pattern and walks the tree, renaming every entry
//!   to its destination-relative name
//! - [`bridge`]: the bounded conduit that lets the archive be produced while it is
//!   being uploaded
//! - [`error`]: the error taxonomy shared with the remote side
//! - [`config`]: runtime, output and transfer configuration
//!
//! [`run`] wires a binary's async entry point to a tokio runtime and logging.

pub mod archive;
pub mod bridge;
pub mod config;
pub mod error;
pub mod walk;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig, TransferConfig};
pub use error::Error;
pub use walk::{ArchiveRoots, Summary, walk};

fn init_tracing(output: &OutputConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.log_filter()));
    if let Err(error) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("failed to initialize logging: {error}");
    }
}

/// Runs `func` on a freshly built tokio runtime.
///
/// Returns `None` on failure after reporting the error to stderr (unless quiet).
/// On success the summary is printed when requested, or when running verbose.
pub fn run<Fut, Summary>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    init_tracing(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed to start tokio runtime: {error}");
            }
            return None;
        }
    };
    let start = std::time::Instant::now();
    let res = tokio_runtime.block_on(func());
    tracing::info!("finished in {:?}", start.elapsed());
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}
