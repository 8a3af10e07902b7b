//! Copy local files and directory trees into running Kubernetes containers
//!
//! `podcp` streams a tar archive of the source into `tar -x` running inside the
//! target container. The archive is produced on a blocking thread while it is
//! being uploaded, so memory use is bounded by the bridge capacity regardless of
//! the size of the tree.
//!
//! # Destination
//!
//! The destination is `[NAMESPACE/]POD:PATH`. A `PATH` ending in `/` copies the
//! source into that directory under its own name, otherwise the source is
//! renamed to the last segment of `PATH`.
//!
//! # Wildcards
//!
//! The last segment of the source may be a shell-style pattern (`*.log`,
//! `data-[0-9]`). Every match is copied into the destination directory.
//!
//! # Examples
//!
//! ```bash
//! # copy a file, renaming it
//! podcp ./nginx.conf web-0:/etc/nginx/nginx.conf
//!
//! # copy a directory into /srv of a pod in another namespace
//! podcp ./site prod/web-0:/srv/
//!
//! # copy all logs into a specific container
//! podcp -c sidecar './logs/*.log' web-0:/var/log/app/
//! ```

use common::bridge;
use common::{ArchiveRoots, Error, Summary, TransferConfig};
use remote::{ExecTarget, Executor};
use tokio::io::AsyncWrite;
use tracing::instrument;

pub mod path;

fn is_broken_pipe(error: &Error) -> bool {
    matches!(error, Error::Io { source, .. } if source.kind() == std::io::ErrorKind::BrokenPipe)
}

/// Failure of the archive producer.
///
/// `complete` carries the summary when every entry was already written and only
/// the end-of-archive padding or the final flush failed.
#[derive(Debug)]
struct ProduceError {
    error: Error,
    complete: Option<Summary>,
}

fn produce(
    roots: &ArchiveRoots,
    mut producer: bridge::Producer,
) -> Result<Summary, Box<ProduceError>> {
    let incomplete = |error| {
        Box::new(ProduceError {
            error,
            complete: None,
        })
    };
    let mut encoder = common::archive::ArchiveEntryEncoder::new(&mut producer);
    let summary = common::walk(roots, &mut encoder).map_err(incomplete)?;
    let finished = |error| {
        Box::new(ProduceError {
            error,
            complete: Some(summary),
        })
    };
    encoder.finish().map_err(finished)?;
    producer
        .close()
        .map_err(|err| finished(Error::io("failed closing archive stream", err)))?;
    tracing::debug!("archive complete: {} bytes", producer.bytes_written());
    Ok(summary)
}

type Produced = Result<Summary, Box<ProduceError>>;

fn joined(task: Result<Produced, tokio::task::JoinError>) -> Produced {
    task.map_err(|err| {
        Box::new(ProduceError {
            error: Error::io("archive producer did not complete", std::io::Error::other(err)),
            complete: None,
        })
    })?
}

/// Decides the outcome once the remote side has finished.
fn settle(produced: Produced, remote: Result<(), Error>) -> Result<Summary, Error> {
    match (produced, remote) {
        (Ok(summary), Ok(())) => Ok(summary),
        (Err(err), Ok(())) => match err.complete {
            // tar exits once it has read the end-of-archive marker
            Some(summary) if is_broken_pipe(&err.error) => {
                tracing::debug!("remote finished before the archive padding was consumed");
                Ok(summary)
            }
            _ => Err(err.error),
        },
        // the remote only saw a stream that failed because of this error
        (Err(err), Err(remote)) if !is_broken_pipe(&err.error) => {
            tracing::debug!("remote failure after producer failure: {}", remote);
            Err(err.error)
        }
        (_, Err(error)) => Err(error),
    }
}

/// Copies `source` to `destination` inside `target`, relaying the remote
/// command's output to `stdout` and `stderr`.
///
/// The archive producer and the remote command run concurrently and the first
/// error either of them observes is returned. A local failure aborts the stream,
/// so it wins over whatever the remote reports about the truncated archive. A
/// producer that fails because the remote side stopped reading defers to the
/// remote result, which says why. Both sides have finished by the time this
/// returns.
#[instrument(skip(executor, stdout, stderr))]
pub async fn copy_with_sinks<X, O, E>(
    executor: &X,
    source: &std::path::Path,
    destination: &str,
    target: &ExecTarget,
    transfer: &TransferConfig,
    stdout: O,
    stderr: E,
) -> Result<Summary, Error>
where
    X: Executor,
    O: AsyncWrite + Unpin + Send + 'static,
    E: AsyncWrite + Unpin + Send + 'static,
{
    let roots = ArchiveRoots::new(source, destination)?;
    if !roots.is_wildcard() {
        let path = roots.source_base.join(&roots.source_pattern);
        tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|source| Error::Stat { path, source })?;
    }
    let command = remote::extract_command(&roots.dest_base);
    tracing::info!(
        "copying {:?} to {}:{:?}",
        source,
        target,
        roots.dest_base.join(&roots.dest_pattern)
    );
    let (producer, consumer) = bridge::create(transfer.bridge_capacity, transfer.chunk_size);
    let mut producer_task = tokio::task::spawn_blocking(move || produce(&roots, producer));
    let remote = executor.exec(target, &command, consumer, stdout, stderr);
    tokio::pin!(remote);
    tokio::select! {
        produced = &mut producer_task => {
            match joined(produced) {
                Err(err) if !is_broken_pipe(&err.error) => {
                    tracing::error!("archive production failed: {}", &err.error);
                    // the closed bridge ends the remote input, let the command exit
                    let remote = remote.await;
                    tracing::debug!("remote result after producer failure: {:?}", remote);
                    Err(err.error)
                }
                produced => settle(produced, remote.await),
            }
        }
        remote_result = &mut remote => {
            match &remote_result {
                Err(error) if error.is_remote() => tracing::error!("remote side failed: {}", error),
                Err(error) => tracing::error!("relaying remote output failed: {}", error),
                Ok(()) => tracing::debug!("remote command finished"),
            }
            // dropping the consumer unblocks the producer with a broken pipe
            settle(joined(producer_task.await), remote_result)
        }
    }
}

/// Copies `source` to `destination` inside `target`, relaying the remote
/// command's output to this process's stdout and stderr.
pub async fn copy<X: Executor>(
    executor: &X,
    source: &std::path::Path,
    destination: &str,
    target: &ExecTarget,
    transfer: &TransferConfig,
) -> Result<Summary, Error> {
    copy_with_sinks(
        executor,
        source,
        destination,
        target,
        transfer,
        tokio::io::stdout(),
        tokio::io::stderr(),
    )
    .await
}
