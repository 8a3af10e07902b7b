//! Remote command execution inside cluster containers
//!
//! The copy pipeline only needs one capability from the cluster: run a command
//! in a container with stdin/stdout/stderr attached and report how it ended.
//! [`Executor`] is that seam, [`KubeExecutor`] implements it on top of the
//! Kubernetes `exec` sub-resource and [`resolve_cluster_config`] produces the
//! authenticated handle it runs on.

use tokio::io::{AsyncRead, AsyncWrite};

pub mod cluster;
pub mod exec;

pub use cluster::{ClusterConfig, ClusterHandle, resolve_cluster_config};
pub use exec::KubeExecutor;

/// Container a command runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecTarget {
    /// `None` uses the namespace of the active cluster context
    pub namespace: Option<String>,
    pub pod: String,
    /// `None` lets the cluster pick the pod's default container
    pub container: Option<String>,
}

impl std::fmt::Display for ExecTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(namespace) = &self.namespace {
            write!(f, "{namespace}/")?;
        }
        write!(f, "{}", self.pod)?;
        if let Some(container) = &self.container {
            write!(f, " (container {container})")?;
        }
        Ok(())
    }
}

/// Runs one command inside a container.
///
/// `stdin` is streamed to the remote process until it reaches end-of-stream,
/// remote stdout/stderr are relayed to the given sinks as they arrive. The
/// returned future completes when the remote command exits or the connection
/// is lost; a non-zero exit is an error. Implementations do not retry.
pub trait Executor: Sync {
    fn exec<I, O, E>(
        &self,
        target: &ExecTarget,
        command: &[String],
        stdin: I,
        stdout: O,
        stderr: E,
    ) -> impl std::future::Future<Output = Result<(), common::Error>> + Send
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static;
}

/// Command extracting a tar archive from stdin into `dest_dir`.
#[must_use]
pub fn extract_command(dest_dir: &std::path::Path) -> Vec<String> {
    vec![
        "tar".to_string(),
        "-xmf".to_string(),
        "-".to_string(),
        "-C".to_string(),
        dest_dir.to_string_lossy().into_owned(),
    ]
}
