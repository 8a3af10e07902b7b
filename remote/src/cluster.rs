//! Cluster authentication and client construction.

use common::Error;
use tracing::instrument;

/// Connection settings for reaching the cluster API.
///
/// Constructed once per invocation and passed to [`resolve_cluster_config`].
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    /// Use the pod service account instead of a kubeconfig
    pub in_cluster: bool,
    /// Explicit kubeconfig file; `None` uses `KUBECONFIG` or `~/.kube/config`
    pub kubeconfig: Option<std::path::PathBuf>,
    /// Kubeconfig context to use instead of the current one
    pub context: Option<String>,
    pub connect_timeout: Option<std::time::Duration>,
    pub read_timeout: Option<std::time::Duration>,
}

/// Authenticated cluster client plus the namespace commands default to.
#[derive(Clone)]
pub struct ClusterHandle {
    pub(crate) client: kube::Client,
    pub(crate) default_namespace: String,
}

impl std::fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("default_namespace", &self.default_namespace)
            .finish_non_exhaustive()
    }
}

impl ClusterHandle {
    #[must_use]
    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }
}

#[instrument]
async fn load_config(config: &ClusterConfig) -> Result<kube::Config, Error> {
    if config.in_cluster {
        tracing::debug!("using in-cluster service account");
        return kube::Config::incluster()
            .map_err(|err| Error::connection("failed loading in-cluster configuration", err));
    }
    let options = kube::config::KubeConfigOptions {
        context: config.context.clone(),
        ..Default::default()
    };
    match &config.kubeconfig {
        Some(path) => {
            tracing::debug!("using kubeconfig {:?}", path);
            let kubeconfig = kube::config::Kubeconfig::read_from(path).map_err(|err| {
                Error::connection(format!("failed reading kubeconfig {path:?}"), err)
            })?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|err| {
                    Error::connection(format!("failed loading kubeconfig {path:?}"), err)
                })
        }
        None => kube::Config::from_kubeconfig(&options)
            .await
            .map_err(|err| Error::connection("failed loading default kubeconfig", err)),
    }
}

/// Authenticates against the cluster and returns a handle to run commands on.
///
/// No request is sent yet; connection problems surface on first use.
pub async fn resolve_cluster_config(config: &ClusterConfig) -> Result<ClusterHandle, Error> {
    let mut kube_config = load_config(config).await?;
    if config.connect_timeout.is_some() {
        kube_config.connect_timeout = config.connect_timeout;
    }
    if config.read_timeout.is_some() {
        kube_config.read_timeout = config.read_timeout;
    }
    let default_namespace = kube_config.default_namespace.clone();
    tracing::info!(
        "cluster {} (default namespace {})",
        kube_config.cluster_url,
        &default_namespace
    );
    let client = kube::Client::try_from(kube_config)
        .map_err(|err| Error::connection("failed building cluster client", err))?;
    Ok(ClusterHandle {
        client,
        default_namespace,
    })
}
