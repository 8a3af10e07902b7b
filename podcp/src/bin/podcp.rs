use anyhow::{Context, anyhow};
use clap::Parser;
use tracing::instrument;

use podcp::path;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "podcp",
    version,
    about = "Copy local files and directories into a running Kubernetes container",
    long_about = "`podcp` copies a local file or directory tree into a running container by streaming a tar archive into `tar -x` inside the container.

The only requirement on the container side is a `tar` binary on the PATH. The archive is produced while it is uploaded, so arbitrarily large trees are copied with bounded memory.

A destination ending in `/` copies the source into that directory under its own name. Otherwise the source is renamed to the last component of the destination. The last component of the source may be a shell-style wildcard; every match is copied into the destination directory.

EXAMPLES:
    # Copy a single file, renaming it
    podcp ./nginx.conf web-0:/etc/nginx/nginx.conf

    # Copy a directory into /srv of a pod in namespace `prod`
    podcp ./site prod/web-0:/srv/

    # Copy all logs into the `sidecar` container and print a summary
    podcp -c sidecar './logs/*.log' web-0:/var/log/app/ --summary

    # Run from inside the cluster using the pod's service account
    podcp --in-cluster ./config.yaml web-0:/etc/app/config.yaml"
)]
struct Args {
    // Target
    /// Container to copy into (default: the pod's default container)
    #[arg(short, long, value_name = "NAME", help_heading = "Target")]
    container: Option<String>,

    /// Namespace of the pod (default: namespace of the current context)
    ///
    /// Must agree with the namespace given in the destination, if any.
    #[arg(short, long, value_name = "NAMESPACE", help_heading = "Target")]
    namespace: Option<String>,

    // Cluster connection
    /// Use the in-cluster service account configuration instead of a kubeconfig
    #[arg(long, help_heading = "Cluster connection")]
    in_cluster: bool,

    /// Path to the kubeconfig file (default: $KUBECONFIG, then ~/.kube/config)
    #[arg(
        long,
        value_name = "PATH",
        conflicts_with = "in_cluster",
        help_heading = "Cluster connection"
    )]
    kubeconfig: Option<std::path::PathBuf>,

    /// Kubeconfig context to use (default: the current context)
    #[arg(
        long,
        value_name = "NAME",
        conflicts_with = "in_cluster",
        help_heading = "Cluster connection"
    )]
    context: Option<String>,

    /// Timeout for establishing the connection to the API server
    ///
    /// Accepts human-readable durations like "500ms", "10s", "1min".
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration, help_heading = "Cluster connection")]
    connect_timeout: Option<std::time::Duration>,

    /// Timeout for reads from the API server
    ///
    /// Accepts human-readable durations like "500ms", "10s", "1min".
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration, help_heading = "Cluster connection")]
    read_timeout: Option<std::time::Duration>,

    // Transfer
    /// Size of the chunks the archive is streamed in
    #[arg(
        long,
        default_value = "64KiB",
        value_name = "SIZE",
        help_heading = "Transfer"
    )]
    chunk_size: bytesize::ByteSize,

    /// Number of chunks buffered between the archive writer and the upload
    #[arg(
        long,
        default_value = "16",
        value_name = "N",
        help_heading = "Transfer"
    )]
    bridge_capacity: usize,

    // Output
    /// Print summary at the end
    #[arg(long, help_heading = "Output")]
    summary: bool,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads (0 = Tokio default of 512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Local file, directory or wildcard pattern to copy
    #[arg()]
    source: std::path::PathBuf,

    /// Destination in the form [NAMESPACE/]POD:PATH
    #[arg()]
    destination: String,
}

#[instrument]
async fn async_main(args: Args) -> anyhow::Result<common::Summary> {
    let destination = path::parse_pod_path(&args.destination)?;
    let namespace = path::resolve_namespace(destination.namespace, args.namespace)?;
    let transfer = common::TransferConfig {
        chunk_size: usize::try_from(args.chunk_size.as_u64())
            .context("--chunk-size does not fit in memory")?,
        bridge_capacity: args.bridge_capacity,
    };
    transfer.validate().map_err(|err| anyhow!("invalid transfer settings: {err}"))?;
    let cluster = remote::ClusterConfig {
        in_cluster: args.in_cluster,
        kubeconfig: args.kubeconfig,
        context: args.context,
        connect_timeout: args.connect_timeout,
        read_timeout: args.read_timeout,
    };
    let handle = remote::resolve_cluster_config(&cluster)
        .await
        .context("failed to configure the cluster client")?;
    let executor = remote::KubeExecutor::new(handle).with_stdin_buffer(transfer.chunk_size);
    let target = remote::ExecTarget {
        namespace,
        pod: destination.pod,
        container: args.container,
    };
    let summary = podcp::copy(
        &executor,
        &args.source,
        &destination.path,
        &target,
        &transfer,
    )
    .await
    .with_context(|| format!("failed copying {:?} to {}", args.source, args.destination))?;
    Ok(summary)
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
