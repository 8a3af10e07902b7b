/// Destination inside a pod, as written on the command line: `[namespace/]pod:path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodPath {
    pub namespace: Option<String>,
    pub pod: String,
    pub path: String,
}

/// Parses a `[namespace/]pod:path` destination.
///
/// Namespace and pod must be valid Kubernetes object names (lowercase
/// alphanumerics, `-`, and for pods also `.`); the path is taken verbatim.
pub fn parse_pod_path(destination: &str) -> anyhow::Result<PodPath> {
    let re = regex::Regex::new(
        r"^(?:(?P<namespace>[a-z0-9](?:[-a-z0-9]*[a-z0-9])?)/)?(?P<pod>[a-z0-9](?:[-.a-z0-9]*[a-z0-9])?):(?P<path>.+)$",
    )?;
    let captures = re.captures(destination).ok_or_else(|| {
        anyhow::anyhow!(
            "destination {destination:?} is not of the form [NAMESPACE/]POD:PATH\n\
            Example: 'podcp ./site default/nginx:/usr/share/nginx/html/'"
        )
    })?;
    let pod = captures
        .name("pod")
        .ok_or_else(|| anyhow::anyhow!("destination {destination:?} does not name a pod"))?
        .as_str()
        .to_string();
    let path = captures
        .name("path")
        .ok_or_else(|| anyhow::anyhow!("destination {destination:?} does not name a path"))?
        .as_str()
        .to_string();
    Ok(PodPath {
        namespace: captures.name("namespace").map(|m| m.as_str().to_string()),
        pod,
        path,
    })
}

/// Reconciles the namespace given in the destination with the `--namespace` flag.
pub fn resolve_namespace(
    from_path: Option<String>,
    from_flag: Option<String>,
) -> anyhow::Result<Option<String>> {
    match (from_path, from_flag) {
        (Some(path_ns), Some(flag_ns)) if path_ns != flag_ns => Err(anyhow::anyhow!(
            "namespace {path_ns:?} in destination conflicts with --namespace {flag_ns:?}"
        )),
        (Some(namespace), _) | (None, Some(namespace)) => Ok(Some(namespace)),
        (None, None) => Ok(None),
    }
}
