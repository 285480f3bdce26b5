#[derive(clap::Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
/// Ghost sidecar reconciler.
///
/// Watches a routing spec (ConfigMap or file) and the cluster's
/// EndpointSlices, materializes weighted backend files for the proxy, and
/// triggers its reload endpoint.
pub struct ReconcilerArgs {
    /// Where to read the routing spec from: "configmap" or "file".
    #[arg(long, env = "GHOST_SOURCE_KIND", default_value = "configmap")]
    pub source_kind: SourceKind,

    /// Name of the ConfigMap carrying the `routing.json` key. Required when
    /// `source_kind` is "configmap".
    #[arg(long, env = "GHOST_CONFIGMAP_NAME")]
    pub configmap_name: Option<String>,

    /// Namespace of the routing-spec ConfigMap. Defaults to the reconciler's
    /// own namespace.
    #[arg(long, env = "GHOST_CONFIGMAP_NAMESPACE", default_value = "default")]
    pub configmap_namespace: String,

    /// Path to the routing spec file. Required when `source_kind` is
    /// "file".
    #[arg(long, env = "GHOST_SPEC_FILE_PATH")]
    pub spec_file_path: Option<std::path::PathBuf>,

    /// Path to write the materialized backend file to.
    #[arg(long, env = "GHOST_OUTPUT_PATH", default_value = "/etc/ghost/backends.json")]
    pub output_path: std::path::PathBuf,

    /// Address (`host:port`) of the proxy's reload endpoint.
    #[arg(long, env = "GHOST_PROXY_ADDR", default_value = "127.0.0.1:8080")]
    pub proxy_addr: String,

    /// Log level for the reconciler.
    #[arg(long, env = "GHOST_LOG_LEVEL", default_value_t = tracing::level_filters::LevelFilter::INFO)]
    pub log_level: tracing::level_filters::LevelFilter,

    /// Wait for an external "proxy ready" signal before the startup
    /// sequence's eager spec fetch (spec.md §4.6.2 step 1). When unset, the
    /// reconciler proceeds immediately.
    #[arg(long, env = "GHOST_WAIT_PROXY_READY", default_value_t = false)]
    pub wait_proxy_ready: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SourceKind {
    Configmap,
    File,
}
