use clap::Parser;

/// A REST protocol gateway to self-describing gRPC endpoints.
///
/// The gateway connects to the configured backend, reads its schema over
/// server reflection, and serves a REST/JSON surface synthesized from the
/// backend's HTTP annotations. The surface follows the backend: when the
/// schema changes, routes and the swagger document are rebuilt in place.
#[derive(Parser, Debug)]
#[command(name = "restgate", version)]
pub struct Cli {
    /// Path to the restgate.yml config file.
    #[arg(short = 'c', long, env = "CONFIG", default_value = "./restgate.yml")]
    pub config: String,

    /// <hostname>:<port> of the consul agent used for @service endpoints.
    #[arg(short = 'C', long, env = "CONSUL", default_value = "localhost:8500")]
    pub consul: String,

    /// <hostname> or <ip> at which the gateway is reachable from outside the cluster.
    #[arg(
        short = 'E',
        long,
        env = "EXTERNAL_HOST_ADDRESS",
        default_value = "localhost"
    )]
    pub external_host_address: String,

    /// <hostname>:<port> of a fluentd server for log forwarding.
    #[arg(short = 'F', long, env = "FLUENTD")]
    pub fluentd: Option<String>,

    /// gRPC endpoint to connect to. Either a direct <hostname>:<port>, or
    /// @<service-name> where the name is resolved through consul
    /// (example: @voltha-grpc).
    #[arg(short = 'G', long, env = "GRPC_ENDPOINT", default_value = "localhost:50055")]
    pub grpc_endpoint: String,

    /// <hostname> or <ip> at which the gateway is reachable from inside the cluster.
    #[arg(
        short = 'H',
        long,
        env = "INTERNAL_HOST_ADDRESS",
        default_value = "localhost"
    )]
    pub internal_host_address: String,

    /// Unique string id of this gateway instance.
    #[arg(short = 'i', long, env = "INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// Omit the startup banner log lines.
    #[arg(short = 'n', long)]
    pub no_banner: bool,

    /// Port number for the REST service.
    #[arg(short = 'R', long, env = "REST_PORT", default_value_t = 8881)]
    pub rest_port: u16,

    /// Suppress debug and info logs.
    #[arg(short = 'q', long, action = clap::ArgAction::Count)]
    pub quiet: u8,

    /// Enable verbose logging.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Work dir for generated artifacts; swagger UI assets are served from
    /// <work-dir>/swagger_ui when present.
    #[arg(short = 'w', long, env = "WORK_DIR", default_value = "/tmp/restgate")]
    pub work_dir: String,

    /// Mount prefix for the swagger document and UI.
    #[arg(short = 'S', long, env = "SWAGGER_URL", default_value = "")]
    pub swagger_url: String,

    /// Enable TLS or not ("True"/"False"). Automatically downgraded to
    /// cleartext when the key or certificate file is missing.
    #[arg(short = 't', long = "tls-enable", env = "ENABLE_TLS", default_value = "True")]
    pub enable_tls: String,

    /// Path to the TLS server private key.
    #[arg(short = 'k', long, env = "KEY", default_value = "/restgate/pki/server.key")]
    pub key: String,

    /// Path to the TLS server certificate file.
    #[arg(
        short = 'f',
        long = "cert-file",
        env = "CERT",
        default_value = "/restgate/pki/server.crt"
    )]
    pub cert: String,

    /// Seconds between backend schema polls.
    #[arg(long, env = "SCHEMA_POLL_SECONDS", default_value_t = 30)]
    pub schema_poll_seconds: u64,
}

impl Cli {
    /// Instance id: explicit flag, then $HOSTNAME, then "1".
    pub fn instance_id(&self) -> String {
        resolve_instance_id(self.instance_id.as_deref(), std::env::var("HOSTNAME").ok())
    }

    pub fn verbosity(&self) -> i8 {
        self.verbose as i8 - self.quiet as i8
    }
}

fn resolve_instance_id(explicit: Option<&str>, hostname: Option<String>) -> String {
    match explicit {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => hostname.unwrap_or_else(|| "1".to_string()),
    }
}
