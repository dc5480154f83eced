//! targetd Provisioner
//!
//! Provisions iSCSI volumes on a targetd daemon for Kubernetes claims.

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use targetd_provisioner::config::{
    parse_duration, ControllerOptions, Options, TargetdOptions, DEFAULT_FILESYSTEM, DEFAULT_POOL,
    DEFAULT_PROVISIONER_TYPE, DEFAULT_TARGETD_PORT,
};
use targetd_provisioner::controller::leader::lease_name;
use targetd_provisioner::{
    Error, KubeCluster, LeaderElection, LeaseConfig, Metrics, ProvisionController, Result,
    TargetdClient, TargetdProvisioner,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// targetd Provisioner - iSCSI volumes from a targetd daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Provisioner name storage classes refer to
    #[arg(long = "type", env = "TYPE", default_value = DEFAULT_PROVISIONER_TYPE)]
    provisioner_type: String,

    /// Filesystem used when a class sets no fsType
    #[arg(long, env = "DEFAULT_FILESYSTEM", default_value = DEFAULT_FILESYSTEM)]
    default_filesystem: String,

    /// Pool used when a class sets no pool
    #[arg(long, env = "DEFAULT_POOL", default_value = DEFAULT_POOL)]
    default_pool: String,

    /// Kubernetes API server URL, overriding the kubeconfig
    #[arg(long, env = "API_SERVER")]
    api_server: Option<String>,

    /// Path to a kubeconfig; in-cluster config is used when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<String>,

    /// Talk to targetd over plain HTTP
    #[arg(long, env = "TARGETD_INSECURE", default_value_t = true, action = clap::ArgAction::Set)]
    targetd_insecure: bool,

    /// targetd host name or address
    #[arg(long, env = "TARGETD_ADDRESS", default_value = "")]
    targetd_address: String,

    /// targetd port
    #[arg(long, env = "TARGETD_PORT", default_value_t = DEFAULT_TARGETD_PORT)]
    targetd_port: u16,

    /// targetd basic auth user
    #[arg(long, env = "TARGETD_USERNAME", default_value = "")]
    targetd_username: String,

    /// targetd basic auth password
    #[arg(long, env = "TARGETD_PASSWORD", default_value = "", hide_env_values = true)]
    targetd_password: String,

    /// Fail calls whose response carries a daemon error
    #[arg(long, env = "TARGETD_STRICT_ERRORS", default_value_t = true, action = clap::ArgAction::Set)]
    targetd_strict_errors: bool,

    /// How often claims and volumes are re-listed
    #[arg(long, env = "RESYNC_PERIOD", default_value = "15m", value_parser = parse_period)]
    resync_period: Duration,

    /// Back off exponentially between failed attempts
    #[arg(long, env = "EXPONENTIAL_BACKOFF", default_value_t = true, action = clap::ArgAction::Set)]
    exponential_backoff: bool,

    /// Attempts per claim or volume before giving up (0 = unlimited)
    #[arg(long, env = "MAX_RETRIES", default_value_t = 15)]
    max_retries: u32,

    /// Run the controller only while holding the leader lease
    #[arg(long, env = "LEADER_ELECT", default_value_t = true, action = clap::ArgAction::Set)]
    leader_elect: bool,

    /// Namespace of the leader lease; the client's default namespace when unset
    #[arg(long, env = "POD_NAMESPACE")]
    leader_elect_namespace: Option<String>,

    /// Holder identity in the leader lease; the host name when unset
    #[arg(long, env = "POD_NAME")]
    leader_elect_identity: Option<String>,

    /// How long a leader lease stays valid without renewal
    #[arg(long, env = "LEASE_DURATION", default_value = "15s", value_parser = parse_period)]
    lease_duration: Duration,

    /// How long the leader retries a failing renewal before stepping down
    #[arg(long, env = "RENEW_DEADLINE", default_value = "10s", value_parser = parse_period)]
    renew_deadline: Duration,

    /// Pause between leader lease attempts
    #[arg(long, env = "RETRY_PERIOD", default_value = "2s", value_parser = parse_period)]
    retry_period: Duration,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

fn parse_period(s: &str) -> std::result::Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

impl Args {
    fn options(&self) -> Options {
        Options {
            targetd: TargetdOptions {
                insecure: self.targetd_insecure,
                address: self.targetd_address.clone(),
                port: self.targetd_port,
                username: self.targetd_username.clone(),
                password: self.targetd_password.clone(),
                strict_errors: self.targetd_strict_errors,
            },
            controller: ControllerOptions {
                resync_period: self.resync_period,
                failed_provision_threshold: self.max_retries,
                failed_delete_threshold: self.max_retries,
                exponential_backoff: self.exponential_backoff,
            },
            provisioner_type: self.provisioner_type.clone(),
            default_fs: self.default_filesystem.clone(),
            default_pool: self.default_pool.clone(),
        }
    }

    fn lease_config(&self, client: &Client) -> LeaseConfig {
        let identity = self
            .leader_elect_identity
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| format!("{}-{}", targetd_provisioner::NAME, std::process::id()));
        LeaseConfig {
            name: lease_name(&self.provisioner_type),
            namespace: self
                .leader_elect_namespace
                .clone()
                .unwrap_or_else(|| client.default_namespace().to_string()),
            identity,
            lease_duration: self.lease_duration,
            renew_deadline: self.renew_deadline,
            retry_period: self.retry_period,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let options = Arc::new(args.options());
    options.validate()?;

    info!("Starting targetd provisioner");
    info!("  Version: {}", targetd_provisioner::VERSION);
    info!("  Provisioner: {}", options.provisioner_type);
    info!("  Default pool: {}", options.default_pool);
    info!("  Resync period: {:?}", options.controller.resync_period);

    let client = kube_client(&args).await?;

    let metrics = Arc::new(Metrics::new()?);

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let server_metrics = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, server_metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    let targetd = Arc::new(TargetdClient::new(&options.targetd)?);
    info!("  targetd: {}", targetd.endpoint());
    let provisioner = Arc::new(TargetdProvisioner::new(targetd, options.clone()));
    let cluster = Arc::new(KubeCluster::new(client.clone()));
    let controller = ProvisionController::new(cluster, provisioner, options, metrics);

    let election = if args.leader_elect {
        let config = args.lease_config(&client);
        config.validate()?;
        Some(LeaderElection::new(client.clone(), config))
    } else {
        warn!("Leader election disabled; run a single replica to avoid duplicate volumes");
        None
    };

    let work = async move {
        match &election {
            Some(election) => {
                election.acquire().await?;
                tokio::select! {
                    result = controller.run(client) => result,
                    result = election.hold() => result,
                }
            }
            None => controller.run(client).await,
        }
    };

    tokio::select! {
        result = work => result?,
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received shutdown signal");
        }
    }

    info!("Provisioner shutdown complete");
    Ok(())
}

// =============================================================================
// Kubernetes Client
// =============================================================================

async fn kube_client(args: &Args) -> Result<Client> {
    let mut config = match &args.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::Configuration(format!("Failed to read kubeconfig {}: {}", path, e))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::Configuration(format!("Invalid kubeconfig {}: {}", path, e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::Configuration(format!("Failed to infer kube config: {}", e)))?,
    };

    if let Some(server) = &args.api_server {
        config.cluster_url = server
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid API server URL: {}", e)))?;
    }

    Ok(Client::try_from(config)?)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("kube=info".parse().unwrap())
        .add_directive("reqwest=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let (status, body) = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => (StatusCode::OK, "ok"),
                _ => (StatusCode::NOT_FOUND, "not found"),
            };
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: Arc<Metrics>) -> Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let mut response = Response::new(Body::empty());
                    if req.uri().path() != "/metrics" {
                        *response.status_mut() = StatusCode::NOT_FOUND;
                        *response.body_mut() = Body::from("not found");
                        return Ok::<_, std::convert::Infallible>(response);
                    }

                    match metrics.encode() {
                        Ok((content_type, buffer)) => {
                            if let Ok(value) = content_type.parse() {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            *response.body_mut() = Body::from(buffer);
                        }
                        Err(e) => {
                            error!("Failed to encode metrics: {}", e);
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        }
                    }
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
