use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wy::tunnel::argocd::{self, SecretRef};
use wy::tunnel::{CredentialSource, KubectlPortForward, ServiceTarget, TunnelProvisioner};
use wy::{LoadGenerator, LoadPlan, TargetServer};
use wy_common::{ClientConfig, Config, ConfigError, ServeConfig};

#[derive(Debug, Parser)]
#[command(name = "wy", version, about = "Latency target server and sequential load generator")]
struct Args {
    #[command(subcommand)]
    cmd: Commands,

    /// debug logging as default instead of info; use RUST_LOG for more options
    #[arg(long, short = 'v', default_value_t = false, global = true)]
    verbose: bool,

    /// human readable logs instead of JSON
    #[arg(long, default_value_t = false, global = true)]
    pretty: bool,

    /// YAML file with `serve` and `client` defaults; flags take precedence
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the target server
    Serve(ServeArgs),
    /// Send a single GET request
    Get(GetArgs),
    /// Repeat a request
    #[command(subcommand)]
    Repeat(RepeatCommand),
    /// Print generated artifacts
    #[command(subcommand)]
    Print(PrintCommand),
}

#[derive(Debug, ClapArgs)]
struct ServeArgs {
    /// The socket to bind to
    #[arg(long)]
    bind: Option<String>,
    /// Enable h2c (HTTP/2 over cleartext TCP)
    #[arg(long)]
    h2c: bool,
    #[arg(long, value_parser = humantime::parse_duration)]
    delay_header_first_byte: Option<Duration>,
    #[arg(long, value_parser = humantime::parse_duration)]
    delay_body_first_byte: Option<Duration>,
    #[arg(long, value_parser = humantime::parse_duration)]
    delay_body_last_byte: Option<Duration>,
}

impl ServeArgs {
    fn apply(self, mut config: ServeConfig) -> ServeConfig {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if self.h2c {
            config.h2c = true;
        }
        if let Some(delay) = self.delay_header_first_byte {
            config.delay_header = delay;
        }
        if let Some(delay) = self.delay_body_first_byte {
            config.delay_body_first_byte = delay;
        }
        if let Some(delay) = self.delay_body_last_byte {
            config.delay_body_last_byte = delay;
        }
        config
    }
}

#[derive(Debug, ClapArgs)]
struct GetArgs {
    /// The URL to send requests to
    #[arg(long)]
    url: Option<String>,
    /// Print response bodies to stdout
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    print: Option<bool>,
}

impl GetArgs {
    fn apply(self, mut config: ClientConfig) -> ClientConfig {
        if let Some(url) = self.url {
            config.url = url;
        }
        if let Some(print) = self.print {
            config.print_body = print;
        }
        config
    }
}

#[derive(Debug, Subcommand)]
enum RepeatCommand {
    /// Repeat GET requests
    Get(RepeatGetArgs),
}

#[derive(Debug, ClapArgs)]
struct RepeatGetArgs {
    #[command(flatten)]
    get: GetArgs,
    /// Number of repetitions
    #[arg(long)]
    count: Option<u64>,
    /// Delay between each request
    #[arg(long, value_parser = humantime::parse_duration)]
    interval: Option<Duration>,
    /// Repeat until interrupted; --count is ignored
    #[arg(long)]
    forever: bool,
    /// Per-request timeout
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,
    #[command(flatten)]
    tunnel: TunnelArgs,
}

#[derive(Debug, ClapArgs)]
struct TunnelArgs {
    /// Kubernetes service to reach through a port-forward
    #[arg(long)]
    service: Option<String>,
    /// Namespace of the service
    #[arg(long)]
    namespace: Option<String>,
    #[arg(long, default_value_t = 8080)]
    local_port: u16,
    #[arg(long, default_value_t = 8080)]
    remote_port: u16,
    /// Kubeconfig used for the port-forward
    #[arg(long)]
    kubeconfig: Option<PathBuf>,
    /// ArgoCD cluster secret ([namespace/]name) describing the target cluster
    #[arg(long)]
    argocd_cluster_secret: Option<String>,
}

impl TunnelArgs {
    fn service_target(self) -> Result<Option<ServiceTarget>, Box<dyn std::error::Error>> {
        let Some(service) = self.service else {
            if self.argocd_cluster_secret.is_some() {
                warn!("--argocd-cluster-secret has no effect without --service");
            }
            return Ok(None);
        };

        let credentials = match self.argocd_cluster_secret {
            Some(secret) => CredentialSource::ArgoCdClusterSecret {
                kubeconfig: self.kubeconfig,
                secret: secret.parse::<SecretRef>()?,
            },
            None => CredentialSource::Kubeconfig(self.kubeconfig),
        };

        Ok(Some(ServiceTarget {
            service,
            namespace: self.namespace,
            local_port: self.local_port,
            remote_port: self.remote_port,
            credentials,
        }))
    }
}

#[derive(Debug, Subcommand)]
enum PrintCommand {
    /// Print a kubeconfig generated from an ArgoCD cluster secret
    Kubeconfig(PrintKubeconfigArgs),
}

#[derive(Debug, ClapArgs)]
struct PrintKubeconfigArgs {
    /// ArgoCD cluster secret ([namespace/]name)
    #[arg(long)]
    argocd_cluster_secret: Option<String>,
    /// Kubeconfig used to read the secret
    #[arg(long)]
    kubeconfig: Option<PathBuf>,
    /// Namespace of the generated context
    #[arg(long, default_value = "default")]
    set_namespace: String,
}

fn init_logging(verbose: bool, pretty: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    if pretty {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .init();
    } else {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr).with_target(true))
            .init();
    }
}

async fn serve(config: ServeConfig, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    let server = TargetServer::bind(&config)?;
    info!(
        bind = %config.bind,
        delay_header = ?config.delay_header,
        delay_body_first_byte = ?config.delay_body_first_byte,
        delay_body_last_byte = ?config.delay_body_last_byte,
        "Starting target server"
    );
    server.run(shutdown).await?;
    Ok(())
}

async fn get(config: ClientConfig, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    let plan = LoadPlan::single(&config.url, config.print_body)?.timeout(config.timeout);
    let generator = LoadGenerator::new(shutdown);
    generator.run(&plan, &mut tokio::io::stdout()).await?;
    Ok(())
}

async fn repeat(
    config: ClientConfig,
    target: Option<ServiceTarget>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut plan = LoadPlan::from_config(&config)?;

    let tunnel = match target {
        Some(target) => {
            let provisioner = KubectlPortForward::default();
            let tunnel = tokio::select! {
                tunnel = provisioner.resolve(&target) => tunnel?,
                _ = shutdown.cancelled() => return Ok(()),
            };
            let local_target = tunnel.local_url(&plan.target)?;
            plan = plan.with_target(local_target);
            Some(tunnel)
        }
        None => None,
    };

    let generator = LoadGenerator::new(shutdown);
    let result = generator.run(&plan, &mut tokio::io::stdout()).await;

    if let Some(tunnel) = tunnel {
        tunnel.release().await;
    }
    result?;
    Ok(())
}

async fn print_kubeconfig(args: PrintKubeconfigArgs) -> Result<(), Box<dyn std::error::Error>> {
    let secret = args.argocd_cluster_secret.ok_or_else(|| {
        ConfigError::Invalid("missing value for the required flag --argocd-cluster-secret".to_string())
    })?;
    let secret: SecretRef = secret.parse()?;

    let cluster = argocd::fetch_cluster("kubectl", &[], args.kubeconfig.as_deref(), &secret).await?;
    let yaml = cluster.to_kubeconfig(&args.set_namespace).to_yaml()?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(yaml.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.verbose, args.pretty);

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let master_token = CancellationToken::new();
    let signal_token = master_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_token.cancel();
        }
    });

    match args.cmd {
        Commands::Serve(serve_args) => serve(serve_args.apply(config.serve), master_token).await,
        Commands::Get(get_args) => {
            let client = ClientConfig {
                interval: Duration::ZERO,
                ..get_args.apply(config.client)
            };
            get(client, master_token).await
        }
        Commands::Repeat(RepeatCommand::Get(repeat_args)) => {
            let mut client = repeat_args.get.apply(config.client);
            if let Some(count) = repeat_args.count {
                client.count = count;
            }
            if let Some(interval) = repeat_args.interval {
                client.interval = interval;
            }
            if repeat_args.forever {
                client.forever = true;
            }
            if repeat_args.timeout.is_some() {
                client.timeout = repeat_args.timeout;
            }
            let target = repeat_args.tunnel.service_target()?;
            repeat(client, target, master_token).await
        }
        Commands::Print(PrintCommand::Kubeconfig(print_args)) => print_kubeconfig(print_args).await,
    }
}
