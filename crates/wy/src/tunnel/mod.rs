//! Local port forwards into cluster-internal services.
//!
//! A [`TunnelProvisioner`] turns a [`ServiceTarget`] into a ready [`Tunnel`].
//! The tunnel owns the forwarder process and any generated credentials;
//! dropping it releases both, so every exit path of the owning command
//! gives the port back.

pub mod argocd;

use argocd::{ClusterSecretError, SecretRef};
use hyper::Uri;
use std::future::Future;
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const READY_PREFIX: &str = "Forwarding from";

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error(transparent)]
    ClusterSecret(#[from] ClusterSecretError),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("port-forward exited before it was ready ({status}): {stderr}")]
    Exited { status: String, stderr: String },
    #[error("port-forward was not ready after {0:?}")]
    NotReady(Duration),
    #[error("cannot rewrite {url} for the tunnel: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Where forwarding credentials come from.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    /// A kubeconfig file, or kubectl's own default lookup when `None`.
    Kubeconfig(Option<PathBuf>),
    /// An ArgoCD cluster secret, read with the given kubeconfig.
    ArgoCdClusterSecret {
        kubeconfig: Option<PathBuf>,
        secret: SecretRef,
    },
}

#[derive(Debug, Clone)]
pub struct ServiceTarget {
    pub service: String,
    pub namespace: Option<String>,
    pub local_port: u16,
    pub remote_port: u16,
    pub credentials: CredentialSource,
}

impl ServiceTarget {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            namespace: None,
            local_port: 8080,
            remote_port: 8080,
            credentials: CredentialSource::Kubeconfig(None),
        }
    }
}

pub trait TunnelProvisioner {
    /// Establishes a forward and waits until it accepts connections.
    fn resolve(
        &self,
        target: &ServiceTarget,
    ) -> impl Future<Output = Result<Tunnel, TunnelError>> + Send;
}

/// A ready port forward. Released explicitly with [`Tunnel::release`] or
/// implicitly on drop.
pub struct Tunnel {
    local_addr: SocketAddr,
    forwarder: Option<Child>,
    output_task: Option<JoinHandle<()>>,
    kubeconfig: Option<NamedTempFile>,
}

impl Tunnel {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn forwarder_id(&self) -> Option<u32> {
        self.forwarder.as_ref().and_then(Child::id)
    }

    /// Kubeconfig generated for this tunnel, if the credentials needed one.
    pub fn kubeconfig_path(&self) -> Option<&Path> {
        self.kubeconfig.as_ref().map(NamedTempFile::path)
    }

    /// Points `target` at the local end of the tunnel, keeping path and query.
    pub fn local_url(&self, target: &Uri) -> Result<Uri, TunnelError> {
        let path_and_query = target
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        Uri::builder()
            .scheme("http")
            .authority(self.local_addr.to_string())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| TunnelError::InvalidUrl {
                url: target.to_string(),
                reason: e.to_string(),
            })
    }

    pub async fn release(mut self) {
        if let Some(mut child) = self.forwarder.take() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to stop port-forward");
            }
        }
        if let Some(task) = self.output_task.take() {
            task.abort();
        }
        self.kubeconfig.take();
        info!(addr = %self.local_addr, "Tunnel released");
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(child) = self.forwarder.as_mut() {
            let _ = child.start_kill();
        }
        if let Some(task) = self.output_task.take() {
            task.abort();
        }
    }
}

/// Writes a kubeconfig to a private temporary file, removed when dropped.
fn write_temp_kubeconfig(contents: &str) -> io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("wy-kubeconfig-")
        .suffix(".yaml")
        .tempfile()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Provisions tunnels with `kubectl port-forward`.
#[derive(Debug, Clone)]
pub struct KubectlPortForward {
    program: String,
    base_args: Vec<String>,
    ready_timeout: Duration,
}

impl Default for KubectlPortForward {
    fn default() -> Self {
        Self {
            program: "kubectl".to_string(),
            base_args: Vec::new(),
            ready_timeout: Duration::from_secs(30),
        }
    }
}

impl KubectlPortForward {
    /// Runs `program base_args.. <kubectl args>` instead of plain `kubectl`.
    pub fn with_command<I, S>(program: impl Into<String>, base_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            base_args: base_args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn ready_timeout(mut self, ready_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }

    pub fn port_forward_args(&self, target: &ServiceTarget, kubeconfig: Option<&Path>) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.push("port-forward".to_string());
        args.push(format!("svc/{}", target.service));
        args.push(format!("{}:{}", target.local_port, target.remote_port));
        args.push("--address".to_string());
        args.push(Ipv4Addr::LOCALHOST.to_string());
        if let Some(ns) = &target.namespace {
            args.push("--namespace".to_string());
            args.push(ns.clone());
        }
        if let Some(path) = kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(path.display().to_string());
        }
        args
    }

    async fn credentials(
        &self,
        target: &ServiceTarget,
    ) -> Result<(Option<PathBuf>, Option<NamedTempFile>), TunnelError> {
        match &target.credentials {
            CredentialSource::Kubeconfig(path) => Ok((path.clone(), None)),
            CredentialSource::ArgoCdClusterSecret { kubeconfig, secret } => {
                let cluster = argocd::fetch_cluster(
                    &self.program,
                    &self.base_args,
                    kubeconfig.as_deref(),
                    secret,
                )
                .await?;
                let namespace = target.namespace.as_deref().unwrap_or("default");
                let yaml = cluster.to_kubeconfig(namespace).to_yaml()?;
                let temp = write_temp_kubeconfig(&yaml)?;
                debug!(path = %temp.path().display(), cluster = %cluster.server, "Wrote cluster kubeconfig");
                Ok((Some(temp.path().to_path_buf()), Some(temp)))
            }
        }
    }
}

impl TunnelProvisioner for KubectlPortForward {
    async fn resolve(&self, target: &ServiceTarget) -> Result<Tunnel, TunnelError> {
        let (kubeconfig_path, kubeconfig) = self.credentials(target).await?;
        let args = self.port_forward_args(target, kubeconfig_path.as_deref());

        debug!(program = %self.program, ?args, "Starting port-forward");
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TunnelError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("port-forward stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("port-forward stderr unavailable"))?;
        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();

        // Both pipes are read while waiting so a chatty stderr cannot stall kubectl.
        let mut stderr_open = true;
        let mut stderr_seen = Vec::new();
        let ready: Result<io::Result<bool>, tokio::time::error::Elapsed> =
            timeout(self.ready_timeout, async {
                loop {
                    tokio::select! {
                        line = stdout.next_line() => match line? {
                            Some(line) => {
                                debug!(stream = "stdout", line = %line, "port-forward");
                                if line.starts_with(READY_PREFIX) {
                                    return Ok(true);
                                }
                            }
                            None => return Ok(false),
                        },
                        line = stderr.next_line(), if stderr_open => match line {
                            Ok(Some(line)) => {
                                debug!(stream = "stderr", line = %line, "port-forward");
                                stderr_seen.push(line);
                            }
                            _ => stderr_open = false,
                        },
                    }
                }
            })
            .await;

        match ready {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                while stderr_open {
                    match timeout(Duration::from_secs(1), stderr.next_line()).await {
                        Ok(Ok(Some(line))) => stderr_seen.push(line),
                        _ => stderr_open = false,
                    }
                }
                let status = match timeout(Duration::from_secs(1), child.wait()).await {
                    Ok(Ok(status)) => status.to_string(),
                    _ => "unknown status".to_string(),
                };
                return Err(TunnelError::Exited {
                    status,
                    stderr: stderr_seen.join("\n").trim().to_string(),
                });
            }
            Ok(Err(e)) => return Err(TunnelError::Io(e)),
            Err(_) => return Err(TunnelError::NotReady(self.ready_timeout)),
        }

        // kubectl keeps logging per connection; its pipes must keep draining.
        let output_task = tokio::spawn(async move {
            tokio::join!(
                drain_lines(&mut stdout, "stdout"),
                drain_lines(&mut stderr, "stderr")
            );
        });

        let local_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, target.local_port));
        info!(service = %target.service, addr = %local_addr, "Tunnel ready");

        Ok(Tunnel {
            local_addr,
            forwarder: Some(child),
            output_task: Some(output_task),
            kubeconfig,
        })
    }
}

async fn drain_lines<R>(lines: &mut tokio::io::Lines<BufReader<R>>, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(stream, line = %line, "port-forward");
    }
}
