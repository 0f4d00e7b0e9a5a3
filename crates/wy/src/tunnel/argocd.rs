//! ArgoCD-style cluster secrets.
//!
//! A cluster secret stores `name`, `server`, `namespaces` and a JSON `config`
//! blob under its base64 `data`. This module turns one into a standalone
//! kubeconfig that kubectl can use to reach the described cluster.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::process::Command;
use tracing::debug;

const AWS_AUTH_COMMAND: &str = "argocd-k8s-auth";
const EXEC_API_VERSION: &str = "client.authentication.k8s.io/v1beta1";

#[derive(Debug, thiserror::Error)]
pub enum ClusterSecretError {
    #[error("invalid cluster secret reference {0:?}, expected [namespace/]name")]
    InvalidRef(String),
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("kubectl could not read secret {secret}: {stderr}")]
    Kubectl { secret: SecretRef, stderr: String },
    #[error("malformed secret: {0}")]
    Json(#[from] serde_json::Error),
    #[error("secret field {field:?} is not valid base64: {source}")]
    Base64 {
        field: String,
        #[source]
        source: base64::DecodeError,
    },
    #[error("secret field {field:?} is not valid UTF-8")]
    Utf8 { field: String },
    #[error("cluster secret has no server")]
    MissingServer,
    #[error("failed to render kubeconfig: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// `[namespace/]name` of a secret; the namespace defaults to `default`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

impl FromStr for SecretRef {
    type Err = ClusterSecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ClusterSecretError::InvalidRef(s.to_string());
        let (namespace, name) = match s.split_once('/') {
            Some((ns, name)) => (ns, name),
            None => ("default", s),
        };
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return Err(invalid());
        }
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub bearer_token: Option<String>,
    pub tls_client_config: TlsClientConfig,
    pub aws_auth_config: Option<AwsAuthConfig>,
    pub exec_provider_config: Option<ExecProviderConfig>,
}

/// Certificate material is kept base64 encoded, exactly as stored.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsClientConfig {
    pub insecure: bool,
    pub server_name: Option<String>,
    pub ca_data: Option<String>,
    pub cert_data: Option<String>,
    pub key_data: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AwsAuthConfig {
    pub cluster_name: String,
    #[serde(rename = "roleARN")]
    pub role_arn: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecProviderConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub api_version: Option<String>,
    pub install_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub name: String,
    pub server: String,
    pub namespaces: Vec<String>,
    pub config: ClusterConfig,
}

#[derive(Deserialize)]
struct SecretObject {
    #[serde(default)]
    data: BTreeMap<String, String>,
}

impl Cluster {
    /// Parses `kubectl get secret -o json` output.
    pub fn from_secret_json(json: &[u8]) -> Result<Self, ClusterSecretError> {
        let secret: SecretObject = serde_json::from_slice(json)?;
        let mut data = BTreeMap::new();
        for (field, encoded) in secret.data {
            let decoded = STANDARD
                .decode(encoded.trim())
                .map_err(|source| ClusterSecretError::Base64 {
                    field: field.clone(),
                    source,
                })?;
            data.insert(field, decoded);
        }
        Self::from_secret_data(&data)
    }

    /// Builds a cluster from already decoded secret data.
    pub fn from_secret_data(data: &BTreeMap<String, Vec<u8>>) -> Result<Self, ClusterSecretError> {
        let text = |field: &str| -> Result<String, ClusterSecretError> {
            match data.get(field) {
                Some(raw) => String::from_utf8(raw.clone()).map_err(|_| ClusterSecretError::Utf8 {
                    field: field.to_string(),
                }),
                None => Ok(String::new()),
            }
        };

        let server = text("server")?.trim_end_matches('/').to_string();
        if server.is_empty() {
            return Err(ClusterSecretError::MissingServer);
        }

        let namespaces = text("namespaces")?
            .split(',')
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .map(str::to_string)
            .collect();

        let config = match data.get("config") {
            Some(raw) if !raw.is_empty() => serde_json::from_slice(raw)?,
            _ => ClusterConfig::default(),
        };

        Ok(Self {
            name: text("name")?,
            server,
            namespaces,
            config,
        })
    }

    fn context_name(&self) -> &str {
        if self.name.is_empty() {
            "argocd-cluster"
        } else {
            &self.name
        }
    }

    /// Single-context kubeconfig pointing at this cluster.
    pub fn to_kubeconfig(&self, namespace: &str) -> Kubeconfig {
        let name = self.context_name().to_string();
        let tls = &self.config.tls_client_config;

        let exec = if let Some(aws) = &self.config.aws_auth_config {
            let mut args = vec![
                "aws".to_string(),
                "--cluster-name".to_string(),
                aws.cluster_name.clone(),
            ];
            if let Some(role) = &aws.role_arn {
                args.push("--role-arn".to_string());
                args.push(role.clone());
            }
            Some(ExecConfig {
                api_version: EXEC_API_VERSION.to_string(),
                command: AWS_AUTH_COMMAND.to_string(),
                args,
                env: Vec::new(),
                install_hint: None,
            })
        } else {
            self.config.exec_provider_config.as_ref().map(|exec| ExecConfig {
                api_version: exec
                    .api_version
                    .clone()
                    .unwrap_or_else(|| EXEC_API_VERSION.to_string()),
                command: exec.command.clone(),
                args: exec.args.clone(),
                env: exec
                    .env
                    .iter()
                    .map(|(name, value)| ExecEnvVar {
                        name: name.clone(),
                        value: value.clone(),
                    })
                    .collect(),
                install_hint: exec.install_hint.clone(),
            })
        };

        Kubeconfig {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: name.clone(),
                cluster: KubeCluster {
                    server: self.server.clone(),
                    certificate_authority_data: tls.ca_data.clone(),
                    insecure_skip_tls_verify: tls.insecure,
                    tls_server_name: tls.server_name.clone(),
                },
            }],
            users: vec![NamedUser {
                name: name.clone(),
                user: KubeUser {
                    token: self.config.bearer_token.clone(),
                    username: self.config.username.clone(),
                    password: self.config.password.clone(),
                    client_certificate_data: tls.cert_data.clone(),
                    client_key_data: tls.key_data.clone(),
                    exec,
                },
            }],
            contexts: vec![NamedContext {
                name: name.clone(),
                context: KubeContext {
                    cluster: name.clone(),
                    user: name.clone(),
                    namespace: namespace.to_string(),
                },
            }],
            current_context: name,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub clusters: Vec<NamedCluster>,
    pub users: Vec<NamedUser>,
    pub contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    pub current_context: String,
}

impl Kubeconfig {
    pub fn to_yaml(&self) -> Result<String, ClusterSecretError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: KubeCluster,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct KubeCluster {
    pub server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub insecure_skip_tls_verify: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_server_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NamedUser {
    pub name: String,
    pub user: KubeUser,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct KubeUser {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_certificate_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecConfig>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecConfig {
    pub api_version: String,
    pub command: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<ExecEnvVar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_hint: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecEnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NamedContext {
    pub name: String,
    pub context: KubeContext,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct KubeContext {
    pub cluster: String,
    pub user: String,
    pub namespace: String,
}

/// Reads a cluster secret through kubectl.
pub async fn fetch_cluster(
    kubectl: &str,
    base_args: &[String],
    kubeconfig: Option<&Path>,
    secret: &SecretRef,
) -> Result<Cluster, ClusterSecretError> {
    let mut cmd = Command::new(kubectl);
    cmd.args(base_args)
        .arg("get")
        .arg("secret")
        .arg(&secret.name)
        .arg("--namespace")
        .arg(&secret.namespace)
        .arg("--output")
        .arg("json");
    if let Some(path) = kubeconfig {
        cmd.arg("--kubeconfig").arg(path);
    }

    debug!(%secret, "Fetching cluster secret");
    let output = cmd.output().await.map_err(|source| ClusterSecretError::Spawn {
        program: kubectl.to_string(),
        source,
    })?;

    if !output.status.success() {
        return Err(ClusterSecretError::Kubectl {
            secret: secret.clone(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Cluster::from_secret_json(&output.stdout)
}
