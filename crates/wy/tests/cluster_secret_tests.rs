use base64::{engine::general_purpose::STANDARD, Engine};
use serde_yaml::Value;
use wy::tunnel::argocd::{fetch_cluster, Cluster, ClusterSecretError, SecretRef};

fn secret_json(fields: &[(&str, &str)]) -> String {
    let data: serde_json::Map<String, serde_json::Value> = fields
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::from(STANDARD.encode(v))))
        .collect();
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "name": "prod", "namespace": "argocd" },
        "data": data,
    })
    .to_string()
}

const TOKEN_CONFIG: &str = r#"{
    "bearerToken": "s3cr3t",
    "tlsClientConfig": { "insecure": false, "caData": "Q0EtREFUQQ==", "serverName": "kube.internal" }
}"#;

#[test]
fn secret_ref_defaults_to_default_namespace() {
    assert_eq!(
        "prod".parse::<SecretRef>().unwrap(),
        SecretRef {
            namespace: "default".to_string(),
            name: "prod".to_string()
        }
    );
    let scoped: SecretRef = "argocd/prod".parse().unwrap();
    assert_eq!(scoped.namespace, "argocd");
    assert_eq!(scoped.name, "prod");
    assert_eq!(scoped.to_string(), "argocd/prod");

    assert!("a/b/c".parse::<SecretRef>().is_err());
    assert!("/prod".parse::<SecretRef>().is_err());
    assert!("".parse::<SecretRef>().is_err());
}

#[test]
fn decodes_cluster_fields() {
    let json = secret_json(&[
        ("name", "prod"),
        ("server", "https://kube.example.com/"),
        ("namespaces", "apps, web ,,"),
        ("config", TOKEN_CONFIG),
    ]);
    let cluster = Cluster::from_secret_json(json.as_bytes()).unwrap();

    assert_eq!(cluster.name, "prod");
    assert_eq!(cluster.server, "https://kube.example.com");
    assert_eq!(cluster.namespaces, vec!["apps", "web"]);
    assert_eq!(cluster.config.bearer_token.as_deref(), Some("s3cr3t"));
    assert_eq!(
        cluster.config.tls_client_config.ca_data.as_deref(),
        Some("Q0EtREFUQQ==")
    );
}

#[test]
fn renders_token_kubeconfig() {
    let json = secret_json(&[
        ("name", "prod"),
        ("server", "https://kube.example.com"),
        ("config", TOKEN_CONFIG),
    ]);
    let cluster = Cluster::from_secret_json(json.as_bytes()).unwrap();
    let yaml = cluster.to_kubeconfig("team-a").to_yaml().unwrap();
    let doc: Value = serde_yaml::from_str(&yaml).unwrap();

    assert_eq!(doc["apiVersion"], Value::from("v1"));
    assert_eq!(doc["kind"], Value::from("Config"));
    assert_eq!(doc["current-context"], Value::from("prod"));
    assert_eq!(
        doc["clusters"][0]["cluster"]["server"],
        Value::from("https://kube.example.com")
    );
    assert_eq!(
        doc["clusters"][0]["cluster"]["certificate-authority-data"],
        Value::from("Q0EtREFUQQ==")
    );
    assert_eq!(
        doc["clusters"][0]["cluster"]["tls-server-name"],
        Value::from("kube.internal")
    );
    assert!(doc["clusters"][0]["cluster"]
        .get("insecure-skip-tls-verify")
        .is_none());
    assert_eq!(doc["users"][0]["user"]["token"], Value::from("s3cr3t"));
    assert_eq!(
        doc["contexts"][0]["context"]["namespace"],
        Value::from("team-a")
    );
}

#[test]
fn aws_auth_becomes_exec_plugin() {
    let json = secret_json(&[
        ("server", "https://eks.example.com"),
        (
            "config",
            r#"{"awsAuthConfig": {"clusterName": "eks-prod", "roleARN": "arn:aws:iam::1:role/x"}}"#,
        ),
    ]);
    let kubeconfig = Cluster::from_secret_json(json.as_bytes())
        .unwrap()
        .to_kubeconfig("default");

    assert_eq!(kubeconfig.current_context, "argocd-cluster");
    let exec = kubeconfig.users[0].user.exec.as_ref().unwrap();
    assert_eq!(exec.command, "argocd-k8s-auth");
    assert_eq!(
        exec.args,
        vec![
            "aws",
            "--cluster-name",
            "eks-prod",
            "--role-arn",
            "arn:aws:iam::1:role/x"
        ]
    );
}

#[test]
fn exec_provider_is_passed_through() {
    let json = secret_json(&[
        ("server", "https://gke.example.com"),
        (
            "config",
            r#"{"execProviderConfig": {"command": "gke-gcloud-auth-plugin", "args": ["--v", "1"], "env": {"FOO": "bar"}, "apiVersion": "client.authentication.k8s.io/v1"}}"#,
        ),
    ]);
    let kubeconfig = Cluster::from_secret_json(json.as_bytes())
        .unwrap()
        .to_kubeconfig("default");

    let exec = kubeconfig.users[0].user.exec.as_ref().unwrap();
    assert_eq!(exec.command, "gke-gcloud-auth-plugin");
    assert_eq!(exec.api_version, "client.authentication.k8s.io/v1");
    assert_eq!(exec.env.len(), 1);
    assert_eq!(exec.env[0].name, "FOO");
    assert_eq!(exec.env[0].value, "bar");
}

#[test]
fn rejects_unusable_secrets() {
    let json = secret_json(&[("name", "no-server")]);
    assert!(matches!(
        Cluster::from_secret_json(json.as_bytes()),
        Err(ClusterSecretError::MissingServer)
    ));

    let bad = r#"{"data": {"server": "%%%not-base64"}}"#;
    assert!(matches!(
        Cluster::from_secret_json(bad.as_bytes()),
        Err(ClusterSecretError::Base64 { .. })
    ));

    let json = secret_json(&[("server", "https://x"), ("config", "{not json")]);
    assert!(matches!(
        Cluster::from_secret_json(json.as_bytes()),
        Err(ClusterSecretError::Json(_))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn fetches_secret_through_kubectl() {
    let json = secret_json(&[("server", "https://kube.example.com"), ("config", TOKEN_CONFIG)]);
    let script = format!("printf '%s' '{}'", json);
    let secret: SecretRef = "argocd/prod".parse().unwrap();

    let cluster = fetch_cluster(
        "sh",
        &["-c".to_string(), script, "kubectl".to_string()],
        None,
        &secret,
    )
    .await
    .unwrap();
    assert_eq!(cluster.server, "https://kube.example.com");
}

#[cfg(unix)]
#[tokio::test]
async fn kubectl_failure_carries_stderr() {
    let secret: SecretRef = "missing".parse().unwrap();
    let err = fetch_cluster(
        "sh",
        &[
            "-c".to_string(),
            "echo 'secrets \"missing\" not found' >&2; exit 1".to_string(),
            "kubectl".to_string(),
        ],
        None,
        &secret,
    )
    .await
    .unwrap_err();

    match err {
        ClusterSecretError::Kubectl { secret, stderr } => {
            assert_eq!(secret.to_string(), "default/missing");
            assert!(stderr.contains("not found"));
        }
        other => panic!("expected kubectl error, got {:?}", other),
    }
}
