//! Shared helpers for live-cluster tests

use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::{Api, DeleteParams};
use kube::Client;

/// Client for the cluster in `KUBECONFIG`
pub async fn test_client() -> Client {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    Client::try_default()
        .await
        .expect("a reachable cluster in KUBECONFIG is required for these tests")
}

/// Name unique to this test run
pub fn unique_name(prefix: &str) -> String {
    format!(
        "{}-{}",
        prefix,
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )
}

/// Best-effort removal of a binding created by a test
pub async fn delete_binding(client: &Client, name: &str) {
    let api: Api<ClusterRoleBinding> = Api::all(client.clone());
    let _ = api.delete(name, &DeleteParams::default()).await;
}
