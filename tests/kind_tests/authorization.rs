//! Stories about the reconciler against a real API server

use std::collections::BTreeMap;

use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef as K8sRoleRef};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use trellis::identity::{builtin_identities, IdentityRegistry};
use trellis::rbac::{
    DesiredState, KubeAuthorizationApi, Reconciler, RoleBinding, RoleRef, MANAGED_BY_LABEL,
};

use super::helpers::{delete_binding, test_client, unique_name};

fn registry() -> IdentityRegistry {
    IdentityRegistry::new(&[], builtin_identities(&BTreeMap::new())).unwrap()
}

fn view_binding(name: &str) -> RoleBinding {
    RoleBinding {
        name: name.to_string(),
        role_ref: RoleRef {
            kind: "ClusterRole".to_string(),
            name: "view".to_string(),
        },
        subjects: vec!["sensu".to_string()],
    }
}

/// Story: a fresh cluster gets the monitoring binding, labelled as ours
#[tokio::test]
#[ignore]
async fn story_reconciler_creates_missing_binding() {
    let client = test_client().await;
    let name = unique_name("trellis-e2e-view");
    let state = TempDir::new().unwrap();
    let desired = DesiredState::resolve(&registry(), &[], &[view_binding(&name)]).unwrap();

    let report = Reconciler::new(
        KubeAuthorizationApi::new(client.clone()),
        desired,
        state.path().join("reconcile.done"),
    )
    .run(&CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(report.created, vec![format!("ClusterRoleBinding/{}", name)]);

    let api: Api<ClusterRoleBinding> = Api::all(client.clone());
    let created = api.get(&name).await.unwrap();
    assert_eq!(created.role_ref.name, "view");
    assert_eq!(
        created.metadata.labels.unwrap().get(MANAGED_BY_LABEL).map(String::as_str),
        Some("trellis")
    );

    delete_binding(&client, &name).await;
}

/// Story: an operator already bound the name differently; the reconciler
/// leaves their binding alone
#[tokio::test]
#[ignore]
async fn story_existing_binding_is_never_overwritten() {
    let client = test_client().await;
    let name = unique_name("trellis-e2e-existing");
    let api: Api<ClusterRoleBinding> = Api::all(client.clone());
    api.create(
        &PostParams::default(),
        &ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                ..Default::default()
            },
            role_ref: K8sRoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: "edit".to_string(),
            },
            subjects: None,
        },
    )
    .await
    .unwrap();

    let state = TempDir::new().unwrap();
    let desired = DesiredState::resolve(&registry(), &[], &[view_binding(&name)]).unwrap();
    let report = Reconciler::new(
        KubeAuthorizationApi::new(client.clone()),
        desired,
        state.path().join("reconcile.done"),
    )
    .run(&CancellationToken::new())
    .await
    .unwrap();

    assert!(report.created.is_empty());
    assert_eq!(api.get(&name).await.unwrap().role_ref.name, "edit");

    delete_binding(&client, &name).await;
}

/// Story: the job restarts after success and does nothing
#[tokio::test]
#[ignore]
async fn story_second_run_is_skipped_by_marker() {
    let client = test_client().await;
    let name = unique_name("trellis-e2e-marker");
    let state = TempDir::new().unwrap();
    let marker = state.path().join("reconcile.done");
    let desired = DesiredState::resolve(&registry(), &[], &[view_binding(&name)]).unwrap();

    let reconciler = Reconciler::new(KubeAuthorizationApi::new(client.clone()), desired, &marker);
    reconciler.run(&CancellationToken::new()).await.unwrap();
    let second = reconciler.run(&CancellationToken::new()).await.unwrap();

    assert!(second.skipped);

    delete_binding(&client, &name).await;
}
