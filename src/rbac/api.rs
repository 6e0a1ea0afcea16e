//! Cluster API access for the reconciler

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::PostParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Connect timeout for reconciler clients
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read timeout for reconciler clients
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// A failed API call, classified by what the caller should do about it
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiFailure {
    /// The object already exists (create raced with someone else)
    #[error("already exists")]
    Conflict,

    /// Worth retrying: connection failures, 5xx, 429
    #[error("transient failure: {0}")]
    Transient(String),

    /// The server refused the request
    #[error("rejected ({code}): {message}")]
    Rejected {
        /// HTTP status code
        code: u16,
        /// Server message
        message: String,
    },
}

impl ApiFailure {
    /// Whether retrying may help
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<kube::Error> for ApiFailure {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict,
            kube::Error::Api(ae) if ae.code == 429 || ae.code >= 500 => {
                Self::Transient(format!("{} ({})", ae.message, ae.code))
            }
            kube::Error::Api(ae) => Self::Rejected {
                code: ae.code,
                message: ae.message,
            },
            other => Self::Transient(other.to_string()),
        }
    }
}

/// The API calls the reconciler makes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuthorizationApi: Send + Sync {
    /// Check the API answers; returns the server version
    async fn ping(&self) -> Result<String, ApiFailure>;

    /// Fetch a ClusterRoleBinding by name
    async fn get_cluster_role_binding(
        &self,
        name: &str,
    ) -> Result<Option<ClusterRoleBinding>, ApiFailure>;

    /// Create a ClusterRoleBinding
    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<(), ApiFailure>;

    /// Fetch a ServiceAccount by namespace and name
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, ApiFailure>;

    /// Create a ServiceAccount
    async fn create_service_account(&self, account: &ServiceAccount) -> Result<(), ApiFailure>;
}

/// [`AuthorizationApi`] backed by a kube client
#[derive(Clone)]
pub struct KubeAuthorizationApi {
    client: Client,
}

impl KubeAuthorizationApi {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from a connection bundle (mutual TLS)
    pub async fn from_bundle(path: &Path) -> Result<Self, String> {
        let kubeconfig = Kubeconfig::read_from(path)
            .map_err(|e| format!("failed to read bundle {}: {}", path.display(), e))?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| format!("failed to load bundle {}: {}", path.display(), e))?;
        config.connect_timeout = Some(CONNECT_TIMEOUT);
        config.read_timeout = Some(READ_TIMEOUT);
        let client =
            Client::try_from(config).map_err(|e| format!("failed to create client: {}", e))?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl AuthorizationApi for KubeAuthorizationApi {
    async fn ping(&self) -> Result<String, ApiFailure> {
        let info = self.client.apiserver_version().await?;
        Ok(info.git_version)
    }

    async fn get_cluster_role_binding(
        &self,
        name: &str,
    ) -> Result<Option<ClusterRoleBinding>, ApiFailure> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<(), ApiFailure> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        api.create(&PostParams::default(), binding).await?;
        Ok(())
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, ApiFailure> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<(), ApiFailure> {
        let namespace = account.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), account).await?;
        Ok(())
    }
}
