//! Azure credentials: static operator-wide flags or a per-cluster Secret.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, ResourceExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use super::backpressure::GateKey;
use crate::crd::ManagedCluster;
use crate::error::{Result, SroError};

const ARM_SCOPE: &str = "https://management.azure.com/.default";

/// Refresh tokens this long before they expire.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

/// Produces bearer tokens for ARM requests.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn bearer_token(&self) -> Result<String>;
}

/// Resolved credentials for one cluster.
#[derive(Clone)]
pub struct Credentials {
    pub subscription_id: String,
    pub tenant_id: String,
    pub client_id: String,
    pub authorizer: Arc<dyn Authorizer>,
}

impl Credentials {
    /// Rate-limit domain these credentials call into.
    pub fn gate_key(&self) -> GateKey {
        GateKey {
            subscription_id: self.subscription_id.clone(),
            principal: format!("{}/{}", self.tenant_id, self.client_id),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("subscription_id", &self.subscription_id)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// Source of credentials for a cluster.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_credentials(&self, cluster: &ManagedCluster) -> Result<Credentials>;
}

/// Service principal secret material.
#[derive(Clone)]
pub struct ServicePrincipal {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub subscription_id: String,
}

/// OAuth2 client-credentials token source with an in-memory token cache.
pub struct ClientSecretAuthorizer {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: SecretString,
    cached: Mutex<Option<CachedToken>>,
}

#[derive(Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(deserialize_with = "de_expires_in")]
    expires_in: i64,
}

/// Azure AD returns `expires_in` as a number or a numeric string.
fn de_expires_in<'de, D: serde::Deserializer<'de>>(d: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(i64),
        Str(String),
    }
    match NumOrStr::deserialize(d)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

impl ClientSecretAuthorizer {
    pub fn new(login_endpoint: &str, sp: &ServicePrincipal, http: reqwest::Client) -> Self {
        Self {
            http,
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                login_endpoint.trim_end_matches('/'),
                sp.tenant_id
            ),
            client_id: sp.client_id.clone(),
            client_secret: sp.client_secret.clone(),
            cached: Mutex::new(None),
        }
    }

    async fn fetch_token(&self) -> Result<CachedToken> {
        debug!(client_id = %self.client_id, "Requesting Azure AD token");
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("scope", ARM_SCOPE),
        ];
        let resp = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| SroError::Credentials(format!("token request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SroError::Credentials(format!(
                "token endpoint returned {status}: {}",
                body.chars().take(256).collect::<String>()
            )));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| SroError::Credentials(format!("invalid token response: {e}")))?;

        Ok(CachedToken {
            value: token.access_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in.max(0)),
        })
    }
}

#[async_trait]
impl Authorizer for ClientSecretAuthorizer {
    async fn bearer_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token_is_fresh(token.expires_at, Utc::now())
        {
            return Ok(token.value.clone());
        }
        let token = self.fetch_token().await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }
}

fn token_is_fresh(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now + Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) < expires_at
}

fn credentials_from(sp: &ServicePrincipal, login_endpoint: &str, http: &reqwest::Client) -> Credentials {
    Credentials {
        subscription_id: sp.subscription_id.clone(),
        tenant_id: sp.tenant_id.clone(),
        client_id: sp.client_id.clone(),
        authorizer: Arc::new(ClientSecretAuthorizer::new(login_endpoint, sp, http.clone())),
    }
}

/// Credentials supplied once through operator flags.
pub struct StaticCredentialProvider {
    principal: ServicePrincipal,
    login_endpoint: String,
    http: reqwest::Client,
}

impl StaticCredentialProvider {
    pub fn new(principal: ServicePrincipal, login_endpoint: &str, http: reqwest::Client) -> Self {
        Self {
            principal,
            login_endpoint: login_endpoint.to_string(),
            http,
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get_credentials(&self, cluster: &ManagedCluster) -> Result<Credentials> {
        let mut creds = credentials_from(&self.principal, &self.login_endpoint, &self.http);
        if let Some(sub) = &cluster.spec.subscription_id {
            creds.subscription_id.clone_from(sub);
        }
        Ok(creds)
    }
}

/// Credentials read from the cluster's `credentialsSecretRef`.
pub struct SecretCredentialProvider {
    client: kube::Client,
    login_endpoint: String,
    http: reqwest::Client,
}

impl SecretCredentialProvider {
    pub fn new(client: kube::Client, login_endpoint: &str, http: reqwest::Client) -> Self {
        Self {
            client,
            login_endpoint: login_endpoint.to_string(),
            http,
        }
    }
}

/// Extract a service principal from Secret data.
pub fn principal_from_secret(secret: &Secret) -> Result<ServicePrincipal> {
    let name = secret.name_any();
    let get = |key: &str| -> Result<String> {
        secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .map(|v| String::from_utf8_lossy(&v.0).trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| SroError::Credentials(format!("secret {name} is missing key {key}")))
    };

    Ok(ServicePrincipal {
        tenant_id: get("tenantId")?,
        client_id: get("clientId")?,
        client_secret: SecretString::from(get("clientSecret")?),
        subscription_id: get("subscriptionId")?,
    })
}

#[async_trait]
impl CredentialProvider for SecretCredentialProvider {
    async fn get_credentials(&self, cluster: &ManagedCluster) -> Result<Credentials> {
        let secret_name = cluster.spec.credentials_secret_ref.as_deref().ok_or_else(|| {
            SroError::Credentials(format!(
                "cluster {} has no credentialsSecretRef",
                cluster.name_any()
            ))
        })?;
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let secret = secrets
            .get(secret_name)
            .await
            .map_err(|e| SroError::Credentials(format!("failed to read secret {secret_name}: {e}")))?;

        let sp = principal_from_secret(&secret)?;
        let mut creds = credentials_from(&sp, &self.login_endpoint, &self.http);
        if let Some(sub) = &cluster.spec.subscription_id {
            creds.subscription_id.clone_from(sub);
        }
        Ok(creds)
    }
}

/// Picks the per-cluster secret when referenced, the static flags otherwise.
pub struct ClusterCredentialProvider {
    static_provider: Option<StaticCredentialProvider>,
    secret_provider: SecretCredentialProvider,
}

impl ClusterCredentialProvider {
    pub const fn new(
        static_provider: Option<StaticCredentialProvider>,
        secret_provider: SecretCredentialProvider,
    ) -> Self {
        Self {
            static_provider,
            secret_provider,
        }
    }
}

#[async_trait]
impl CredentialProvider for ClusterCredentialProvider {
    async fn get_credentials(&self, cluster: &ManagedCluster) -> Result<Credentials> {
        if cluster.spec.credentials_secret_ref.is_some() {
            return self.secret_provider.get_credentials(cluster).await;
        }
        match &self.static_provider {
            Some(p) => p.get_credentials(cluster).await,
            None => Err(SroError::Credentials(format!(
                "cluster {} has no credentialsSecretRef and no static credentials are configured",
                cluster.name_any()
            ))),
        }
    }
}
