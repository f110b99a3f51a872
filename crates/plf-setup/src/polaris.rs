//! Polaris adapter for [`CatalogService`]
//!
//! Deploy and bootstrap act on the cluster through kube-rs; catalog,
//! namespace and table calls go to the REST API with a bearer token obtained
//! through the client-credentials flow.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::catalog::{CatalogError, CatalogService, CatalogSpec, Principal, TableIdent, TableInfo};
use crate::kube_utils::{self, JobOutcome};
use crate::manifests::{render_bootstrap, render_polaris, ManifestVars};
use crate::SetupError;

const NAMESPACE: &str = "polaris";
const BOOTSTRAP_JOB: &str = "polaris-bootstrap";
const BOOTSTRAP_SECRET: &str = "polaris-bootstrap-credentials";
const REALM_HEADER: &str = "Polaris-Realm";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for the in-cluster Polaris
#[derive(Clone, Debug)]
pub struct PolarisConfig {
    /// Base URL reachable from the host, e.g. `http://localhost:18181`
    pub url: String,
    pub realm: String,
    pub kubeconfig: PathBuf,
    /// Bound on bootstrap job completion
    pub job_timeout: Duration,
    pub manifest_vars: ManifestVars,
}

struct CachedToken {
    client_id: String,
    token: String,
}

/// Polaris running in the local cluster
pub struct PolarisService {
    config: PolarisConfig,
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl PolarisService {
    pub fn new(config: PolarisConfig) -> Result<Self, CatalogError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(transport)?;
        Ok(Self {
            config,
            http,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    async fn kube_client(&self) -> Result<kube::Client, CatalogError> {
        kube_utils::create_client(&self.config.kubeconfig)
            .await
            .map_err(deploy_err)
    }

    async fn access_token(&self, principal: &Principal) -> Result<String, CatalogError> {
        let mut cached = self.token.lock().await;
        if let Some(t) = cached.as_ref().filter(|t| t.client_id == principal.client_id) {
            return Ok(t.token.clone());
        }

        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", principal.client_id.as_str()),
            ("client_secret", principal.client_secret.as_str()),
            ("scope", "PRINCIPAL_ROLE:ALL"),
        ];
        let resp = self
            .http
            .post(self.url("/api/catalog/v1/oauth/tokens"))
            .header(REALM_HEADER, &principal.realm)
            .form(&form)
            .send()
            .await
            .map_err(transport)?;
        let body: TokenResponse = check(resp, "access token").await?.json().await.map_err(transport)?;

        *cached = Some(CachedToken {
            client_id: principal.client_id.clone(),
            token: body.access_token.clone(),
        });
        Ok(body.access_token)
    }

    async fn request(
        &self,
        principal: &Principal,
        method: Method,
        path: &str,
    ) -> Result<RequestBuilder, CatalogError> {
        let token = self.access_token(principal).await?;
        Ok(self
            .http
            .request(method, self.url(path))
            .bearer_auth(token)
            .header(REALM_HEADER, &principal.realm))
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<Response, CatalogError> {
        let resp = builder.send().await.map_err(transport)?;
        check(resp, what).await
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct NamespaceList {
    #[serde(default)]
    namespaces: Vec<Vec<String>>,
}

#[derive(Deserialize)]
struct TableList {
    #[serde(default)]
    identifiers: Vec<TableIdentifier>,
}

#[derive(Deserialize)]
struct TableIdentifier {
    namespace: Vec<String>,
    name: String,
}

fn transport(e: reqwest::Error) -> CatalogError {
    CatalogError::Transport {
        message: e.to_string(),
    }
}

fn deploy_err(e: SetupError) -> CatalogError {
    CatalogError::deploy(e.to_string())
}

/// Map a non-success HTTP status onto a catalog error
pub fn status_error(status: StatusCode, what: &str, body: String) -> CatalogError {
    match status {
        StatusCode::CONFLICT => CatalogError::AlreadyExists {
            what: what.to_string(),
        },
        StatusCode::NOT_FOUND => CatalogError::NotFound {
            what: what.to_string(),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CatalogError::Unauthorized { message: body },
        _ => CatalogError::Http {
            status: status.as_u16(),
            message: body,
        },
    }
}

async fn check(resp: Response, what: &str) -> Result<Response, CatalogError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(status, what, body))
}

/// Request body for creating an internal catalog on S3-compatible storage
pub fn catalog_body(spec: &CatalogSpec) -> Value {
    let base = format!("s3://{}", spec.bucket);
    json!({
        "catalog": {
            "name": spec.name,
            "type": "INTERNAL",
            "readOnly": false,
            "properties": {
                "default-base-location": base,
            },
            "storageConfigInfo": {
                "storageType": "S3",
                "allowedLocations": [format!("{}/", base)],
                "endpoint": spec.storage_endpoint,
                "endpointInternal": spec.storage_endpoint,
                "region": spec.region,
                "pathStyleAccess": true,
                "stsUnavailable": true,
            }
        }
    })
}

/// Metadata and base locations from a load-table response
pub fn table_info(ident: &TableIdent, body: &Value) -> TableInfo {
    let str_at = |ptr: &str| body.pointer(ptr).and_then(Value::as_str).map(str::to_string);
    TableInfo {
        ident: ident.clone(),
        metadata_location: str_at("/metadata-location"),
        location: str_at("/metadata/location"),
    }
}

#[async_trait]
impl CatalogService for PolarisService {
    async fn deploy(&self) -> Result<(), CatalogError> {
        let manifests = render_polaris(&self.config.manifest_vars).map_err(deploy_err)?;
        let client = self.kube_client().await?;
        kube_utils::apply_manifests(&client, &manifests)
            .await
            .map_err(deploy_err)?;
        info!("Polaris manifests applied");
        Ok(())
    }

    async fn bootstrap(&self) -> Result<Principal, CatalogError> {
        let client = self.kube_client().await?;
        let secret = |key: &'static str| {
            let client = client.clone();
            async move {
                kube_utils::get_secret_string(&client, BOOTSTRAP_SECRET, NAMESPACE, key)
                    .await
                    .map_err(deploy_err)
            }
        };

        // Reuse credentials from an earlier attempt so the principal is stable
        let existing = match (secret("realm").await?, secret("clientId").await?, secret("clientSecret").await?) {
            (Some(realm), Some(client_id), Some(client_secret)) => Some(Principal {
                realm,
                client_id,
                client_secret,
            }),
            _ => None,
        };

        let outcome = kube_utils::job_outcome(&client, BOOTSTRAP_JOB, NAMESPACE)
            .await
            .map_err(deploy_err)?;
        if let (Some(JobOutcome::Succeeded), Some(principal)) = (outcome, existing.as_ref()) {
            debug!("bootstrap job already succeeded");
            return Ok(principal.clone());
        }
        if outcome == Some(JobOutcome::Failed) {
            info!("Removing failed bootstrap job");
            kube_utils::delete_job(&client, BOOTSTRAP_JOB, NAMESPACE, self.config.job_timeout)
                .await
                .map_err(deploy_err)?;
        }

        let principal = existing.unwrap_or_else(|| Principal::generate(&self.config.realm));
        let manifests =
            render_bootstrap(&self.config.manifest_vars, &principal).map_err(deploy_err)?;
        kube_utils::apply_manifests(&client, &manifests)
            .await
            .map_err(deploy_err)?;
        kube_utils::wait_for_job(&client, BOOTSTRAP_JOB, NAMESPACE, self.config.job_timeout)
            .await
            .map_err(deploy_err)?;
        info!(realm = %principal.realm, "Polaris bootstrapped");
        Ok(principal)
    }

    async fn create_catalog(
        &self,
        principal: &Principal,
        spec: &CatalogSpec,
    ) -> Result<(), CatalogError> {
        let what = format!("catalog {}", spec.name);
        let created = self
            .send(
                self.request(principal, Method::POST, "/api/management/v1/catalogs")
                    .await?
                    .json(&catalog_body(spec)),
                &what,
            )
            .await;
        match created {
            Ok(_) => info!(catalog = %spec.name, "Catalog created"),
            Err(e) if e.is_already_exists() => debug!(catalog = %spec.name, "catalog exists"),
            Err(e) => return Err(e),
        }

        // Grant is idempotent; apply it on every call so a crash between
        // create and grant heals on resume
        let grant = json!({"grant": {"type": "catalog", "privilege": "CATALOG_MANAGE_CONTENT"}});
        let path = format!(
            "/api/management/v1/catalogs/{}/catalog-roles/catalog_admin/grants",
            spec.name
        );
        self.send(
            self.request(principal, Method::PUT, &path).await?.json(&grant),
            &format!("grant on {}", what),
        )
        .await?;
        Ok(())
    }

    async fn create_namespace(
        &self,
        principal: &Principal,
        catalog: &str,
        namespace: &str,
    ) -> Result<(), CatalogError> {
        let path = format!("/api/catalog/v1/{}/namespaces", catalog);
        let body = json!({"namespace": namespace.split('.').collect::<Vec<_>>(), "properties": {}});
        self.send(
            self.request(principal, Method::POST, &path).await?.json(&body),
            &format!("namespace {}", namespace),
        )
        .await?;
        Ok(())
    }

    async fn create_table(
        &self,
        principal: &Principal,
        catalog: &str,
        ident: &TableIdent,
        schema: &Value,
    ) -> Result<(), CatalogError> {
        let path = format!("/api/catalog/v1/{}/namespaces/{}/tables", catalog, ident.namespace);
        let body = json!({"name": ident.name, "schema": schema});
        self.send(
            self.request(principal, Method::POST, &path).await?.json(&body),
            &format!("table {}", ident),
        )
        .await?;
        Ok(())
    }

    async fn list_namespaces(
        &self,
        principal: &Principal,
        catalog: &str,
    ) -> Result<Vec<String>, CatalogError> {
        let path = format!("/api/catalog/v1/{}/namespaces", catalog);
        let list: NamespaceList = self
            .send(self.request(principal, Method::GET, &path).await?, "namespaces")
            .await?
            .json()
            .await
            .map_err(transport)?;
        Ok(list.namespaces.into_iter().map(|parts| parts.join(".")).collect())
    }

    async fn list_tables(
        &self,
        principal: &Principal,
        catalog: &str,
        namespace: &str,
    ) -> Result<Vec<TableIdent>, CatalogError> {
        let path = format!("/api/catalog/v1/{}/namespaces/{}/tables", catalog, namespace);
        let list: TableList = self
            .send(
                self.request(principal, Method::GET, &path).await?,
                &format!("namespace {}", namespace),
            )
            .await?
            .json()
            .await
            .map_err(transport)?;
        Ok(list
            .identifiers
            .into_iter()
            .map(|id| TableIdent::new(id.namespace.join("."), id.name))
            .collect())
    }

    async fn load_table(
        &self,
        principal: &Principal,
        catalog: &str,
        ident: &TableIdent,
    ) -> Result<TableInfo, CatalogError> {
        let path = format!(
            "/api/catalog/v1/{}/namespaces/{}/tables/{}",
            catalog, ident.namespace, ident.name
        );
        let body: Value = self
            .send(
                self.request(principal, Method::GET, &path).await?,
                &format!("table {}", ident),
            )
            .await?
            .json()
            .await
            .map_err(transport)?;
        Ok(table_info(ident, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_maps_to_already_exists() {
        let err = status_error(StatusCode::CONFLICT, "catalog polardb", String::new());
        assert!(err.is_already_exists());
        assert_eq!(err.to_string(), "catalog polardb already exists");
    }

    #[test]
    fn auth_and_server_errors_are_classified() {
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, "x", "denied".into()),
            CatalogError::Unauthorized { .. }
        ));
        let server = status_error(StatusCode::BAD_GATEWAY, "x", "upstream".into());
        assert!(server.is_retryable());
        let client = status_error(StatusCode::BAD_REQUEST, "x", "bad".into());
        assert!(!client.is_retryable());
    }

    #[test]
    fn catalog_body_points_at_the_bucket() {
        let body = catalog_body(&CatalogSpec {
            name: "polardb".into(),
            bucket: "polardb".into(),
            storage_endpoint: "http://rustfs.rustfs:19000".into(),
            region: "us-east-1".into(),
        });
        assert_eq!(body["catalog"]["properties"]["default-base-location"], "s3://polardb");
        assert_eq!(
            body["catalog"]["storageConfigInfo"]["allowedLocations"][0],
            "s3://polardb/"
        );
        assert_eq!(body["catalog"]["type"], "INTERNAL");
    }

    #[test]
    fn load_table_response_yields_locations() {
        let ident = TableIdent::new("wildlife", "penguins");
        let body = json!({
            "metadata-location": "s3://polardb/wildlife/penguins/metadata/00001-abc.metadata.json",
            "metadata": {"location": "s3://polardb/wildlife/penguins"}
        });
        let info = table_info(&ident, &body);
        assert_eq!(info.location.as_deref(), Some("s3://polardb/wildlife/penguins"));
        assert!(info.metadata_location.unwrap().ends_with(".metadata.json"));

        let empty = table_info(&ident, &json!({}));
        assert_eq!(empty.metadata_location, None);
    }
}
