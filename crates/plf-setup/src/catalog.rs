//! Catalog service collaborator
//!
//! The REST table catalog runs inside the cluster. `deploy` and `bootstrap`
//! act on the cluster; everything else goes through the catalog's REST API
//! authenticated as the bootstrapped principal.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rand::Rng;
use serde::{Deserialize, Serialize};

use plf_common::fs::{read_optional, write_atomic};

/// Root credentials created by bootstrap
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub realm: String,
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Principal")
            .field("realm", &self.realm)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

fn random_hex(bytes: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..bytes).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
}

impl Principal {
    /// Fresh random credentials for `realm`
    pub fn generate(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            client_id: random_hex(8),
            client_secret: random_hex(16),
        }
    }

    /// Parse `realm,client_id,client_secret`
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim().split(',');
        let realm = parts.next()?.trim();
        let client_id = parts.next()?.trim();
        let client_secret = parts.next()?.trim();
        if parts.next().is_some() || realm.is_empty() || client_id.is_empty() || client_secret.is_empty()
        {
            return None;
        }
        Some(Self {
            realm: realm.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }

    pub fn to_line(&self) -> String {
        format!("{},{},{}", self.realm, self.client_id, self.client_secret)
    }
}

/// `<work_dir>/work/principal.txt`
#[derive(Clone, Debug)]
pub struct PrincipalFile {
    path: PathBuf,
}

impl PrincipalFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_work_dir(work_dir: &Path) -> Self {
        Self::new(work_dir.join("work").join("principal.txt"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, principal: &Principal) -> plf_common::Result<()> {
        write_atomic(&self.path, format!("{}\n", principal.to_line()).as_bytes())
    }

    /// `None` when the file does not exist yet
    pub fn load(&self) -> plf_common::Result<Option<Principal>> {
        match read_optional(&self.path)? {
            None => Ok(None),
            Some(text) => Principal::parse(&text).map(Some).ok_or_else(|| {
                plf_common::Error::corrupt_state(&self.path, "expected realm,client_id,client_secret")
            }),
        }
    }
}

/// `namespace.table`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableIdent {
    pub namespace: String,
    pub name: String,
}

impl TableIdent {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// A loaded table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableInfo {
    pub ident: TableIdent,
    /// Absolute URI of the current root metadata document
    pub metadata_location: Option<String>,
    /// Table base location
    pub location: Option<String>,
}

/// Catalog to create in the service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogSpec {
    pub name: String,
    /// Bucket backing the catalog's default base location
    pub bucket: String,
    /// Object-store endpoint as seen from inside the cluster
    pub storage_endpoint: String,
    pub region: String,
}

/// Errors from the catalog service
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("{what} already exists")]
    AlreadyExists { what: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("deploy failed: {message}")]
    Deploy { message: String },
}

impl CatalogError {
    pub fn deploy(message: impl Into<String>) -> Self {
        CatalogError::Deploy {
            message: message.into(),
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, CatalogError::AlreadyExists { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            CatalogError::Transport { .. } => true,
            CatalogError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// The REST table catalog
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CatalogService: Send + Sync {
    /// Install the service into the cluster. Idempotent.
    async fn deploy(&self) -> Result<(), CatalogError>;

    /// Create the root principal. Re-invocation returns the same principal.
    async fn bootstrap(&self) -> Result<Principal, CatalogError>;

    /// Create a catalog and grant the root principal content access.
    async fn create_catalog(
        &self,
        principal: &Principal,
        spec: &CatalogSpec,
    ) -> Result<(), CatalogError>;

    async fn create_namespace(
        &self,
        principal: &Principal,
        catalog: &str,
        namespace: &str,
    ) -> Result<(), CatalogError>;

    async fn create_table(
        &self,
        principal: &Principal,
        catalog: &str,
        ident: &TableIdent,
        schema: &serde_json::Value,
    ) -> Result<(), CatalogError>;

    async fn list_namespaces(
        &self,
        principal: &Principal,
        catalog: &str,
    ) -> Result<Vec<String>, CatalogError>;

    async fn list_tables(
        &self,
        principal: &Principal,
        catalog: &str,
        namespace: &str,
    ) -> Result<Vec<TableIdent>, CatalogError>;

    async fn load_table(
        &self,
        principal: &Principal,
        catalog: &str,
        ident: &TableIdent,
    ) -> Result<TableInfo, CatalogError>;
}
