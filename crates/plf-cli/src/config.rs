//! Project configuration from `<work_dir>/.env`
//!
//! The file is parsed into a map and never loaded into the process
//! environment, so the local object-store keys it holds cannot end up in
//! the AWS credential chain used for the cloud bucket. Lookups fall back to
//! the process environment for keys the file does not set.
//!
//! Layout under the work directory:
//! - `.env`: project settings
//! - `.snow-utils/setup-manifest.yaml`: setup run
//! - `.snow-utils/l2c-state.json`: migration state
//! - `work/principal.txt`: catalog principal
//! - `.kube/config`: cluster kubeconfig

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use plf_common::ResourceBase;
use plf_setup::manifests::ManifestVars;
use plf_setup::{CatalogSpec, TableIdent};

use crate::{Error, Result};

pub const ENV_FILE_NAME: &str = ".env";

pub const DEFAULT_K3S_VERSION: &str = "v1.31.5-k3s1";
pub const DEFAULT_POLARIS_URL: &str = "http://localhost:18181";
pub const DEFAULT_CATALOG_NAME: &str = "polardb";
pub const DEFAULT_REALM: &str = "POLARIS";
pub const DEFAULT_S3_ENDPOINT: &str = "http://localhost:19000";
pub const DEFAULT_ACCESS_KEY: &str = "admin";
pub const DEFAULT_SECRET_KEY: &str = "password";
pub const DEFAULT_SCHEMA: &str = "L2C";
pub const DEFAULT_DB_PASSWORD: &str = "polaris";

const POLARIS_VERSION: &str = "1.2.0-incubating";
const POLARIS_PORT: u16 = 18181;
const S3_PORT: u16 = 19000;
/// Object-store endpoint as seen from pods in the cluster
const IN_CLUSTER_S3_ENDPOINT: &str = "http://rustfs.rustfs:19000";
const CLUSTER_TIMEOUT: Duration = Duration::from_secs(300);
const SERVICE_TIMEOUT: Duration = Duration::from_secs(600);

/// Key/value pairs from the project `.env`
#[derive(Clone, Debug, Default)]
pub struct ProjectEnv {
    values: BTreeMap<String, String>,
}

impl ProjectEnv {
    /// Parse `<work_dir>/.env`; a missing file yields an empty map.
    pub fn load(work_dir: &Path) -> Result<Self> {
        let path = work_dir.join(ENV_FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let env_err = |e: dotenvy::Error| Error::Env {
            path: path.clone(),
            message: e.to_string(),
        };
        let mut values = BTreeMap::new();
        for item in dotenvy::from_path_iter(&path).map_err(env_err)? {
            let (key, value) = item.map_err(env_err)?;
            values.insert(key, value);
        }
        Ok(Self { values })
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// File value, then process environment. Empty values count as unset.
    pub fn get(&self, key: &str) -> Option<String> {
        self.values
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
            .filter(|v| !v.trim().is_empty())
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Set keys in `<work_dir>/.env`, replacing existing assignments in
    /// place and appending new ones. Comments and other lines are kept.
    pub fn persist(work_dir: &Path, updates: &[(&str, String)]) -> Result<()> {
        let path = work_dir.join(ENV_FILE_NAME);
        let mut contents = plf_common::fs::read_optional(&path)?.unwrap_or_default();
        for (key, value) in updates {
            contents = set_env_line(&contents, key, value);
        }
        plf_common::fs::write_atomic(&path, contents.as_bytes())?;
        Ok(())
    }
}

/// `contents` with `key` assigned `value`
pub fn set_env_line(contents: &str, key: &str, value: &str) -> String {
    let needs_quotes = value.is_empty() || value.contains(|c: char| c.is_whitespace() || c == '#');
    let line = if needs_quotes {
        format!("{}=\"{}\"", key, value.replace('"', "\\\""))
    } else {
        format!("{}={}", key, value)
    };

    let assigns = |l: &str| {
        let l = l.trim_start();
        let l = l.strip_prefix("export ").unwrap_or(l);
        l.split_once('=').is_some_and(|(k, _)| k.trim() == key)
    };

    let mut replaced = false;
    let mut lines: Vec<String> = contents
        .lines()
        .map(|l| {
            if !replaced && assigns(l) {
                replaced = true;
                line.clone()
            } else {
                l.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(line);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Settings resolved for one invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub work_dir: PathBuf,
    /// Work directory name; the project part of every cloud resource name
    pub project: String,
    pub cluster_name: String,
    pub container_runtime: Option<String>,
    pub k3s_version: String,
    pub polaris_url: String,
    pub catalog_name: String,
    pub realm: String,
    pub s3_endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub db_password: String,
    pub snowflake_user: Option<String>,
    pub snowflake_connection: Option<String>,
    pub aws_profile: Option<String>,
    pub aws_region: Option<String>,
    pub schema: String,
    pub role_arn: Option<String>,
}

impl Settings {
    pub fn resolve(work_dir: &Path, env: &ProjectEnv) -> Result<Self> {
        let work_dir = std::fs::canonicalize(work_dir).map_err(|e| {
            Error::validation(format!("work directory {}: {}", work_dir.display(), e))
        })?;
        let project = work_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::validation("work directory has no name to derive the project from"))?;

        Ok(Self {
            cluster_name: env.get_or("PLF_CLUSTER_NAME", &project),
            container_runtime: env.get("PLF_CONTAINER_RUNTIME"),
            k3s_version: env.get_or("K3S_VERSION", DEFAULT_K3S_VERSION),
            polaris_url: env.get_or("POLARIS_URL", DEFAULT_POLARIS_URL),
            catalog_name: env.get_or("PLF_POLARIS_CATALOG_NAME", DEFAULT_CATALOG_NAME),
            realm: env.get_or("PLF_POLARIS_REALM", DEFAULT_REALM),
            s3_endpoint: env.get_or("AWS_ENDPOINT_URL", DEFAULT_S3_ENDPOINT),
            access_key: env.get_or("AWS_ACCESS_KEY_ID", DEFAULT_ACCESS_KEY),
            secret_key: env.get_or("AWS_SECRET_ACCESS_KEY", DEFAULT_SECRET_KEY),
            db_password: env.get_or("PLF_DB_PASSWORD", DEFAULT_DB_PASSWORD),
            snowflake_user: env.get("SNOWFLAKE_USER"),
            snowflake_connection: env.get("SNOWFLAKE_DEFAULT_CONNECTION_NAME"),
            aws_profile: env.get("L2C_AWS_PROFILE"),
            aws_region: env.get("L2C_AWS_REGION"),
            schema: env.get_or("L2C_SF_SCHEMA", DEFAULT_SCHEMA),
            role_arn: env.get("L2C_STORAGE_ROLE_ARN"),
            work_dir,
            project,
        })
    }

    pub fn kubeconfig(&self) -> PathBuf {
        self.work_dir.join(".kube").join("config")
    }

    /// Naming inputs for cloud resources. An explicit prefix wins over
    /// `SNOWFLAKE_USER`; `no_prefix` drops it entirely.
    pub fn resource_base(&self, prefix: Option<&str>, no_prefix: bool) -> ResourceBase {
        let prefix = if no_prefix {
            None
        } else {
            prefix.or(self.snowflake_user.as_deref())
        };
        ResourceBase::new(prefix, &self.project, &self.catalog_name)
    }

    pub fn manifest_vars(&self) -> ManifestVars {
        ManifestVars {
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
            db_password: self.db_password.clone(),
            realm: self.realm.clone(),
            polaris_version: POLARIS_VERSION.to_string(),
            polaris_port: POLARIS_PORT,
            s3_port: S3_PORT,
            storage_endpoint: IN_CLUSTER_S3_ENDPOINT.to_string(),
        }
    }

    pub fn catalog_spec(&self) -> CatalogSpec {
        CatalogSpec {
            name: self.catalog_name.clone(),
            bucket: self.catalog_name.clone(),
            storage_endpoint: IN_CLUSTER_S3_ENDPOINT.to_string(),
            region: plf_common::objstore::DEFAULT_REGION.to_string(),
        }
    }

    pub fn ports(&self) -> Vec<(u16, u16)> {
        vec![(S3_PORT, S3_PORT), (POLARIS_PORT, POLARIS_PORT)]
    }

    /// Host ports the cluster publishes and what answers on them
    pub fn published_ports(&self) -> Vec<(u16, String)> {
        vec![
            (S3_PORT, "object store API".to_string()),
            (POLARIS_PORT, "catalog API".to_string()),
        ]
    }

    pub fn demo_table(&self) -> TableIdent {
        TableIdent::new("wildlife", "penguins")
    }

    pub fn cluster_timeout(&self) -> Duration {
        CLUSTER_TIMEOUT
    }

    pub fn service_timeout(&self) -> Duration {
        SERVICE_TIMEOUT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> (tempfile::TempDir, Settings) {
        let dir = tempfile::Builder::new().prefix("arctic").tempdir().unwrap();
        let env = ProjectEnv::from_pairs(pairs.iter().copied());
        let settings = Settings::resolve(dir.path(), &env).unwrap();
        (dir, settings)
    }

    #[test]
    fn env_file_is_parsed_without_touching_the_process_environment() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "PLF_TEST_ONLY_KEY=from-file\n# comment\nPLF_POLARIS_REALM=\"ICE\"\n",
        )
        .unwrap();

        let env = ProjectEnv::load(dir.path()).unwrap();
        assert_eq!(env.get("PLF_TEST_ONLY_KEY").as_deref(), Some("from-file"));
        assert_eq!(env.get("PLF_POLARIS_REALM").as_deref(), Some("ICE"));
        assert!(std::env::var("PLF_TEST_ONLY_KEY").is_err());
    }

    #[test]
    fn set_env_line_replaces_in_place_and_appends() {
        let before = "# cloud\nL2C_AWS_REGION=eu-west-1\nexport SNOWFLAKE_USER=old\n";
        let after = set_env_line(before, "SNOWFLAKE_USER", "kamesh");
        assert_eq!(after, "# cloud\nL2C_AWS_REGION=eu-west-1\nSNOWFLAKE_USER=kamesh\n");

        let after = set_env_line(&after, "SNOWFLAKE_ACCOUNT", "ACME-DEV");
        assert!(after.ends_with("SNOWFLAKE_USER=kamesh\nSNOWFLAKE_ACCOUNT=ACME-DEV\n"));

        assert_eq!(set_env_line("", "A", "two words"), "A=\"two words\"\n");
    }

    #[test]
    fn persisted_values_are_read_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "PLF_POLARIS_REALM=ICE\n").unwrap();
        ProjectEnv::persist(
            dir.path(),
            &[
                ("SNOWFLAKE_DEFAULT_CONNECTION_NAME", "dev".to_string()),
                ("SNOWFLAKE_USER", "Kamesh".to_string()),
            ],
        )
        .unwrap();

        let env = ProjectEnv::load(dir.path()).unwrap();
        assert_eq!(env.get("PLF_POLARIS_REALM").as_deref(), Some("ICE"));
        assert_eq!(env.get("SNOWFLAKE_DEFAULT_CONNECTION_NAME").as_deref(), Some("dev"));
        assert_eq!(env.get("SNOWFLAKE_USER").as_deref(), Some("Kamesh"));
    }

    #[test]
    fn missing_env_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let env = ProjectEnv::load(dir.path()).unwrap();
        assert_eq!(env.get("PLF_NEVER_SET_ANYWHERE"), None);
    }

    #[test]
    fn defaults_apply_when_unset() {
        let (_dir, s) = settings(&[]);
        assert!(s.project.starts_with("arctic"));
        assert_eq!(s.cluster_name, s.project);
        assert_eq!(s.k3s_version, DEFAULT_K3S_VERSION);
        assert_eq!(s.catalog_name, "polardb");
        assert_eq!(s.schema, "L2C");
        assert_eq!(s.role_arn, None);
    }

    #[test]
    fn empty_values_count_as_unset() {
        let (_dir, s) = settings(&[("PLF_CLUSTER_NAME", ""), ("L2C_SF_SCHEMA", "  ")]);
        assert_eq!(s.cluster_name, s.project);
        assert_eq!(s.schema, "L2C");
    }

    #[test]
    fn prefix_resolution() {
        let (_dir, s) = settings(&[("SNOWFLAKE_USER", "Kamesh")]);
        assert_eq!(s.resource_base(None, false).prefix.as_deref(), Some("kamesh"));
        assert_eq!(s.resource_base(Some("ops"), false).prefix.as_deref(), Some("ops"));
        assert_eq!(s.resource_base(Some("ops"), true).prefix, None);
    }

    #[test]
    fn state_paths_live_under_the_work_dir() {
        let (dir, s) = settings(&[]);
        let root = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(s.kubeconfig(), root.join(".kube/config"));
    }
}
