//! Rendered Kubernetes manifests for the local stack

use std::path::Path;

use plf_common::fs::write_atomic;
use plf_common::TemplateEngine;
use serde::Serialize;

use crate::catalog::Principal;
use crate::Result;

const RUSTFS: &str = include_str!("../manifests/rustfs.yaml");
const POSTGRESQL: &str = include_str!("../manifests/postgresql.yaml");
const POLARIS: &str = include_str!("../manifests/polaris.yaml");
const BOOTSTRAP_JOB: &str = include_str!("../manifests/bootstrap-job.yaml");

/// Values substituted into every manifest
#[derive(Clone, Debug, Serialize)]
pub struct ManifestVars {
    pub access_key: String,
    pub secret_key: String,
    pub db_password: String,
    pub realm: String,
    pub polaris_version: String,
    pub polaris_port: u16,
    pub s3_port: u16,
    /// Object-store endpoint as seen from inside the cluster
    pub storage_endpoint: String,
}

#[derive(Serialize)]
struct BootstrapVars<'a> {
    #[serde(flatten)]
    base: &'a ManifestVars,
    client_id: &'a str,
    client_secret: &'a str,
}

fn engine() -> Result<TemplateEngine> {
    Ok(TemplateEngine::new()?
        .with_template("rustfs.yaml", RUSTFS)?
        .with_template("postgresql.yaml", POSTGRESQL)?
        .with_template("polaris.yaml", POLARIS)?
        .with_template("bootstrap-job.yaml", BOOTSTRAP_JOB)?)
}

/// Manifests the cluster applies on boot: object store and database
pub fn render_features(vars: &ManifestVars) -> Result<Vec<(&'static str, String)>> {
    let engine = engine()?;
    Ok(vec![
        ("rustfs.yaml", engine.render_named("rustfs.yaml", vars)?),
        ("postgresql.yaml", engine.render_named("postgresql.yaml", vars)?),
    ])
}

/// Write the boot manifests into `dir`
pub fn write_features(dir: &Path, vars: &ManifestVars) -> Result<()> {
    for (name, body) in render_features(vars)? {
        write_atomic(&dir.join(name), body.as_bytes())?;
    }
    Ok(())
}

/// Catalog service chart and its storage secret
pub fn render_polaris(vars: &ManifestVars) -> Result<String> {
    Ok(engine()?.render_named("polaris.yaml", vars)?)
}

/// Bootstrap credentials secret and job
pub fn render_bootstrap(vars: &ManifestVars, principal: &Principal) -> Result<String> {
    let bootstrap = BootstrapVars {
        base: vars,
        client_id: &principal.client_id,
        client_secret: &principal.client_secret,
    };
    Ok(engine()?.render_named("bootstrap-job.yaml", bootstrap)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_utils::{parse_manifest, split_documents};

    fn vars() -> ManifestVars {
        ManifestVars {
            access_key: "admin".into(),
            secret_key: "password".into(),
            db_password: "pgpass".into(),
            realm: "POLARIS".into(),
            polaris_version: "1.2.0-incubating".into(),
            polaris_port: 18181,
            s3_port: 19000,
            storage_endpoint: "http://rustfs.rustfs:19000".into(),
        }
    }

    #[test]
    fn every_rendered_document_is_a_valid_manifest() {
        let mut all: Vec<String> = render_features(&vars())
            .unwrap()
            .into_iter()
            .map(|(_, body)| body)
            .collect();
        all.push(render_polaris(&vars()).unwrap());
        all.push(render_bootstrap(&vars(), &Principal::generate("POLARIS")).unwrap());

        for stream in &all {
            for doc in split_documents(stream) {
                parse_manifest(doc).unwrap();
            }
        }
    }

    #[test]
    fn bootstrap_job_carries_the_principal() {
        let principal = Principal::parse("POLARIS,cid,csecret").unwrap();
        let rendered = render_bootstrap(&vars(), &principal).unwrap();
        assert!(rendered.contains("--credential=POLARIS,cid,csecret"));
        assert!(rendered.contains("clientSecret: \"csecret\""));
    }

    #[test]
    fn features_are_written_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        write_features(dir.path(), &vars()).unwrap();
        let rustfs = std::fs::read_to_string(dir.path().join("rustfs.yaml")).unwrap();
        assert!(rustfs.contains("port: 19000"));
        assert!(dir.path().join("postgresql.yaml").exists());
    }
}
