//! Resource naming
//!
//! Cloud resources share one base name built from an optional user prefix,
//! the project (work directory name) and the local catalog name:
//! `kamesh-polaris-dev-polardb` on the object-store side and
//! `KAMESH_POLARIS_DEV_POLARDB` on the warehouse side.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::drift::Snapshot;

/// The naming inputs in effect at a point in time
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    pub project: String,
    pub catalog: String,
}

impl ResourceBase {
    pub fn new(prefix: Option<&str>, project: impl Into<String>, catalog: impl Into<String>) -> Self {
        Self {
            prefix: prefix
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty()),
            project: project.into(),
            catalog: catalog.into(),
        }
    }

    fn parts(&self) -> impl Iterator<Item = &str> {
        self.prefix
            .as_deref()
            .into_iter()
            .chain([self.project.as_str(), self.catalog.as_str()])
            .filter(|p| !p.is_empty())
    }

    /// Lowercase, hyphen-joined; used for the bucket
    pub fn aws_base(&self) -> String {
        self.parts().collect::<Vec<_>>().join("-").to_lowercase()
    }

    /// Uppercase, underscore-joined; used for every warehouse object
    pub fn warehouse_base(&self) -> String {
        self.parts()
            .collect::<Vec<_>>()
            .join("_")
            .to_uppercase()
            .replace('-', "_")
    }
}

impl fmt::Display for ResourceBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.aws_base(), self.warehouse_base())
    }
}

impl Snapshot for ResourceBase {
    fn fields(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            ("prefix", self.prefix.clone()),
            ("project", Some(self.project.clone())),
            ("catalog", Some(self.catalog.clone())),
        ]
    }
}

/// Warehouse table name for a catalog table: `NAMESPACE_TABLE`
pub fn warehouse_table_name(namespace: &str, table: &str) -> String {
    format!("{namespace}_{table}").to_uppercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_both_naming_domains() {
        let base = ResourceBase::new(Some("Kamesh"), "polaris-dev", "polardb");
        assert_eq!(base.aws_base(), "kamesh-polaris-dev-polardb");
        assert_eq!(base.warehouse_base(), "KAMESH_POLARIS_DEV_POLARDB");
    }

    #[test]
    fn no_prefix_drops_user_portion() {
        let base = ResourceBase::new(None, "polaris-dev", "polardb");
        assert_eq!(base.aws_base(), "polaris-dev-polardb");
        assert_eq!(base.warehouse_base(), "POLARIS_DEV_POLARDB");

        let blank = ResourceBase::new(Some("  "), "polaris-dev", "polardb");
        assert_eq!(blank, base);
    }

    #[test]
    fn table_names_are_warehouse_safe() {
        assert_eq!(warehouse_table_name("wildlife", "penguins"), "WILDLIFE_PENGUINS");
        assert_eq!(warehouse_table_name("my-ns", "sea-birds"), "MY_NS_SEA_BIRDS");
    }
}
