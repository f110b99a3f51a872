//! Shared fixtures: a fake catalog and Iceberg-shaped metadata trees

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use apache_avro::types::Value;
use apache_avro::{Reader, Schema, Writer};
use async_trait::async_trait;
use plf_common::objstore::MemoryStore;
use plf_common::{ResourceBase, RetryConfig};
use plf_migrate::{MemoryMigrationStore, MemoryWarehouse, Pipeline, PipelineConfig};
use plf_setup::{CatalogError, CatalogService, CatalogSpec, Principal, TableIdent, TableInfo};

pub const SOURCE_BUCKET: &str = "polardb";

const MANIFEST_LIST_SCHEMA: &str = r#"{
  "type": "record",
  "name": "manifest_file",
  "fields": [
    {"name": "manifest_path", "type": "string"},
    {"name": "manifest_length", "type": "long"},
    {"name": "added_snapshot_id", "type": "long"}
  ]
}"#;

const MANIFEST_SCHEMA: &str = r#"{
  "type": "record",
  "name": "manifest_entry",
  "fields": [
    {"name": "status", "type": "int"},
    {"name": "data_file", "type": {
      "type": "record",
      "name": "r2",
      "fields": [
        {"name": "file_path", "type": "string"},
        {"name": "file_size_in_bytes", "type": "long"},
        {"name": "referenced_data_file", "type": ["null", "string"], "default": null}
      ]
    }}
  ]
}"#;

fn avro(schema: &str, records: Vec<Value>) -> Vec<u8> {
    let schema = Schema::parse_str(schema).unwrap();
    let mut writer = Writer::new(&schema, Vec::new());
    writer.add_user_metadata("format-version".to_string(), "2").unwrap();
    for record in records {
        writer.append(record).unwrap();
    }
    writer.into_inner().unwrap()
}

/// Decoded records of an Avro container
pub fn decode(bytes: &[u8]) -> Vec<Value> {
    Reader::new(bytes).unwrap().map(|v| v.unwrap()).collect()
}

/// Key of a table's latest root metadata document
pub fn root_key(namespace: &str, table: &str) -> String {
    format!("{namespace}/{table}/metadata/00001-b.metadata.json")
}

pub fn list_key(namespace: &str, table: &str) -> String {
    format!("{namespace}/{table}/metadata/snap-1.avro")
}

pub fn manifest_key(namespace: &str, table: &str) -> String {
    format!("{namespace}/{table}/metadata/m1.avro")
}

pub fn data_key(namespace: &str, table: &str, file: &str) -> String {
    format!("{namespace}/{table}/data/{file}")
}

/// One snapshot, one manifest, two data files and a position delete file
pub fn write_table(store: &MemoryStore, bucket: &str, namespace: &str, table: &str) {
    let uri = |key: String| format!("s3://{bucket}/{key}");

    for file in ["a.parquet", "b.parquet", "del.parquet"] {
        store.insert(bucket, &data_key(namespace, table, file), format!("rows of {file}").into_bytes());
    }

    let data_file = |file: &str, referenced: Option<String>| {
        Value::Record(vec![
            ("status".into(), Value::Int(1)),
            (
                "data_file".into(),
                Value::Record(vec![
                    ("file_path".into(), Value::String(uri(data_key(namespace, table, file)))),
                    ("file_size_in_bytes".into(), Value::Long(16)),
                    (
                        "referenced_data_file".into(),
                        match referenced {
                            Some(r) => Value::Union(1, Box::new(Value::String(r))),
                            None => Value::Union(0, Box::new(Value::Null)),
                        },
                    ),
                ]),
            ),
        ])
    };
    let manifest = avro(
        MANIFEST_SCHEMA,
        vec![
            data_file("a.parquet", None),
            data_file("b.parquet", None),
            data_file("del.parquet", Some(uri(data_key(namespace, table, "a.parquet")))),
        ],
    );
    let manifest_length = manifest.len() as i64;
    store.insert(bucket, &manifest_key(namespace, table), manifest);

    let list = avro(
        MANIFEST_LIST_SCHEMA,
        vec![Value::Record(vec![
            ("manifest_path".into(), Value::String(uri(manifest_key(namespace, table)))),
            ("manifest_length".into(), Value::Long(manifest_length)),
            ("added_snapshot_id".into(), Value::Long(1)),
        ])],
    );
    store.insert(bucket, &list_key(namespace, table), list);

    let old_root = format!("{namespace}/{table}/metadata/00000-a.metadata.json");
    store.insert(
        bucket,
        &old_root,
        serde_json::to_vec_pretty(&serde_json::json!({
            "format-version": 2,
            "location": uri(format!("{namespace}/{table}")),
            "snapshots": []
        }))
        .unwrap(),
    );
    let root = serde_json::json!({
        "format-version": 2,
        "table-uuid": "5a1c-penguin",
        "location": uri(format!("{namespace}/{table}")),
        "current-snapshot-id": 1,
        "snapshots": [
            {"snapshot-id": 1, "manifest-list": uri(list_key(namespace, table))}
        ],
        "metadata-log": [
            {"timestamp-ms": 1700000000000u64, "metadata-file": uri(old_root)}
        ]
    });
    store.insert(bucket, &root_key(namespace, table), serde_json::to_vec_pretty(&root).unwrap());
}

/// Catalog backed by a fixed list of tables
pub struct FakeCatalog {
    tables: Vec<TableIdent>,
    pub broken: Mutex<Vec<TableIdent>>,
}

impl FakeCatalog {
    pub fn new(tables: &[(&str, &str)]) -> Self {
        Self {
            tables: tables.iter().map(|(ns, t)| TableIdent::new(*ns, *t)).collect(),
            broken: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CatalogService for FakeCatalog {
    async fn deploy(&self) -> Result<(), CatalogError> {
        Ok(())
    }

    async fn bootstrap(&self) -> Result<Principal, CatalogError> {
        Ok(principal())
    }

    async fn create_catalog(&self, _: &Principal, _: &CatalogSpec) -> Result<(), CatalogError> {
        Ok(())
    }

    async fn create_namespace(&self, _: &Principal, _: &str, _: &str) -> Result<(), CatalogError> {
        Ok(())
    }

    async fn create_table(
        &self,
        _: &Principal,
        _: &str,
        _: &TableIdent,
        _: &serde_json::Value,
    ) -> Result<(), CatalogError> {
        Ok(())
    }

    async fn list_namespaces(&self, _: &Principal, _: &str) -> Result<Vec<String>, CatalogError> {
        let mut namespaces: Vec<String> = self.tables.iter().map(|t| t.namespace.clone()).collect();
        namespaces.sort();
        namespaces.dedup();
        Ok(namespaces)
    }

    async fn list_tables(
        &self,
        _: &Principal,
        _: &str,
        namespace: &str,
    ) -> Result<Vec<TableIdent>, CatalogError> {
        Ok(self
            .tables
            .iter()
            .filter(|t| t.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn load_table(
        &self,
        _: &Principal,
        catalog: &str,
        ident: &TableIdent,
    ) -> Result<TableInfo, CatalogError> {
        if self.broken.lock().unwrap().contains(ident) {
            return Err(CatalogError::NotFound {
                what: format!("table {ident}"),
            });
        }
        Ok(TableInfo {
            ident: ident.clone(),
            metadata_location: Some(format!(
                "s3://{catalog}/{}",
                root_key(&ident.namespace, &ident.name)
            )),
            location: Some(format!("s3://{catalog}/{}/{}", ident.namespace, ident.name)),
        })
    }
}

pub fn principal() -> Principal {
    Principal {
        realm: "POLARIS".into(),
        client_id: "cid".into(),
        client_secret: "csecret".into(),
    }
}

pub fn base(prefix: Option<&str>) -> ResourceBase {
    ResourceBase::new(prefix, "dev", SOURCE_BUCKET)
}

pub fn config(prefix: Option<&str>) -> PipelineConfig {
    let mut config = PipelineConfig::new(SOURCE_BUCKET, base(prefix));
    config.role_arn = Some("arn:aws:iam::123456789012:role/l2c".into());
    config.warehouse_user = Some("kamesh".into());
    config.retry = RetryConfig::bounded(4, Duration::from_millis(1));
    config
}

/// Everything a pipeline test needs to inspect
pub struct Fixture {
    pub pipeline: Pipeline<MemoryMigrationStore>,
    pub local: MemoryStore,
    pub cloud: MemoryStore,
    pub warehouse: Arc<MemoryWarehouse>,
    pub catalog: Arc<FakeCatalog>,
}

impl Fixture {
    /// Tables written to the local bucket and listed by the catalog
    pub fn new(tables: &[(&str, &str)]) -> Self {
        Self::with_store(tables, MemoryMigrationStore::new(), config(Some("kamesh")))
    }

    pub fn with_store(
        tables: &[(&str, &str)],
        store: MemoryMigrationStore,
        config: PipelineConfig,
    ) -> Self {
        let local = MemoryStore::new();
        for (ns, t) in tables {
            write_table(&local, SOURCE_BUCKET, ns, t);
        }
        let cloud = MemoryStore::new();
        let warehouse = Arc::new(MemoryWarehouse::new());
        let catalog = Arc::new(FakeCatalog::new(tables));
        let pipeline = Pipeline::new(
            store,
            catalog.clone(),
            principal(),
            Arc::new(local.clone()),
            Arc::new(cloud.clone()),
            warehouse.clone(),
            config,
        )
        .unwrap();
        Self {
            pipeline,
            local,
            cloud,
            warehouse,
            catalog,
        }
    }

    /// Destination bucket for the default configuration
    pub fn bucket(&self) -> String {
        self.pipeline.config().bucket()
    }
}
