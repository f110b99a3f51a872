//! Table metadata location rewriter
//!
//! A table's metadata is a small tree: the root `*.metadata.json`, one
//! manifest list (Avro) per snapshot, and the manifests (Avro) each list
//! points at. Every absolute location is rewritten by plain prefix
//! substitution. Leaves are written before their list, and the root is
//! written last, so the root never points into a half-rewritten tree.

use std::collections::HashMap;
use std::str::FromStr;

use apache_avro::types::Value as AvroValue;
use apache_avro::{from_avro_datum, Codec, Reader, Schema, Writer};
use bytes::Bytes;
use plf_common::{ObjectStore, StoreError};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{MigrateError, Result};

const METADATA_SUFFIX: &str = ".metadata.json";
const AVRO_MAGIC: &[u8] = b"Obj\x01";
const HEADER_SCHEMA: &str = r#"{"type": "map", "values": "bytes"}"#;

/// Replace `from` with `to` at the start of `value`.
///
/// `None` when the value does not start with `from`, or already carries
/// `to` where `to` extends `from` (so a second pass is a no-op).
pub fn replace_prefix(value: &str, from: &str, to: &str) -> Option<String> {
    if to.starts_with(from) && value.starts_with(to) {
        return None;
    }
    value.strip_prefix(from).map(|rest| format!("{to}{rest}"))
}

/// Object key of an `s3://bucket/key` or `s3a://bucket/key` URI
pub fn key_from_uri(uri: &str, bucket: &str) -> Option<String> {
    ["s3://", "s3a://"].iter().find_map(|scheme| {
        uri.strip_prefix(scheme)?
            .strip_prefix(bucket)?
            .strip_prefix('/')
            .map(str::to_string)
    })
}

fn rewrite_json_str(value: &mut Value, from: &str, to: &str) -> bool {
    match value.as_str().and_then(|s| replace_prefix(s, from, to)) {
        Some(new) => {
            *value = Value::String(new);
            true
        }
        None => false,
    }
}

/// Rewrite the location fields of a root metadata document in place.
///
/// Touches `location`, `snapshots[].manifest-list` and
/// `metadata-log[].metadata-file`. Returns the number of fields changed.
pub fn rewrite_metadata_json(doc: &mut Value, from: &str, to: &str) -> usize {
    let mut changed = 0;
    if let Some(location) = doc.get_mut("location") {
        changed += usize::from(rewrite_json_str(location, from, to));
    }
    for (array, field) in [("snapshots", "manifest-list"), ("metadata-log", "metadata-file")] {
        if let Some(entries) = doc.get_mut(array).and_then(Value::as_array_mut) {
            for entry in entries {
                if let Some(v) = entry.get_mut(field) {
                    changed += usize::from(rewrite_json_str(v, from, to));
                }
            }
        }
    }
    changed
}

fn manifest_list_uris(doc: &Value) -> Vec<String> {
    doc.get("snapshots")
        .and_then(Value::as_array)
        .map(|snapshots| {
            snapshots
                .iter()
                .filter_map(|s| s.get("manifest-list").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn avro_str(value: &AvroValue) -> Option<&str> {
    match value {
        AvroValue::String(s) => Some(s),
        AvroValue::Union(_, inner) => avro_str(inner),
        _ => None,
    }
}

fn rewrite_avro_str(value: &mut AvroValue, from: &str, to: &str) -> bool {
    match value {
        AvroValue::String(s) => match replace_prefix(s, from, to) {
            Some(new) => {
                *s = new;
                true
            }
            None => false,
        },
        AvroValue::Union(_, inner) => rewrite_avro_str(inner, from, to),
        _ => false,
    }
}

fn field_mut<'a>(fields: &'a mut [(String, AvroValue)], name: &str) -> Option<&'a mut AvroValue> {
    fields.iter_mut().find(|(n, _)| n == name).map(|(_, v)| v)
}

/// Block codec named in an Avro container header; `Null` when absent.
pub fn container_codec(bytes: &[u8], key: &str) -> Result<Codec> {
    let mut header = bytes
        .strip_prefix(AVRO_MAGIC)
        .ok_or_else(|| MigrateError::metadata(key, "not an Avro container"))?;
    let schema = Schema::parse_str(HEADER_SCHEMA).map_err(|e| MigrateError::metadata(key, e))?;
    let AvroValue::Map(entries) =
        from_avro_datum(&schema, &mut header, None).map_err(|e| MigrateError::metadata(key, e))?
    else {
        return Err(MigrateError::metadata(key, "malformed container header"));
    };
    match entries.get("avro.codec") {
        Some(AvroValue::Bytes(name)) => {
            let name = String::from_utf8_lossy(name);
            Codec::from_str(&name)
                .map_err(|_| MigrateError::metadata(key, format!("unsupported codec {name}")))
        }
        _ => Ok(Codec::Null),
    }
}

/// Decode an Avro container, let `edit` change each record, re-encode with
/// the writer schema, codec and user metadata of the input.
fn rewrite_avro<F>(bytes: &[u8], key: &str, mut edit: F) -> Result<Vec<u8>>
where
    F: FnMut(&mut Vec<(String, AvroValue)>),
{
    let codec = container_codec(bytes, key)?;
    let reader = Reader::new(bytes).map_err(|e| MigrateError::metadata(key, e))?;
    let schema = reader.writer_schema().clone();
    let metadata = reader.user_metadata().clone();

    let mut records = Vec::new();
    for value in reader {
        let mut value = value.map_err(|e| MigrateError::metadata(key, e))?;
        if let AvroValue::Record(fields) = &mut value {
            edit(fields);
        }
        records.push(value);
    }

    let mut writer = Writer::with_codec(&schema, Vec::new(), codec);
    for (k, v) in metadata {
        writer
            .add_user_metadata(k, v)
            .map_err(|e| MigrateError::metadata(key, e))?;
    }
    for record in records {
        writer
            .append(record)
            .map_err(|e| MigrateError::metadata(key, e))?;
    }
    writer.into_inner().map_err(|e| MigrateError::metadata(key, e))
}

/// Manifest locations listed in a manifest list, as written.
pub fn manifest_paths(bytes: &[u8], key: &str) -> Result<Vec<String>> {
    let reader = Reader::new(bytes).map_err(|e| MigrateError::metadata(key, e))?;
    let mut paths = Vec::new();
    for value in reader {
        let value = value.map_err(|e| MigrateError::metadata(key, e))?;
        if let AvroValue::Record(fields) = value {
            if let Some(path) = fields
                .iter()
                .find(|(n, _)| n == "manifest_path")
                .and_then(|(_, v)| avro_str(v))
            {
                paths.push(path.to_string());
            }
        }
    }
    Ok(paths)
}

/// Rewrite `manifest_path` in every manifest list entry.
///
/// `lengths` maps a manifest location as it was before the rewrite to the
/// size of its rewritten file; matching entries get a new `manifest_length`.
pub fn rewrite_manifest_list(
    bytes: &[u8],
    key: &str,
    from: &str,
    to: &str,
    lengths: &HashMap<String, u64>,
) -> Result<Vec<u8>> {
    rewrite_avro(bytes, key, |fields| {
        let length = field_mut(fields, "manifest_path")
            .and_then(|path| {
                let length = avro_str(path).and_then(|p| lengths.get(p)).copied();
                rewrite_avro_str(path, from, to);
                length
            });
        if let (Some(length), Some(field)) = (length, field_mut(fields, "manifest_length")) {
            *field = AvroValue::Long(length as i64);
        }
    })
}

/// Rewrite `data_file.file_path` and `data_file.referenced_data_file` in
/// every manifest entry.
pub fn rewrite_manifest(bytes: &[u8], key: &str, from: &str, to: &str) -> Result<Vec<u8>> {
    rewrite_avro(bytes, key, |fields| {
        if let Some(AvroValue::Record(data_file)) = field_mut(fields, "data_file") {
            for name in ["file_path", "referenced_data_file"] {
                if let Some(v) = field_mut(data_file, name) {
                    rewrite_avro_str(v, from, to);
                }
            }
        }
    })
}

/// Leading version number of a metadata file name (`00003-<uuid>` or `v3`)
pub fn metadata_version(key: &str) -> Option<u64> {
    let name = key.rsplit('/').next()?;
    let name = name.strip_prefix('v').unwrap_or(name);
    let digits: String = name.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Key of the newest root metadata document of a table, relative to the bucket
pub async fn latest_metadata(
    store: &dyn ObjectStore,
    bucket: &str,
    namespace: &str,
    table: &str,
) -> std::result::Result<Option<String>, StoreError> {
    let prefix = format!("{}/{}/metadata/", namespace, table);
    let entries = store.list(bucket, &prefix).await?;
    Ok(entries
        .into_iter()
        .map(|e| e.key)
        .filter(|k| k.ends_with(METADATA_SUFFIX))
        .max_by(|a, b| (metadata_version(a), a).cmp(&(metadata_version(b), b))))
}

/// What a table rewrite touched
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RewriteSummary {
    /// Root document, `None` when the table has no metadata yet
    pub root: Option<String>,
    /// Documents written, root included
    pub rewritten: usize,
    /// Referenced documents that could not be found
    pub missing: Vec<String>,
}

async fn fetch(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    missing: &mut Vec<String>,
) -> Result<Option<Bytes>> {
    match store.get(bucket, key).await {
        Ok(body) => Ok(Some(body)),
        Err(StoreError::NotFound { .. }) => {
            warn!(key, "referenced metadata document not found, skipping");
            missing.push(key.to_string());
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Bucket key of a referenced document, trying its rewritten location first
fn document_key(uri: &str, bucket: &str, from: &str, to: &str) -> Option<String> {
    replace_prefix(uri, from, to)
        .and_then(|after| key_from_uri(&after, bucket))
        .or_else(|| key_from_uri(uri, bucket))
}

/// Rewrite every location in one table's metadata tree, in place in `bucket`.
pub async fn rewrite_table(
    store: &dyn ObjectStore,
    bucket: &str,
    namespace: &str,
    table: &str,
    from: &str,
    to: &str,
) -> Result<RewriteSummary> {
    let mut summary = RewriteSummary::default();
    let Some(root_key) = latest_metadata(store, bucket, namespace, table).await? else {
        warn!(namespace, table, "no metadata documents found, nothing to rewrite");
        return Ok(summary);
    };

    let body = store.get(bucket, &root_key).await?;
    let mut root: Value =
        serde_json::from_slice(&body).map_err(|e| MigrateError::metadata(&root_key, e))?;
    let list_uris = manifest_list_uris(&root);
    rewrite_metadata_json(&mut root, from, to);

    for list_uri in list_uris {
        let Some(list_key) = document_key(&list_uri, bucket, from, to) else {
            summary.missing.push(list_uri);
            continue;
        };
        let Some(list_body) = fetch(store, bucket, &list_key, &mut summary.missing).await? else {
            continue;
        };
        let mut lengths = HashMap::new();
        for manifest_uri in manifest_paths(&list_body, &list_key)? {
            let Some(manifest_key) = document_key(&manifest_uri, bucket, from, to) else {
                summary.missing.push(manifest_uri);
                continue;
            };
            let Some(manifest_body) = fetch(store, bucket, &manifest_key, &mut summary.missing).await?
            else {
                continue;
            };
            let new_manifest = rewrite_manifest(&manifest_body, &manifest_key, from, to)?;
            lengths.insert(manifest_uri, new_manifest.len() as u64);
            store.put(bucket, &manifest_key, Bytes::from(new_manifest)).await?;
            summary.rewritten += 1;
            debug!(key = %manifest_key, "manifest rewritten");
        }

        let new_list = rewrite_manifest_list(&list_body, &list_key, from, to, &lengths)?;
        store.put(bucket, &list_key, Bytes::from(new_list)).await?;
        summary.rewritten += 1;
        debug!(key = %list_key, "manifest list rewritten");
    }

    let root_body =
        serde_json::to_vec_pretty(&root).map_err(|e| MigrateError::metadata(&root_key, e))?;
    store.put(bucket, &root_key, Bytes::from(root_body)).await?;
    summary.rewritten += 1;

    info!(
        table = %format!("{namespace}.{table}"),
        files = summary.rewritten,
        "rewrote {} -> {}",
        from,
        to
    );
    summary.root = Some(root_key);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefix_substitution() {
        assert_eq!(
            replace_prefix("s3://polardb/ns/t/data/a.parquet", "s3://polardb/", "s3://dst/"),
            Some("s3://dst/ns/t/data/a.parquet".to_string())
        );
        assert_eq!(replace_prefix("s3://other/x", "s3://polardb/", "s3://dst/"), None);
    }

    #[test]
    fn extending_prefix_is_not_applied_twice() {
        let once = replace_prefix("s3://a/t/x", "s3://a/", "s3://a/moved/").unwrap();
        assert_eq!(once, "s3://a/moved/t/x");
        assert_eq!(replace_prefix(&once, "s3://a/", "s3://a/moved/"), None);
    }

    #[test]
    fn keys_from_both_schemes() {
        assert_eq!(key_from_uri("s3://b/ns/t/m.avro", "b").as_deref(), Some("ns/t/m.avro"));
        assert_eq!(key_from_uri("s3a://b/ns/t/m.avro", "b").as_deref(), Some("ns/t/m.avro"));
        assert_eq!(key_from_uri("s3://bb/ns/t/m.avro", "b"), None);
    }

    #[test]
    fn root_document_fields_are_rewritten_and_nothing_else() {
        let mut doc = json!({
            "format-version": 2,
            "location": "s3://polardb/wildlife/penguins",
            "properties": {"write.data.path": "s3://polardb/elsewhere"},
            "snapshots": [
                {"snapshot-id": 1, "manifest-list": "s3://polardb/wildlife/penguins/metadata/snap-1.avro"}
            ],
            "metadata-log": [
                {"timestamp-ms": 1, "metadata-file": "s3://polardb/wildlife/penguins/metadata/00000-a.metadata.json"}
            ]
        });
        let changed = rewrite_metadata_json(&mut doc, "s3://polardb/", "s3://dst/");
        assert_eq!(changed, 3);
        assert_eq!(doc["location"], "s3://dst/wildlife/penguins");
        assert_eq!(doc["properties"]["write.data.path"], "s3://polardb/elsewhere");
        assert_eq!(
            doc["snapshots"][0]["manifest-list"],
            "s3://dst/wildlife/penguins/metadata/snap-1.avro"
        );
    }

    #[test]
    fn version_numbers_order_metadata_files() {
        assert_eq!(metadata_version("ns/t/metadata/00012-abc.metadata.json"), Some(12));
        assert_eq!(metadata_version("ns/t/metadata/v3.metadata.json"), Some(3));
        assert_eq!(metadata_version("ns/t/metadata/abc.metadata.json"), None);
    }

    #[tokio::test]
    async fn latest_metadata_picks_highest_version() {
        let store = plf_common::objstore::MemoryStore::new();
        for key in [
            "ns/t/metadata/00002-b.metadata.json",
            "ns/t/metadata/00010-c.metadata.json",
            "ns/t/metadata/00009-z.metadata.json",
            "ns/t/metadata/snap-1.avro",
        ] {
            store.insert("b", key, &b"{}"[..]);
        }
        let latest = latest_metadata(&store, "b", "ns", "t").await.unwrap();
        assert_eq!(latest.as_deref(), Some("ns/t/metadata/00010-c.metadata.json"));
        assert_eq!(latest_metadata(&store, "b", "ns", "other").await.unwrap(), None);
    }

    const LIST_SCHEMA: &str = r#"{
      "type": "record",
      "name": "manifest_file",
      "fields": [
        {"name": "manifest_path", "type": "string"},
        {"name": "manifest_length", "type": "long"}
      ]
    }"#;

    fn manifest_list(codec: Codec, path: &str, length: i64) -> Vec<u8> {
        let schema = Schema::parse_str(LIST_SCHEMA).unwrap();
        let mut writer = Writer::with_codec(&schema, Vec::new(), codec);
        writer
            .append(AvroValue::Record(vec![
                ("manifest_path".into(), AvroValue::String(path.into())),
                ("manifest_length".into(), AvroValue::Long(length)),
            ]))
            .unwrap();
        writer.into_inner().unwrap()
    }

    #[test]
    fn manifest_list_gets_new_lengths_and_keeps_its_codec() {
        let old = "s3://polardb/ns/t/metadata/m1.avro";
        let bytes = manifest_list(Codec::Deflate, old, 1024);
        assert_eq!(container_codec(&bytes, "list").unwrap(), Codec::Deflate);
        assert_eq!(manifest_paths(&bytes, "list").unwrap(), vec![old.to_string()]);

        let lengths = HashMap::from([(old.to_string(), 777u64)]);
        let out = rewrite_manifest_list(&bytes, "list", "s3://polardb/", "s3://dst/", &lengths).unwrap();

        assert_eq!(container_codec(&out, "list").unwrap(), Codec::Deflate);
        let records: Vec<AvroValue> = Reader::new(&out[..]).unwrap().map(|v| v.unwrap()).collect();
        assert_eq!(
            records,
            vec![AvroValue::Record(vec![
                ("manifest_path".into(), AvroValue::String("s3://dst/ns/t/metadata/m1.avro".into())),
                ("manifest_length".into(), AvroValue::Long(777)),
            ])]
        );
    }

    #[test]
    fn unknown_manifest_keeps_its_recorded_length() {
        let bytes = manifest_list(Codec::Null, "s3://polardb/ns/t/metadata/m1.avro", 1024);
        let out = rewrite_manifest_list(&bytes, "list", "s3://polardb/", "s3://dst/", &HashMap::new())
            .unwrap();
        assert_eq!(container_codec(&out, "list").unwrap(), Codec::Null);
        let record = Reader::new(&out[..]).unwrap().next().unwrap().unwrap();
        let AvroValue::Record(fields) = record else { panic!("not a record") };
        assert_eq!(fields[1].1, AvroValue::Long(1024));
    }

    #[test]
    fn non_container_bytes_are_a_metadata_error() {
        let err = container_codec(b"{}", "ns/t/metadata/snap-1.avro").unwrap_err();
        assert!(matches!(err, MigrateError::Metadata { .. }));
    }
}
