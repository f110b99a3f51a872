//! Metadata tree rewriting against the in-memory object store

mod common;

use apache_avro::types::Value;
use apache_avro::Reader;
use plf_common::objstore::MemoryStore;
use plf_migrate::rewrite_table;

use common::{decode, list_key, manifest_key, root_key, write_table};

fn root(store: &MemoryStore, bucket: &str) -> serde_json::Value {
    serde_json::from_slice(&store.object(bucket, &root_key("wildlife", "penguins")).unwrap()).unwrap()
}

fn strings(values: &[Value]) -> Vec<String> {
    fn walk(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => out.push(s.clone()),
            Value::Union(_, inner) => walk(inner, out),
            Value::Record(fields) => fields.iter().for_each(|(_, v)| walk(v, out)),
            _ => {}
        }
    }
    let mut out = Vec::new();
    values.iter().for_each(|v| walk(v, &mut out));
    out
}

#[tokio::test]
async fn every_level_of_the_tree_is_rewritten() {
    let store = MemoryStore::new();
    write_table(&store, "polardb", "wildlife", "penguins");

    let summary = rewrite_table(&store, "polardb", "wildlife", "penguins", "s3://polardb/", "s3://dst/")
        .await
        .unwrap();
    assert_eq!(summary.rewritten, 3);
    assert!(summary.missing.is_empty());
    assert_eq!(summary.root.as_deref(), Some(root_key("wildlife", "penguins").as_str()));

    let doc = root(&store, "polardb");
    assert_eq!(doc["location"], "s3://dst/wildlife/penguins");
    assert_eq!(
        doc["snapshots"][0]["manifest-list"],
        "s3://dst/wildlife/penguins/metadata/snap-1.avro"
    );
    assert_eq!(
        doc["metadata-log"][0]["metadata-file"],
        "s3://dst/wildlife/penguins/metadata/00000-a.metadata.json"
    );
    assert_eq!(doc["table-uuid"], "5a1c-penguin");

    let list = decode(&store.object("polardb", &list_key("wildlife", "penguins")).unwrap());
    assert_eq!(strings(&list), vec!["s3://dst/wildlife/penguins/metadata/m1.avro"]);
    let manifest_size = store
        .object("polardb", &manifest_key("wildlife", "penguins"))
        .unwrap()
        .len() as i64;
    let Value::Record(fields) = &list[0] else { panic!("manifest list entry is not a record") };
    assert_eq!(fields[1], ("manifest_length".to_string(), Value::Long(manifest_size)));

    let manifest = decode(&store.object("polardb", &manifest_key("wildlife", "penguins")).unwrap());
    let paths = strings(&manifest);
    assert_eq!(paths.len(), 4);
    assert!(paths.iter().all(|p| p.starts_with("s3://dst/wildlife/penguins/data/")));
}

#[tokio::test]
async fn paired_rewrites_restore_the_original_tree() {
    let store = MemoryStore::new();
    write_table(&store, "polardb", "wildlife", "penguins");

    let original_root = root(&store, "polardb");
    let list_bytes = store.object("polardb", &list_key("wildlife", "penguins")).unwrap();
    let manifest_bytes = store.object("polardb", &manifest_key("wildlife", "penguins")).unwrap();

    rewrite_table(&store, "polardb", "wildlife", "penguins", "s3://polardb/", "s3://dst/")
        .await
        .unwrap();
    rewrite_table(&store, "polardb", "wildlife", "penguins", "s3://dst/", "s3://polardb/")
        .await
        .unwrap();

    assert_eq!(root(&store, "polardb"), original_root);
    for (key, before) in [
        (list_key("wildlife", "penguins"), list_bytes),
        (manifest_key("wildlife", "penguins"), manifest_bytes),
    ] {
        let after = store.object("polardb", &key).unwrap();
        assert_eq!(decode(&after), decode(&before), "{key} records differ");

        // Same writer schema and user metadata; only sync markers differ
        let before_reader = Reader::new(&before[..]).unwrap();
        let after_reader = Reader::new(&after[..]).unwrap();
        assert_eq!(after_reader.writer_schema(), before_reader.writer_schema());
        assert_eq!(after_reader.user_metadata(), before_reader.user_metadata());
    }
}

#[tokio::test]
async fn rewriting_a_copied_tree_twice_is_stable() {
    let store = MemoryStore::new();
    write_table(&store, "polardb", "wildlife", "penguins");
    let listing = plf_common::ObjectStore::list(&store, "polardb", "wildlife/").await.unwrap();
    for entry in listing {
        store.insert("dst", &entry.key, store.object("polardb", &entry.key).unwrap());
    }

    let first = rewrite_table(&store, "dst", "wildlife", "penguins", "s3://polardb/", "s3://dst/")
        .await
        .unwrap();
    let once = root(&store, "dst");
    let manifest_once = decode(&store.object("dst", &manifest_key("wildlife", "penguins")).unwrap());

    let second = rewrite_table(&store, "dst", "wildlife", "penguins", "s3://polardb/", "s3://dst/")
        .await
        .unwrap();
    assert_eq!(first.rewritten, 3);
    assert_eq!(second.rewritten, 3);
    assert!(second.missing.is_empty());
    assert_eq!(root(&store, "dst"), once);
    assert_eq!(
        decode(&store.object("dst", &manifest_key("wildlife", "penguins")).unwrap()),
        manifest_once
    );

    // The source copy is untouched
    assert_eq!(root(&store, "polardb")["location"], "s3://polardb/wildlife/penguins");
}

#[tokio::test]
async fn missing_manifest_is_reported_and_root_still_written() {
    let store = MemoryStore::new();
    write_table(&store, "polardb", "wildlife", "penguins");
    plf_common::ObjectStore::delete(&store, "polardb", &manifest_key("wildlife", "penguins"))
        .await
        .unwrap();

    let summary = rewrite_table(&store, "polardb", "wildlife", "penguins", "s3://polardb/", "s3://dst/")
        .await
        .unwrap();
    assert_eq!(summary.missing, vec![manifest_key("wildlife", "penguins")]);
    assert_eq!(summary.rewritten, 2);
    assert_eq!(root(&store, "polardb")["location"], "s3://dst/wildlife/penguins");
}

#[tokio::test]
async fn table_without_metadata_is_a_no_op() {
    let store = MemoryStore::new();
    store.insert("polardb", "wildlife/empty/data/x.parquet", &b"x"[..]);
    let summary = rewrite_table(&store, "polardb", "wildlife", "empty", "s3://polardb/", "s3://dst/")
        .await
        .unwrap();
    assert_eq!(summary.root, None);
    assert_eq!(summary.rewritten, 0);
}
