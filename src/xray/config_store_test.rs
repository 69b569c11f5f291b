//! Tests for the xray config document helpers and the file store

use super::config_store::*;
use serde_json::json;

fn sample_config() -> serde_json::Value {
    json!({
        "log": { "loglevel": "warning" },
        "inbounds": [
            { "protocol": "dokodemo-door", "port": 10085, "settings": { "address": "127.0.0.1" } },
            {
                "protocol": "vless",
                "port": 443,
                "settings": { "clients": [], "decryption": "none" },
                "streamSettings": {
                    "network": "tcp",
                    "security": "reality",
                    "realitySettings": { "shortIds": ["aaaa"] }
                }
            }
        ]
    })
}

#[test]
fn test_find_inbound_skips_non_vless_entries() {
    let mut doc = sample_config();
    let inbound = find_reality_inbound(&mut doc).unwrap();
    assert_eq!(inbound["port"], 443);
}

#[test]
fn test_find_inbound_requires_client_list() {
    let mut doc = json!({
        "inbounds": [ { "protocol": "vless", "settings": { "decryption": "none" } } ]
    });
    assert!(find_reality_inbound(&mut doc).is_none());

    let mut no_inbounds = json!({ "outbounds": [] });
    assert!(find_reality_inbound(&mut no_inbounds).is_none());
}

#[test]
fn test_add_short_id_appends() {
    let mut doc = sample_config();
    add_short_id(&mut doc, "bbbb").unwrap();
    assert_eq!(short_ids(&doc).unwrap(), vec!["aaaa", "bbbb"]);
}

#[test]
fn test_add_short_id_creates_missing_reality_block() {
    let mut doc = json!({
        "inbounds": [ { "protocol": "vless", "settings": { "clients": [] } } ]
    });
    add_short_id(&mut doc, "cafe").unwrap();
    assert_eq!(
        doc["inbounds"][0]["streamSettings"]["realitySettings"]["shortIds"],
        json!(["cafe"])
    );
}

#[test]
fn test_add_short_id_replaces_non_array_list() {
    let mut doc = json!({
        "inbounds": [ {
            "protocol": "vless",
            "settings": { "clients": [] },
            "streamSettings": { "realitySettings": { "shortIds": "oops" } }
        } ]
    });
    add_short_id(&mut doc, "cafe").unwrap();
    assert_eq!(short_ids(&doc).unwrap(), vec!["cafe"]);
}

#[test]
fn test_add_short_id_without_inbound_fails() {
    let mut doc = json!({ "inbounds": [] });
    let err = add_short_id(&mut doc, "cafe").unwrap_err();
    assert!(matches!(err, ConfigStoreError::InboundNotFound));
}

#[test]
fn test_add_short_id_rejects_scalar_stream_settings() {
    let mut doc = json!({
        "inbounds": [ { "protocol": "vless", "settings": { "clients": [] }, "streamSettings": 5 } ]
    });
    let err = add_short_id(&mut doc, "cafe").unwrap_err();
    assert!(matches!(err, ConfigStoreError::Malformed(_)));
}

#[test]
fn test_remove_short_id_filters_by_value() {
    let mut doc = sample_config();
    add_short_id(&mut doc, "bbbb").unwrap();
    add_short_id(&mut doc, "aaaa").unwrap();

    let removed = remove_short_id(&mut doc, "aaaa").unwrap();

    assert!(removed);
    assert_eq!(short_ids(&doc).unwrap(), vec!["bbbb"]);
}

#[test]
fn test_remove_unknown_short_id_is_noop() {
    let mut doc = sample_config();
    assert!(!remove_short_id(&mut doc, "ffff").unwrap());
    assert_eq!(short_ids(&doc).unwrap(), vec!["aaaa"]);
}

#[tokio::test]
async fn test_file_store_save_keeps_one_backup_generation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let first = sample_config();
    std::fs::write(&path, serde_json::to_string(&first).unwrap()).unwrap();

    let store = FileConfigStore::new(&path);

    let mut second = store.load().await.unwrap();
    add_short_id(&mut second, "bbbb").unwrap();
    store.save(&second).await.unwrap();

    let mut third = store.load().await.unwrap();
    add_short_id(&mut third, "cccc").unwrap();
    store.save(&third).await.unwrap();

    // Live document is the newest, backup is exactly the generation before it
    assert_eq!(store.load().await.unwrap(), third);
    let backup: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(store.backup_path()).unwrap()).unwrap();
    assert_eq!(backup, second);
    assert_eq!(
        store.backup_path(),
        dir.path().join("config.json.backup")
    );
}

#[tokio::test]
async fn test_file_store_writes_pretty_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{}").unwrap();

    let store = FileConfigStore::new(&path);
    store.save(&sample_config()).await.unwrap();

    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("\n  \"inbounds\""));
}

#[tokio::test]
async fn test_file_store_load_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileConfigStore::new(dir.path().join("absent.json"));

    let err = store.load().await.unwrap_err();
    assert!(matches!(err, ConfigStoreError::Io { .. }));
}

#[tokio::test]
async fn test_file_store_load_invalid_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = FileConfigStore::new(&path).load().await.unwrap_err();
    assert!(matches!(err, ConfigStoreError::Parse(_)));
}
