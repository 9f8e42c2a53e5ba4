use stratum::api::{ApiStatus, UpdateStatus};

use crate::common::test_setup::Fixture;

#[tokio::test]
async fn version_pinning_across_update() {
    let fx = Fixture::new();
    fx.write("d.yaml", "value: 1\n");

    let first = fx.get("d", &[]).await;
    assert_eq!(first.status, ApiStatus::Ok);
    assert_eq!(first.version, 1);
    let original_checksum = first.checksum;

    fx.write("d.yaml", "value: 2\n");
    let update = fx.update(false, &["d.yaml"]).await;
    assert_eq!(update.status, UpdateStatus::Ok);
    assert_eq!(update.version, 2);

    let pinned = fx.get_at("d", &[], 1).await;
    assert_eq!(pinned.status, ApiStatus::Ok);
    assert_eq!(pinned.version, 1);
    assert_eq!(pinned.checksum, original_checksum);
    assert_eq!(pinned.element.unwrap().get("value").as_int(), Some(1));

    let at_two = fx.get_at("d", &[], 2).await;
    assert_eq!(at_two.element.unwrap().get("value").as_int(), Some(2));

    let current = fx.get("d", &[]).await;
    assert_eq!(current.version, 2);
    assert_eq!(current.element.unwrap().get("value").as_int(), Some(2));
}

#[tokio::test]
async fn identical_update_is_idempotent() {
    let fx = Fixture::new();
    fx.write("d.yaml", "value: 1\n");

    let first = fx.get("d", &[]).await;
    assert_eq!(first.version, 1);

    // Same bytes on disk: the diff empties the batch, no version bump.
    let update = fx.update(false, &["d.yaml"]).await;
    assert_eq!(update.status, UpdateStatus::Ok);
    assert_eq!(update.version, 1);

    let update = fx.update(true, &[]).await;
    assert_eq!(update.status, UpdateStatus::Ok);
    assert_eq!(update.version, 1);
}

#[tokio::test]
async fn unknown_versions_are_invalid() {
    let fx = Fixture::new();
    fx.write("d.yaml", "value: 1\n");

    let response = fx.get_at("d", &[], 99).await;
    assert_eq!(response.status, ApiStatus::InvalidVersion);
}

#[tokio::test]
async fn reload_detects_deletions() {
    let fx = Fixture::new();
    fx.write("db.yaml", "host: a\n");
    fx.write("env/prod/db.yaml", "host: b\n");

    let prod = fx.get("db", &[("env", "prod")]).await;
    assert_eq!(prod.element.unwrap().get("host").as_str().unwrap(), "b");

    fx.remove("env/prod/db.yaml");
    let update = fx.update(true, &[]).await;
    assert_eq!(update.status, UpdateStatus::Ok);
    assert_eq!(update.version, 2);

    let prod = fx.get("db", &[("env", "prod")]).await;
    assert_eq!(prod.status, ApiStatus::Ok);
    assert_eq!(prod.element.unwrap().get("host").as_str().unwrap(), "a");
}

#[tokio::test]
async fn listed_path_deletion_writes_a_tombstone() {
    let fx = Fixture::new();
    fx.write("db.yaml", "host: a\n");
    fx.write("env/prod/db.yaml", "host: b\n");

    let _ = fx.get("db", &[]).await;

    fx.remove("env/prod/db.yaml");
    let update = fx.update(false, &["env/prod/db.yaml"]).await;
    assert_eq!(update.status, UpdateStatus::Ok);
    assert_eq!(update.version, 2);

    let prod = fx.get("db", &[("env", "prod")]).await;
    assert_eq!(prod.element.unwrap().get("host").as_str().unwrap(), "a");

    // The old version still sees the deleted override.
    let pinned = fx.get_at("db", &[("env", "prod")], 1).await;
    assert_eq!(pinned.element.unwrap().get("host").as_str().unwrap(), "b");
}

#[tokio::test]
async fn dependants_of_a_changed_document_re_resolve() {
    let fx = Fixture::new();
    fx.write("a.yaml", "value: 1\n");
    fx.write("b.yaml", "copied: !ref [a, value]\n");

    let before = fx.get("b", &[]).await;
    assert_eq!(before.element.unwrap().get("copied").as_int(), Some(1));

    fx.write("a.yaml", "value: 2\n");
    let update = fx.update(false, &["a.yaml"]).await;
    assert_eq!(update.status, UpdateStatus::Ok);

    // b itself didn't change on disk, yet its resolution must follow a.
    let after = fx.get("b", &[]).await;
    assert_eq!(after.element.unwrap().get("copied").as_int(), Some(2));

    // And the old version still resolves the old value.
    let pinned = fx.get_at("b", &[], 1).await;
    assert_eq!(pinned.element.unwrap().get("copied").as_int(), Some(1));
}

#[tokio::test]
async fn a_new_override_appears_at_the_new_version() {
    let fx = Fixture::new();
    fx.write("db.yaml", "host: a\n");

    let base = fx.get("db", &[("env", "prod")]).await;
    assert_eq!(base.element.unwrap().get("host").as_str().unwrap(), "a");

    fx.write("env/prod/db.yaml", "host: b\n");
    let update = fx.update(false, &["env/prod/db.yaml"]).await;
    assert_eq!(update.status, UpdateStatus::Ok);

    let prod = fx.get("db", &[("env", "prod")]).await;
    assert_eq!(prod.element.unwrap().get("host").as_str().unwrap(), "b");
}

#[tokio::test]
async fn broken_yaml_in_an_update_deletes_the_namespace() {
    let fx = Fixture::new();
    fx.write("db.yaml", "host: a\n");
    let first = fx.get("db", &[]).await;
    assert_eq!(first.status, ApiStatus::Ok);

    fx.write("db.yaml", "host: [unclosed\n");
    let update = fx.update(false, &["db.yaml"]).await;
    assert_eq!(update.status, UpdateStatus::Error);

    // The next request rebuilds from disk and fails again on the bad file,
    // so the namespace never comes back until the file is fixed.
    let response = fx.get("db", &[]).await;
    assert_eq!(response.status, ApiStatus::Error);

    fx.write("db.yaml", "host: c\n");
    let response = fx.get("db", &[]).await;
    assert_eq!(response.status, ApiStatus::Ok);
    assert_eq!(response.element.unwrap().get("host").as_str().unwrap(), "c");
}
