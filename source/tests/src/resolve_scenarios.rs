use stratum::api::{ApiStatus, GetRequest, LogLevel};

use crate::common::test_setup::Fixture;

#[tokio::test]
async fn basic_override() {
    let fx = Fixture::new();
    fx.write("db.yaml", "host: a\nport: 5432\n");
    fx.write("env/prod/db.yaml", "host: b\n");

    let base = fx.get("db", &[]).await;
    assert_eq!(base.status, ApiStatus::Ok);
    let element = base.element.unwrap();
    assert_eq!(element.get("host").as_str().unwrap(), "a");

    let prod = fx.get("db", &[("env", "prod")]).await;
    assert_eq!(prod.status, ApiStatus::Ok);
    let element = prod.element.unwrap();
    assert_eq!(element.get("host").as_str().unwrap(), "b");
    assert_eq!(element.get("port").as_int(), Some(5432));
}

#[tokio::test]
async fn delete_key() {
    let fx = Fixture::new();
    fx.write("db.yaml", "host: a\nport: 5432\n");
    fx.write("env/prod/db.yaml", "host: b\nport: !delete ~\n");

    let prod = fx.get("db", &[("env", "prod")]).await;
    assert_eq!(prod.status, ApiStatus::Ok);
    let element = prod.element.unwrap();
    assert_eq!(element.get("host").as_str().unwrap(), "b");
    assert!(!element.has("port"));
}

#[tokio::test]
async fn override_tag_replacement() {
    let fx = Fixture::new();
    fx.write("db.yaml", "host: a\nport: 5432\n");
    fx.write("env/prod/db.yaml", "!override {host: b}\n");

    let prod = fx.get("db", &[("env", "prod")]).await;
    assert_eq!(prod.status, ApiStatus::Ok);
    let element = prod.element.unwrap();
    assert_eq!(element.get("host").as_str().unwrap(), "b");
    assert!(!element.has("port"));
}

#[tokio::test]
async fn cross_document_reference() {
    let fx = Fixture::new();
    fx.write("a.yaml", "value: 1\n");
    fx.write("b.yaml", "copied: !ref [a, value]\n");

    let response = fx.get("b", &[]).await;
    assert_eq!(response.status, ApiStatus::Ok);
    assert_eq!(response.element.unwrap().get("copied").as_int(), Some(1));
}

#[tokio::test]
async fn reference_cycle_is_rejected_and_recoverable() {
    let fx = Fixture::new();
    fx.write("a.yaml", "x: !ref [b, x]\n");
    fx.write("b.yaml", "x: !ref [a, x]\n");

    let response = fx.get("a", &[]).await;
    assert_eq!(response.status, ApiStatus::RefGraphIsNotDag);

    // Breaking the cycle and reissuing the request succeeds.
    fx.write("b.yaml", "x: 7\n");
    let update = fx.update(false, &["b.yaml"]).await;
    assert_eq!(update.status, stratum::api::UpdateStatus::Ok);

    let response = fx.get("a", &[]).await;
    assert_eq!(response.status, ApiStatus::Ok);
    assert_eq!(response.element.unwrap().get("x").as_int(), Some(7));
}

#[tokio::test]
async fn deterministic_repeat_reads() {
    let fx = Fixture::new();
    fx.write("db.yaml", "host: a\nport: 5432\nopts:\n  a: 1\n  b: [x, y]\n");

    let first = fx.get("db", &[]).await;
    let second = fx.get("db", &[]).await;
    assert_eq!(first.status, ApiStatus::Ok);
    assert_eq!(first.checksum, second.checksum);
    assert_eq!(first.element.unwrap(), second.element.unwrap());
    assert_eq!(first.version, second.version);
}

#[tokio::test]
async fn flavors_layer_after_the_plain_entries() {
    let fx = Fixture::new();
    fx.write("db.yaml", "host: a\npool: 4\n");
    fx.write("db.cache.yaml", "pool: 32\n");

    let plain = fx.get("db", &[]).await;
    assert_eq!(plain.element.unwrap().get("pool").as_int(), Some(4));

    let flavored = fx
        .get_full(GetRequest {
            root_path: fx.root(),
            document: "db".to_string(),
            flavors: vec!["cache".to_string()],
            log_level: LogLevel::Warn,
            ..GetRequest::default()
        })
        .await;
    assert_eq!(flavored.status, ApiStatus::Ok);
    let element = flavored.element.unwrap();
    assert_eq!(element.get("pool").as_int(), Some(32));
    assert_eq!(element.get("host").as_str().unwrap(), "a");
}

#[tokio::test]
async fn template_rendering() {
    let fx = Fixture::new();
    fx.write("app.yaml", "host: db1\nport: 5432\n");
    fx.write("_tmpl.app.conf", "conn={{ host }}:{{ port }}\n");

    let response = fx
        .get_full(GetRequest {
            root_path: fx.root(),
            document: "app".to_string(),
            template: Some("_tmpl.app.conf".to_string()),
            log_level: LogLevel::Warn,
            ..GetRequest::default()
        })
        .await;
    assert_eq!(response.status, ApiStatus::Ok);
    let payload = response.payload.expect("rendered payload");
    assert_eq!(String::from_utf8_lossy(&payload), "conn=db1:5432\n");
}

#[tokio::test]
async fn format_and_sref_compose() {
    let fx = Fixture::new();
    fx.write(
        "app.yaml",
        "host: db1\nport: 5432\nurl: !format [\"pg://\", !sref [host], \":\", !sref [port]]\n",
    );

    let response = fx.get("app", &[]).await;
    assert_eq!(response.status, ApiStatus::Ok);
    assert_eq!(
        response.element.unwrap().get("url").as_str().unwrap(),
        "pg://db1:5432"
    );
}

#[tokio::test]
async fn missing_document_is_an_error() {
    let fx = Fixture::new();
    fx.write("db.yaml", "host: a\n");

    let response = fx.get("ghost", &[]).await;
    assert_eq!(response.status, ApiStatus::Error);
}

#[tokio::test]
async fn invalid_arguments_are_rejected() {
    let fx = Fixture::new();
    fx.write("db.yaml", "host: a\n");

    let response = fx.get("bad/name", &[]).await;
    assert_eq!(response.status, ApiStatus::InvalidArgument);

    let dup = fx.get("db", &[("env", "a"), ("env", "b")]).await;
    assert_eq!(dup.status, ApiStatus::InvalidArgument);
}

#[tokio::test]
async fn sources_list_names_every_contributing_file() {
    let fx = Fixture::new();
    fx.write("a.yaml", "value: 1\n");
    fx.write("b.yaml", "copied: !ref [a, value]\n");
    fx.write("env/prod/b.yaml", "extra: 2\n");

    let response = fx.get("b", &[("env", "prod")]).await;
    assert_eq!(response.status, ApiStatus::Ok);
    let mut paths: Vec<&str> = response.sources.iter().map(|s| s.path.as_str()).collect();
    paths.sort();
    assert_eq!(paths, vec!["a.yaml", "b.yaml", "env/prod/b.yaml"]);
}
