use std::sync::Arc;
use std::time::Duration;

use stratum::api::{EventSink, WatchEvent, WatchStatus};
use stratum::service::WatchRegister;
use stratum::trace::{TraceEventKind, TraceSelector};
use stratum::watch::WatchStream;
use stratum_model::StringPool;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::common::test_setup::Fixture;

fn watch_sink() -> (
    Arc<dyn EventSink<WatchEvent>>,
    mpsc::UnboundedReceiver<WatchEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(tx), rx)
}

fn register(fx: &Fixture, uid: u32, document: &str, labels: &[(&str, &str)]) -> WatchRegister {
    WatchRegister {
        uid,
        root_path: fx.root(),
        labels: Fixture::labels(labels),
        document: document.to_string(),
        ..WatchRegister::default()
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<WatchEvent>) -> WatchEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a watch event")
        .expect("watch stream closed")
}

#[tokio::test]
async fn watcher_fires_once_per_relevant_update() {
    let fx = Fixture::new();
    fx.write("db.yaml", "host: a\n");
    fx.write("other.yaml", "x: 1\n");

    let stream = WatchStream::new();
    let (sink, mut rx) = watch_sink();
    fx.service
        .watch_register(&stream, sink, register(&fx, 1, "db", &[]))
        .await;

    let initial = next_event(&mut rx).await;
    assert_eq!(initial.status, WatchStatus::Ok);
    assert_eq!(
        initial.element.as_ref().unwrap().get("host").as_str().unwrap(),
        "a"
    );

    // A change to the watched document fires exactly once with the fresh
    // resolution.
    fx.write("db.yaml", "host: b\n");
    fx.update(false, &["db.yaml"]).await;
    let fired = next_event(&mut rx).await;
    assert_eq!(fired.status, WatchStatus::Ok);
    assert_eq!(fired.version, 2);
    assert_eq!(
        fired.element.as_ref().unwrap().get("host").as_str().unwrap(),
        "b"
    );

    // A change to an unrelated document doesn't touch this watcher.
    fx.write("other.yaml", "x: 2\n");
    fx.update(false, &["other.yaml"]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unchanged_resolution_is_suppressed() {
    let fx = Fixture::new();
    fx.write("db.yaml", "host: a\nport: 1\n");

    let stream = WatchStream::new();
    let (sink, mut rx) = watch_sink();
    fx.service
        .watch_register(&stream, sink, register(&fx, 1, "db", &[]))
        .await;
    let _ = next_event(&mut rx).await;

    // Different bytes, same resolved element: the fire happens but the
    // delivery is suppressed by checksum.
    fx.write("db.yaml", "port: 1\nhost: a\n");
    let update = fx.update(false, &["db.yaml"]).await;
    assert_eq!(update.version, 2);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn uid_lifecycle() {
    let fx = Fixture::new();
    fx.write("db.yaml", "host: a\n");

    let stream = WatchStream::new();
    let (sink, mut rx) = watch_sink();
    fx.service
        .watch_register(&stream, Arc::clone(&sink), register(&fx, 7, "db", &[]))
        .await;
    let _ = next_event(&mut rx).await;

    // Reusing a live uid is an error.
    fx.service
        .watch_register(&stream, Arc::clone(&sink), register(&fx, 7, "db", &[]))
        .await;
    let event = next_event(&mut rx).await;
    assert_eq!(event.status, WatchStatus::UidInUse);

    // Removing it works once.
    fx.service
        .watch_remove(&stream, sink.as_ref(), &fx.root(), 7)
        .await;
    let event = next_event(&mut rx).await;
    assert_eq!(event.status, WatchStatus::Removed);

    fx.service
        .watch_remove(&stream, sink.as_ref(), &fx.root(), 7)
        .await;
    let event = next_event(&mut rx).await;
    assert_eq!(event.status, WatchStatus::UnknownUid);
}

#[tokio::test]
async fn positions_follow_the_registration_flag() {
    let fx = Fixture::new();
    fx.write("db.yaml", "host: a\n");

    let stream = WatchStream::new();
    let (sink, mut rx) = watch_sink();
    let mut reg = register(&fx, 1, "db", &[]);
    reg.with_position = true;
    fx.service.watch_register(&stream, sink, reg).await;

    let event = next_event(&mut rx).await;
    let payload = event.payload.expect("positioned payload");
    let decoded = stratum::api::wire::decode(&StringPool::new(), &payload).unwrap();
    assert!(decoded.element.origin().is_some());
    assert_eq!(decoded.sources.len(), 1);
    assert_eq!(decoded.sources[0].path, "db.yaml");

    let stream = WatchStream::new();
    let (sink, mut rx) = watch_sink();
    fx.service
        .watch_register(&stream, sink, register(&fx, 2, "db", &[]))
        .await;
    let event = next_event(&mut rx).await;
    if let Some(payload) = event.payload {
        let decoded = stratum::api::wire::decode(&StringPool::new(), &payload).unwrap();
        assert!(!decoded.element.origin().is_some());
    }
}

#[tokio::test]
async fn labels_scope_watcher_fires() {
    let fx = Fixture::new();
    fx.write("db.yaml", "host: a\n");
    fx.write("env/prod/db.yaml", "host: b\n");

    let stream = WatchStream::new();
    let (sink, mut rx) = watch_sink();
    fx.service
        .watch_register(&stream, sink, register(&fx, 1, "db", &[]))
        .await;
    let initial = next_event(&mut rx).await;
    assert_eq!(
        initial.element.as_ref().unwrap().get("host").as_str().unwrap(),
        "a"
    );

    // The prod-only override can't contribute to a label-less watcher.
    fx.write("env/prod/db.yaml", "host: c\n");
    fx.update(false, &["env/prod/db.yaml"]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn trace_streams_see_requests_and_watchers() {
    let fx = Fixture::new();
    fx.write("db.yaml", "host: a\n");

    let mut handle = fx
        .service
        .trace(&fx.root(), TraceSelector::default(), None)
        .await
        .expect("trace subscription");

    let _ = fx.get("db", &[]).await;
    let event = timeout(Duration::from_secs(5), handle.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, TraceEventKind::ReturnedElements);
    assert_eq!(event.document, "db");
    assert_eq!(event.peer, 0);

    let stream = WatchStream::new();
    let (sink, mut watch_rx) = watch_sink();
    fx.service
        .watch_register(&stream, sink, register(&fx, 3, "db", &[]))
        .await;
    let _ = next_event(&mut watch_rx).await;

    let event = timeout(Duration::from_secs(5), handle.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, TraceEventKind::AddedWatcher);
    assert_eq!(event.peer, 3);
    // The watcher's own initial resolution is traced too.
    let event = timeout(Duration::from_secs(5), handle.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, TraceEventKind::ReturnedElements);
    assert_eq!(event.peer, 3);

    // A second subscription replays the surviving watcher.
    let mut second = fx
        .service
        .trace(&fx.root(), TraceSelector::default(), None)
        .await
        .expect("trace subscription");
    let event = timeout(Duration::from_secs(5), second.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, TraceEventKind::ExistingWatcher);
    assert_eq!(event.peer, 3);
}

#[tokio::test]
async fn selective_trace_filters_by_document() {
    let fx = Fixture::new();
    fx.write("db.yaml", "host: a\n");
    fx.write("other.yaml", "x: 1\n");

    let mut handle = fx
        .service
        .trace(
            &fx.root(),
            TraceSelector {
                document: Some("db".to_string()),
                ..TraceSelector::default()
            },
            None,
        )
        .await
        .expect("trace subscription");

    let _ = fx.get("other", &[]).await;
    let _ = fx.get("db", &[]).await;

    let event = timeout(Duration::from_secs(5), handle.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.document, "db");
    assert!(handle.events.try_recv().is_err());
}
