use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot};

use crate::api::auth::{AuthAction, AuthDecision, Authenticator};
use crate::api::{
    validation, wire, ApiStatus, EventSink, GetRequest, GetResponse, RequestLog, UpdateRequest,
    UpdateResponse, UpdateStatus, WatchEvent, WatchStatus,
};
use crate::gc::{self, GcType};
use crate::namespace::registry::{Lookup, Registry};
use crate::namespace::{ConfigNamespace, NamespaceStatus, VersionId};
use crate::resolve::{resolve_document, Resolved};
use crate::trace::{
    watcher_event, TraceEvent, TraceEventKind, TraceHandle, TraceSelector, TraceSubscription,
};
use crate::update::{self, UpdateOutcome};
use crate::watch::{Delivery, RegisterOutcome, WatchStream, Watcher};

/// Parameters of a `Watch.Register` message.
#[derive(Debug, Clone, Default)]
pub struct WatchRegister {
    pub uid: u32,
    pub root_path: std::path::PathBuf,
    pub labels: stratum_model::Labels,
    pub document: String,
    pub flavors: Vec<String>,
    pub log_level: crate::api::LogLevel,
    pub with_position: bool,
    pub token: Option<String>,
}

/// The engine facade the transport talks to. Cheap to clone; every clone
/// shares the namespace registry and the authenticator.
#[derive(Clone)]
pub struct Service {
    registry: Arc<Registry>,
    authenticator: Arc<dyn Authenticator>,
}

impl Service {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Service {
        Service {
            registry: Arc::new(Registry::new()),
            authenticator,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// `get_or_build`: return a live namespace, park behind an in-flight
    /// initial index, or run the index when this caller created the entry.
    async fn namespace(&self, root_path: &Path) -> Result<Arc<ConfigNamespace>, ApiStatus> {
        match self.registry.get_or_build(root_path) {
            Lookup::Ready(ns) => Ok(ns),
            Lookup::Wait(ns, rx) => {
                let _ = rx.await;
                match ns.status() {
                    NamespaceStatus::Ok | NamespaceStatus::OkUpdating => Ok(ns),
                    _ => Err(ApiStatus::Error),
                }
            }
            Lookup::MustBuild(ns) => {
                let ok = update::initial_index(&ns).await;
                self.registry.finish_build(&ns, ok);
                if ok {
                    Ok(ns)
                } else {
                    Err(ApiStatus::Error)
                }
            }
        }
    }

    pub async fn get(&self, req: GetRequest) -> GetResponse {
        let log = RequestLog::new(req.log_level);

        if let Err(err) = validation::check_get_arguments(
            &req.root_path,
            &req.labels,
            &req.document,
            &req.flavors,
            req.template.as_deref(),
        ) {
            log.error(err.to_string(), stratum_model::Origin::NONE);
            return GetResponse::failure(ApiStatus::InvalidArgument, log.take());
        }

        match self.authenticator.check(
            req.token.as_deref(),
            AuthAction::Get {
                root_path: &req.root_path,
                document: &req.document,
                labels: &req.labels,
            },
        ) {
            AuthDecision::Allow => {}
            AuthDecision::Unauthenticated => {
                return GetResponse::failure(ApiStatus::Unauthenticated, log.take())
            }
            AuthDecision::PermissionDenied => {
                return GetResponse::failure(ApiStatus::PermissionDenied, log.take())
            }
        }

        let ns = match self.namespace(&req.root_path).await {
            Ok(ns) => ns,
            Err(status) => return GetResponse::failure(status, log.take()),
        };

        let Some(view) = ns.snapshot(req.version) else {
            return GetResponse::failure(ApiStatus::InvalidVersion, log.take());
        };
        let version = view.version;

        let result = resolve_document(
            &view.namespace,
            &req.document,
            &req.labels,
            &req.flavors,
            version,
            &log,
        )
        .await;

        let response = match result {
            Ok(resolved) => match self.shape_get_response(&ns, &req, version, resolved, &log).await
            {
                Ok(response) => response,
                Err(status) => GetResponse::failure(status, log.take()),
            },
            Err(err) => {
                log.error(err.to_string(), stratum_model::Origin::NONE);
                GetResponse::failure(ApiStatus::from(&err), log.take())
            }
        };

        self.trace_request(&ns, &req, &response);
        response
    }

    async fn shape_get_response(
        &self,
        ns: &Arc<ConfigNamespace>,
        req: &GetRequest,
        version: VersionId,
        resolved: Resolved,
        log: &RequestLog,
    ) -> Result<GetResponse, ApiStatus> {
        let payload = if let Some(template) = &req.template {
            Some(self.render_payload(ns, req, template, version, &resolved, log).await?)
        } else if req.with_position {
            let encoded = wire::encode(&resolved.element, true, &resolved.source_lookup);
            Some(encoded.payload)
        } else {
            resolved.payload.clone()
        };

        Ok(GetResponse {
            status: ApiStatus::Ok,
            namespace_id: ns.id,
            version,
            element: Some(resolved.element),
            checksum: resolved.checksum,
            payload,
            sources: resolved.sources,
            logs: log.take(),
        })
    }

    /// Resolve the template document under the same labels and version,
    /// then render it over the resolved element.
    async fn render_payload(
        &self,
        ns: &Arc<ConfigNamespace>,
        req: &GetRequest,
        template: &str,
        version: VersionId,
        resolved: &Resolved,
        log: &RequestLog,
    ) -> Result<Bytes, ApiStatus> {
        let template_doc = resolve_document(ns, template, &req.labels, &req.flavors, version, log)
            .await
            .map_err(|err| {
                log.error(err.to_string(), stratum_model::Origin::NONE);
                ApiStatus::from(&err)
            })?;
        let Some(source) = template_doc.element.as_str() else {
            log.error(
                format!("the template '{template}' isn't a text document"),
                stratum_model::Origin::NONE,
            );
            return Err(ApiStatus::Error);
        };
        let rendered = crate::render::render_template(&source.to_string_lossy(), &resolved.element)
            .map_err(|err| {
                log.error(err.to_string(), stratum_model::Origin::NONE);
                ApiStatus::Error
            })?;
        Ok(Bytes::from(rendered))
    }

    fn trace_request(&self, ns: &Arc<ConfigNamespace>, req: &GetRequest, response: &GetResponse) {
        let kind = if response.status == ApiStatus::Ok {
            TraceEventKind::ReturnedElements
        } else {
            TraceEventKind::Error
        };
        ns.emit_trace(&TraceEvent {
            kind,
            namespace_id: ns.id,
            version: response.version,
            labels: req.labels.clone(),
            document: req.document.clone(),
            flavor: req.flavors.first().cloned(),
            peer: 0,
        });
    }

    pub async fn update(&self, req: UpdateRequest) -> UpdateResponse {
        if validation::check_update_arguments(&req.root_path, &req.relative_paths).is_err() {
            return UpdateResponse {
                status: UpdateStatus::InvalidArgument,
                namespace_id: 0,
                version: 0,
            };
        }

        match self.authenticator.check(
            req.token.as_deref(),
            AuthAction::Update {
                root_path: &req.root_path,
            },
        ) {
            AuthDecision::Allow => {}
            AuthDecision::Unauthenticated => {
                return UpdateResponse {
                    status: UpdateStatus::Unauthenticated,
                    namespace_id: 0,
                    version: 0,
                }
            }
            AuthDecision::PermissionDenied => {
                return UpdateResponse {
                    status: UpdateStatus::PermissionDenied,
                    namespace_id: 0,
                    version: 0,
                }
            }
        }

        let ns = match self.namespace(&req.root_path).await {
            Ok(ns) => ns,
            Err(_) => {
                return UpdateResponse {
                    status: UpdateStatus::Error,
                    namespace_id: 0,
                    version: 0,
                }
            }
        };

        match update::apply_update(&ns, req.reload, &req.relative_paths).await {
            Ok(outcome) => {
                let version = outcome.version;
                self.after_update(&ns, outcome);
                UpdateResponse {
                    status: UpdateStatus::Ok,
                    namespace_id: ns.id,
                    version,
                }
            }
            Err(_) => {
                // The namespace marked itself deleted; unlink it so the next
                // request rebuilds from disk.
                self.registry.remove(&ns);
                UpdateResponse {
                    status: UpdateStatus::Error,
                    namespace_id: ns.id,
                    version: 0,
                }
            }
        }
    }

    fn after_update(&self, ns: &Arc<ConfigNamespace>, outcome: UpdateOutcome) {
        if outcome.overflowed {
            tracing::info!(
                root_path = %ns.root_path.display(),
                "removing the namespace, the internal ids reached their limit"
            );
            self.registry.remove(ns);
        }
        if outcome.watchers.is_empty() {
            return;
        }
        let version = outcome.version;
        let ns = Arc::clone(ns);
        tokio::spawn(async move {
            join_all(outcome.watchers.iter().map(|watcher| {
                let ns = Arc::clone(&ns);
                async move { fire_watcher(&ns, watcher, version).await }
            }))
            .await;
        });
    }

    /// Handle a `Watch.Register` message: the event stream sees either the
    /// first resolution or the failure status.
    pub async fn watch_register(
        &self,
        stream: &WatchStream,
        sink: Arc<dyn EventSink<WatchEvent>>,
        reg: WatchRegister,
    ) {
        if let Err(err) = validation::check_get_arguments(
            &reg.root_path,
            &reg.labels,
            &reg.document,
            &reg.flavors,
            None,
        ) {
            tracing::debug!(error = %err, "rejecting watcher registration");
            sink.deliver(WatchEvent::status_only(reg.uid, WatchStatus::InvalidArgument));
            return;
        }

        match self.authenticator.check(
            reg.token.as_deref(),
            AuthAction::Watch {
                root_path: &reg.root_path,
                document: &reg.document,
                labels: &reg.labels,
            },
        ) {
            AuthDecision::Allow => {}
            AuthDecision::Unauthenticated => {
                sink.deliver(WatchEvent::status_only(reg.uid, WatchStatus::Unauthenticated));
                return;
            }
            AuthDecision::PermissionDenied => {
                sink.deliver(WatchEvent::status_only(
                    reg.uid,
                    WatchStatus::PermissionDenied,
                ));
                return;
            }
        }

        let ns = match self.namespace(&reg.root_path).await {
            Ok(ns) => ns,
            Err(_) => {
                sink.deliver(WatchEvent::status_only(reg.uid, WatchStatus::Error));
                return;
            }
        };

        // Registrations park while an update is in flight and resume against
        // the promoted version.
        loop {
            let parked: Option<oneshot::Receiver<()>> = {
                let mut state = ns.state.write().unwrap();
                match state.status {
                    NamespaceStatus::OkUpdating => {
                        let (tx, rx) = oneshot::channel();
                        state.watch_wait_queue.push(tx);
                        Some(rx)
                    }
                    NamespaceStatus::Ok => None,
                    NamespaceStatus::Building | NamespaceStatus::Deleted => {
                        drop(state);
                        sink.deliver(WatchEvent::status_only(reg.uid, WatchStatus::Error));
                        return;
                    }
                }
            };
            match parked {
                Some(rx) => {
                    if rx.await.is_err() {
                        sink.deliver(WatchEvent::status_only(reg.uid, WatchStatus::Error));
                        return;
                    }
                }
                None => break,
            }
        }

        let watcher = Arc::new(Watcher::new(
            reg.uid,
            reg.root_path.clone(),
            reg.labels.clone(),
            reg.document.clone(),
            reg.flavors.clone(),
            reg.log_level,
            reg.with_position,
            Arc::clone(&sink),
        ));

        if stream.insert(Arc::clone(&watcher)) == RegisterOutcome::UidInUse {
            sink.deliver(WatchEvent::status_only(reg.uid, WatchStatus::UidInUse));
            return;
        }

        attach_watcher(&ns, &watcher);
        let version = {
            let state = ns.state.read().unwrap();
            state.current_version
        };
        ns.emit_trace(&watcher_event(
            TraceEventKind::AddedWatcher,
            ns.id,
            version,
            &watcher,
        ));
        fire_watcher(&ns, &watcher, version).await;
    }

    /// Handle a `Watch.Remove` message.
    pub async fn watch_remove(
        &self,
        stream: &WatchStream,
        sink: &dyn EventSink<WatchEvent>,
        root_path: &Path,
        uid: u32,
    ) {
        match stream.remove(uid) {
            Some(watcher) => {
                if let Some(ns) = self.registry.get(root_path) {
                    let version = ns.state.read().unwrap().current_version;
                    ns.emit_trace(&watcher_event(
                        TraceEventKind::RemovedWatcher,
                        ns.id,
                        version,
                        &watcher,
                    ));
                }
                sink.deliver(WatchEvent::status_only(uid, WatchStatus::Removed));
            }
            None => {
                sink.deliver(WatchEvent::status_only(uid, WatchStatus::UnknownUid));
            }
        }
    }

    /// Open a trace stream over one namespace. Existing watchers are
    /// replayed as `EXISTING_WATCHER` events.
    pub async fn trace(
        &self,
        root_path: &Path,
        selector: TraceSelector,
        token: Option<&str>,
    ) -> Result<TraceHandle, ApiStatus> {
        if !validation::is_valid_absolute_path(root_path) {
            return Err(ApiStatus::InvalidArgument);
        }
        match self
            .authenticator
            .check(token, AuthAction::Trace { root_path })
        {
            AuthDecision::Allow => {}
            AuthDecision::Unauthenticated => return Err(ApiStatus::Unauthenticated),
            AuthDecision::PermissionDenied => return Err(ApiStatus::PermissionDenied),
        }

        let ns = self.namespace(root_path).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = Arc::new(TraceSubscription::new(selector, Box::new(tx)));
        ns.subscribe_trace(&subscription);

        let version = ns.state.read().unwrap().current_version;
        for watcher in ns.live_watchers() {
            subscription.offer(&watcher_event(
                TraceEventKind::ExistingWatcher,
                ns.id,
                version,
                &watcher,
            ));
        }

        Ok(TraceHandle {
            subscription,
            events: rx,
        })
    }

    pub fn run_gc(&self, kind: GcType, max_live_sec: u64, token: Option<&str>) -> ApiStatus {
        match self.authenticator.check(token, AuthAction::RunGc) {
            AuthDecision::Allow => {}
            AuthDecision::Unauthenticated => return ApiStatus::Unauthenticated,
            AuthDecision::PermissionDenied => return ApiStatus::PermissionDenied,
        }
        gc::run(&self.registry, kind, max_live_sec);
        ApiStatus::Ok
    }
}

/// Weak-register a watcher on its document and on every existing override
/// entry it could match; entries created later attach during the update
/// commit.
fn attach_watcher(ns: &Arc<ConfigNamespace>, watcher: &Arc<Watcher>) {
    let document = {
        let mut state = ns.state.write().unwrap();
        let state = &mut *state;
        update::get_or_create_document(
            &mut state.documents,
            &mut state.next_document_id,
            &watcher.document,
        )
    };
    let mut doc_state = document.state.write().unwrap();
    doc_state.watchers.push(Arc::downgrade(watcher));
    for entry in doc_state.overrides.values_mut() {
        let flavor_ok = match &entry.flavor {
            None => true,
            Some(flavor) => watcher.flavors.iter().any(|f| f == flavor),
        };
        if flavor_ok && watcher.labels.contains(&entry.labels) {
            entry.watchers.push(Arc::downgrade(watcher));
        }
    }
}

/// Resolve on behalf of a watcher and push the result through its sink;
/// unchanged results are suppressed inside `deliver`.
async fn fire_watcher(ns: &Arc<ConfigNamespace>, watcher: &Arc<Watcher>, version: VersionId) {
    if watcher.is_closed() {
        return;
    }
    let log = RequestLog::new(watcher.log_level);
    let result = resolve_document(
        ns,
        &watcher.document,
        &watcher.labels,
        &watcher.flavors,
        version,
        &log,
    )
    .await;

    let event = match result {
        Ok(resolved) => {
            let payload = if watcher.with_position {
                Some(wire::encode(&resolved.element, true, &resolved.source_lookup).payload)
            } else {
                resolved.payload.clone()
            };
            WatchEvent {
                uid: watcher.uid,
                status: WatchStatus::Ok,
                namespace_id: ns.id,
                version,
                element: Some(resolved.element),
                checksum: resolved.checksum,
                payload,
                sources: resolved.sources,
                logs: log.take(),
            }
        }
        Err(err) => {
            log.error(err.to_string(), stratum_model::Origin::NONE);
            let mut event = WatchEvent::status_only(watcher.uid, ApiStatus::from(&err).into());
            event.namespace_id = ns.id;
            event.version = version;
            event.logs = log.take();
            event
        }
    };

    let is_error = event.status != WatchStatus::Ok;
    let delivery = watcher.deliver(event);

    // An unchanged fire returns nothing to the peer, so it isn't traced as
    // returned elements; errors are traced regardless of the peer state.
    let kind = if is_error {
        Some(TraceEventKind::Error)
    } else if delivery == Delivery::Sent {
        Some(TraceEventKind::ReturnedElements)
    } else {
        None
    };
    if let Some(kind) = kind {
        ns.emit_trace(&crate::trace::TraceEvent {
            kind,
            namespace_id: ns.id,
            version,
            labels: watcher.labels.clone(),
            document: watcher.document.clone(),
            flavor: watcher.flavors.first().cloned(),
            peer: watcher.uid,
        });
    }
}
