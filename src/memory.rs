//! In-memory object store implementing [`ClusterClient`].
//!
//! Objects are kept as JSON values. Every write bumps a global revision which
//! becomes the object's resourceVersion, and is recorded in a bounded history
//! so watches can resume from an older resourceVersion.

use crate::{
    client::{ClusterClient, EventStream, Object},
    errors::{status, Verb},
};
use async_trait::async_trait;
use futures::{
    future,
    stream::{self, StreamExt},
};
use kube::{
    api::{ListParams, ResourceExt, WatchEvent, WatchParams},
    core::ErrorResponse,
};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const HISTORY_CAPACITY: usize = 1024;
const WATCH_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    api_version: String,
    kind: String,
    // empty for cluster-scoped objects
    namespace: String,
    name: String,
}

impl Key {
    fn new<K: Object>(namespace: Option<&str>, name: &str) -> Key {
        let namespace = match K::NAMESPACED {
            true => namespace.unwrap_or_default().to_string(),
            false => String::new(),
        };
        Key {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            namespace,
            name: name.to_string(),
        }
    }

    fn same_type<K: Object>(&self) -> bool {
        self.api_version == K::api_version(&()) && self.kind == K::kind(&())
    }
}

#[derive(Debug, Clone, Copy)]
enum Change {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
struct Record {
    key: Key,
    revision: u64,
    change: Change,
    object: Value,
}

#[derive(Debug, Clone)]
enum Signal {
    Change(Record),
    Error {
        api_version: String,
        kind: String,
        status: ErrorResponse,
    },
    Close,
}

/// Which objects a watch or list selects
#[derive(Debug, Clone)]
struct Selector {
    api_version: String,
    kind: String,
    namespace: Option<String>,
    name: Option<String>,
}

impl Selector {
    fn new<K: Object>(namespace: Option<&str>, field_selector: Option<&str>) -> Selector {
        Selector {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            namespace: namespace.filter(|_| K::NAMESPACED).map(ToString::to_string),
            name: field_selector.and_then(name_from_field_selector),
        }
    }

    fn matches(&self, key: &Key) -> bool {
        key.api_version == self.api_version
            && key.kind == self.kind
            && self.namespace.as_ref().map_or(true, |ns| *ns == key.namespace)
            && self.name.as_ref().map_or(true, |name| *name == key.name)
    }
}

/// Only `metadata.name=<name>` selectors are understood.
fn name_from_field_selector(selector: &str) -> Option<String> {
    selector.split(',').find_map(|term| {
        let (field, value) = term.split_once('=')?;
        let value = value.strip_prefix('=').unwrap_or(value);
        (field.trim() == "metadata.name").then(|| value.trim().to_string())
    })
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    revision: u64,
    history: VecDeque<Record>,
    // watches from revisions at or below this one get 410 Gone
    compacted: u64,
    failures: HashSet<Verb>,
}

impl State {
    fn check(&self, verb: Verb) -> kube::Result<()> {
        if self.failures.contains(&verb) {
            return Err(kube::Error::Api(status(
                500,
                "InternalError",
                format!("injected {} failure", verb),
            )));
        }
        Ok(())
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn record(&mut self, record: Record, events: &broadcast::Sender<Signal>) {
        if self.history.len() == HISTORY_CAPACITY {
            if let Some(oldest) = self.history.pop_front() {
                self.compacted = oldest.revision;
            }
        }
        self.history.push_back(record.clone());
        // nobody listening is fine
        let _ = events.send(Signal::Change(record));
    }
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<Signal>,
}

/// Cluster client backed by process memory. Cheap to clone; clones share
/// the same store.
#[derive(Clone)]
pub struct MemoryClient {
    inner: Arc<Inner>,
}

impl Default for MemoryClient {
    fn default() -> Self {
        MemoryClient::new()
    }
}

impl std::fmt::Debug for MemoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("MemoryClient")
            .field("objects", &state.objects.len())
            .field("revision", &state.revision)
            .finish()
    }
}

fn not_found<K: Object>(name: &str) -> kube::Error {
    kube::Error::Api(status(
        404,
        "NotFound",
        format!("{} {:?} not found", K::plural(&()), name),
    ))
}

fn decode<K: Object>(value: Value) -> kube::Result<K> {
    serde_json::from_value(value).map_err(kube::Error::SerdeError)
}

fn encode<K: Object>(object: &K) -> kube::Result<Value> {
    serde_json::to_value(object).map_err(kube::Error::SerdeError)
}

fn revision_of(resource_version: &str) -> u64 {
    resource_version.parse().unwrap_or(0)
}

impl MemoryClient {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        MemoryClient {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                events,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores an object regardless of injected failures.
    pub fn seed<K: Object>(&self, object: K) -> kube::Result<K> {
        let mut state = self.state();
        self.insert(&mut state, object)
    }

    /// Makes every call with this verb fail with an internal error.
    pub fn fail_on(&self, verb: Verb) {
        self.state().failures.insert(verb);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Sends an Error event to all open watches of `K`.
    pub fn send_watch_error<K: Object>(&self, status: ErrorResponse) {
        let _ = self.inner.events.send(Signal::Error {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            status,
        });
    }

    /// Ends all open watch streams, like an API server watch timeout.
    pub fn close_watches(&self) {
        let _ = self.inner.events.send(Signal::Close);
    }

    /// Forgets the change history. Watches resuming from an older
    /// resourceVersion get a 410 Gone error event.
    pub fn compact(&self) {
        let mut state = self.state();
        state.history.clear();
        state.compacted = state.revision;
    }

    /// Number of stored objects of type `K`.
    pub fn count<K: Object>(&self) -> usize {
        self.state()
            .objects
            .keys()
            .filter(|key| key.same_type::<K>())
            .count()
    }

    fn insert<K: Object>(&self, state: &mut State, mut object: K) -> kube::Result<K> {
        let name = match (&object.meta().name, &object.meta().generate_name) {
            (Some(name), _) => name.clone(),
            (None, Some(prefix)) => {
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                format!("{}{}", prefix, &suffix[..5])
            }
            (None, None) => {
                return Err(kube::Error::Api(status(
                    422,
                    "Invalid",
                    "metadata.name or metadata.generateName is required",
                )))
            }
        };
        if K::NAMESPACED && object.namespace().is_none() {
            object.meta_mut().namespace = Some("default".to_string());
        }
        let key = Key::new::<K>(object.namespace().as_deref(), &name);
        if state.objects.contains_key(&key) {
            return Err(kube::Error::Api(status(
                409,
                "AlreadyExists",
                format!("{} {:?} already exists", K::plural(&()), name),
            )));
        }

        let revision = state.next_revision();
        let meta = object.meta_mut();
        meta.name = Some(name);
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.resource_version = Some(revision.to_string());
        meta.generation = Some(1);
        let value = encode(&object)?;

        state.objects.insert(key.clone(), value.clone());
        state.record(
            Record {
                key,
                revision,
                change: Change::Added,
                object: value,
            },
            &self.inner.events,
        );
        Ok(object)
    }
}

#[async_trait]
impl ClusterClient for MemoryClient {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> kube::Result<K> {
        let state = self.state();
        state.check(Verb::Get)?;
        let key = Key::new::<K>(namespace, name);
        match state.objects.get(&key) {
            Some(value) => decode(value.clone()),
            None => Err(not_found::<K>(name)),
        }
    }

    async fn create<K: Object>(&self, object: &K) -> kube::Result<K> {
        let mut state = self.state();
        state.check(Verb::Create)?;
        self.insert(&mut state, object.clone())
    }

    async fn replace<K: Object>(&self, object: &K) -> kube::Result<K> {
        let mut state = self.state();
        state.check(Verb::Update)?;
        let name = object.name_any();
        let key = Key::new::<K>(object.namespace().as_deref(), &name);
        let stored: K = match state.objects.get(&key) {
            Some(value) => decode(value.clone())?,
            None => return Err(not_found::<K>(&name)),
        };
        if let Some(requested) = object.resource_version() {
            if Some(&requested) != stored.meta().resource_version.as_ref() {
                return Err(kube::Error::Api(status(
                    409,
                    "Conflict",
                    format!(
                        "Operation cannot be fulfilled on {} {:?}: the object has been modified",
                        K::plural(&()),
                        name
                    ),
                )));
            }
        }

        let revision = state.next_revision();
        let mut updated = object.clone();
        let meta = updated.meta_mut();
        meta.uid = stored.meta().uid.clone();
        meta.resource_version = Some(revision.to_string());
        meta.generation = Some(stored.meta().generation.unwrap_or(1) + 1);
        let value = encode(&updated)?;

        state.objects.insert(key.clone(), value.clone());
        state.record(
            Record {
                key,
                revision,
                change: Change::Modified,
                object: value,
            },
            &self.inner.events,
        );
        Ok(updated)
    }

    async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> kube::Result<()> {
        let mut state = self.state();
        state.check(Verb::Delete)?;
        let key = Key::new::<K>(namespace, name);
        let removed = match state.objects.remove(&key) {
            Some(value) => value,
            None => return Err(not_found::<K>(name)),
        };
        let revision = state.next_revision();
        let mut object: K = decode(removed)?;
        object.meta_mut().resource_version = Some(revision.to_string());
        let value = encode(&object)?;
        state.record(
            Record {
                key,
                revision,
                change: Change::Deleted,
                object: value,
            },
            &self.inner.events,
        );
        Ok(())
    }

    async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> kube::Result<Vec<K>> {
        let state = self.state();
        state.check(Verb::List)?;
        let selector = Selector::new::<K>(namespace, params.field_selector.as_deref());
        state
            .objects
            .iter()
            .filter(|(key, _)| selector.matches(key))
            .map(|(_, value)| decode(value.clone()))
            .collect()
    }

    async fn watch<K: Object>(
        &self,
        namespace: Option<&str>,
        params: &WatchParams,
        version: &str,
    ) -> kube::Result<EventStream<K>> {
        let selector = Selector::new::<K>(namespace, params.field_selector.as_deref());
        let since = revision_of(version);

        // snapshot the history and subscribe under one lock, so no write
        // falls in between
        let (replay, rx) = {
            let state = self.state();
            state.check(Verb::Watch)?;
            if since > 0 && since < state.compacted {
                let gone = status(
                    410,
                    "Expired",
                    format!("too old resource version: {} ({})", since, state.compacted),
                );
                return Ok(stream::iter(vec![Ok(WatchEvent::Error(gone))]).boxed());
            }
            let replay: Vec<Record> = match since {
                0 => Vec::new(),
                _ => state
                    .history
                    .iter()
                    .filter(|record| record.revision > since && selector.matches(&record.key))
                    .cloned()
                    .collect(),
            };
            (replay, self.inner.events.subscribe())
        };

        let replayed = stream::iter(replay.into_iter().map(to_event::<K>));
        let live = BroadcastStream::new(rx)
            // a lagging receiver ends the stream; the watcher resumes from history
            .take_while(|signal| future::ready(matches!(signal, Ok(s) if !matches!(s, Signal::Close))))
            .filter_map(move |signal| {
                let event = match signal {
                    Ok(Signal::Change(record)) if selector.matches(&record.key) => {
                        Some(to_event::<K>(record))
                    }
                    Ok(Signal::Error {
                        api_version,
                        kind,
                        status,
                    }) if api_version == selector.api_version && kind == selector.kind => {
                        Some(Ok(WatchEvent::Error(status)))
                    }
                    _ => None,
                };
                future::ready(event)
            });
        Ok(replayed.chain(live).boxed())
    }
}

fn to_event<K: Object>(record: Record) -> kube::Result<WatchEvent<K>> {
    let object = decode::<K>(record.object)?;
    Ok(match record.change {
        Change::Added => WatchEvent::Added(object),
        Change::Modified => WatchEvent::Modified(object),
        Change::Deleted => WatchEvent::Deleted(object),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{classify_kube, ErrorClass};
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
    use kube::api::ObjectMeta;

    fn config_map(name: &str, namespace: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn parses_name_selectors() {
        assert_eq!(name_from_field_selector("metadata.name=foo"), Some("foo".to_string()));
        assert_eq!(name_from_field_selector("metadata.name==foo"), Some("foo".to_string()));
        assert_eq!(
            name_from_field_selector("status.phase=Running,metadata.name=bar"),
            Some("bar".to_string())
        );
        assert_eq!(name_from_field_selector("status.phase=Running"), None);
    }

    #[tokio::test]
    async fn create_assigns_identity() {
        let client = MemoryClient::new();
        let created = client.create(&config_map("test", "ns")).await.unwrap();

        assert!(created.metadata.uid.is_some());
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));

        let err = client.create(&config_map("test", "ns")).await.unwrap_err();
        assert_eq!(classify_kube(&err), ErrorClass::AlreadyExists);

        let fetched: ConfigMap = client.get(Some("ns"), "test").await.unwrap();
        assert_eq!(fetched.metadata.uid, created.metadata.uid);
    }

    #[tokio::test]
    async fn generate_name_is_honoured() {
        let client = MemoryClient::new();
        let mut cm = config_map("unused", "ns");
        cm.metadata.name = None;
        cm.metadata.generate_name = Some("prefix-".to_string());

        let created = client.create(&cm).await.unwrap();
        let name = created.metadata.name.unwrap();
        assert!(name.starts_with("prefix-") && name.len() == "prefix-".len() + 5, "{}", name);
    }

    #[tokio::test]
    async fn replace_checks_resource_version() {
        let client = MemoryClient::new();
        let created = client.create(&config_map("test", "ns")).await.unwrap();

        let updated = client.replace(&created).await.unwrap();
        assert_eq!(updated.metadata.resource_version.as_deref(), Some("2"));

        let err = client.replace(&created).await.unwrap_err();
        assert_eq!(classify_kube(&err), ErrorClass::Conflict);

        let err = client.replace(&config_map("missing", "ns")).await.unwrap_err();
        assert_eq!(classify_kube(&err), ErrorClass::NotFound);
    }

    #[tokio::test]
    async fn cluster_scoped_objects_ignore_namespace() {
        let client = MemoryClient::new();
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some("team".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        client.create(&ns).await.unwrap();

        let fetched: Namespace = client.get(Some("whatever"), "team").await.unwrap();
        assert_eq!(fetched.metadata.name.as_deref(), Some("team"));
        assert_eq!(client.count::<Namespace>(), 1);
        assert_eq!(client.count::<ConfigMap>(), 0);
    }

    #[tokio::test]
    async fn list_filters_namespace_and_name() {
        let client = MemoryClient::new();
        client.seed(config_map("a", "one")).unwrap();
        client.seed(config_map("b", "one")).unwrap();
        client.seed(config_map("a", "two")).unwrap();

        let all: Vec<ConfigMap> = client.list(None, &ListParams::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let one: Vec<ConfigMap> = client.list(Some("one"), &ListParams::default()).await.unwrap();
        assert_eq!(one.len(), 2);

        let named: Vec<ConfigMap> = client
            .list(None, &ListParams::default().fields("metadata.name=a"))
            .await
            .unwrap();
        assert_eq!(named.len(), 2);
    }

    #[tokio::test]
    async fn injected_failures() {
        let client = MemoryClient::new();
        client.seed(config_map("test", "ns")).unwrap();
        client.fail_on(Verb::Get);

        let err = client.get::<ConfigMap>(Some("ns"), "test").await.unwrap_err();
        assert!(err.to_string().contains("injected get failure"), "{}", err);

        client.clear_failures();
        client.get::<ConfigMap>(Some("ns"), "test").await.unwrap();
    }

    #[tokio::test]
    async fn watch_replays_history_after_version() {
        let client = MemoryClient::new();
        let created = client.create(&config_map("test", "ns")).await.unwrap();
        let version = created.metadata.resource_version.clone().unwrap();
        client.replace(&created).await.unwrap();
        client.delete::<ConfigMap>(Some("ns"), "test").await.unwrap();

        let mut stream = client
            .watch::<ConfigMap>(Some("ns"), &WatchParams::default(), &version)
            .await
            .unwrap();
        assert!(matches!(stream.next().await, Some(Ok(WatchEvent::Modified(_)))));
        assert!(matches!(stream.next().await, Some(Ok(WatchEvent::Deleted(_)))));

        client.close_watches();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn watch_from_compacted_version_is_gone() {
        let client = MemoryClient::new();
        let created = client.create(&config_map("test", "ns")).await.unwrap();
        client.replace(&created).await.unwrap();
        client.compact();

        let mut stream = client
            .watch::<ConfigMap>(Some("ns"), &WatchParams::default(), "1")
            .await
            .unwrap();
        match stream.next().await {
            Some(Ok(WatchEvent::Error(status))) => assert_eq!(status.code, 410),
            other => panic!("expected 410, got {:?}", other),
        }
    }
}
