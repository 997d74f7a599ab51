//! Builders for cluster objects.
//!
//! An [`ObjectBuilder`] keeps the desired state of one object (its
//! definition) next to the state last seen on the cluster, and knows how to
//! bring the two together. Input problems are recorded on the builder
//! instead of being returned from setters; every cluster operation checks
//! for them first.

mod configmap;
mod namespace;
mod pod;

pub use configmap::ConfigMapBuilder;
pub use namespace::NamespaceBuilder;
pub use pod::PodBuilder;

use crate::{
    client::{ClusterClient, Object},
    errors::{status, BuilderError, Error, Result, Verb},
    poll::{DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT},
};
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{ListParams, Resource, ResourceExt};
use std::{collections::BTreeMap, time::Duration};

/// Modifies a builder. Options run in order; the first failure is
/// recorded on the builder.
pub type BuilderOption<K, C> =
    Box<dyn FnOnce(&mut ObjectBuilder<K, C>) -> anyhow::Result<()> + Send>;

/// Generic builder for any typed object
pub struct ObjectBuilder<K: Object, C: ClusterClient = kube::Client> {
    client: C,
    definition: K,
    object: Option<K>,
    error: Option<BuilderError>,
    poll_interval: Duration,
}

impl<K, C> ObjectBuilder<K, C>
where
    K: Object + Resource<Scope = NamespaceResourceScope> + Default,
    C: ClusterClient,
{
    pub fn namespaced(client: C, name: &str, namespace: &str) -> Self {
        Self::from_name(client, name, Some(namespace))
    }
}

impl<K, C> ObjectBuilder<K, C>
where
    K: Object + Resource<Scope = ClusterResourceScope> + Default,
    C: ClusterClient,
{
    pub fn cluster_scoped(client: C, name: &str) -> Self {
        Self::from_name(client, name, None)
    }
}

impl<K, C> ObjectBuilder<K, C>
where
    K: Object + Default,
    C: ClusterClient,
{
    fn from_name(client: C, name: &str, namespace: Option<&str>) -> Self {
        let mut definition = K::default();
        let meta = definition.meta_mut();
        meta.name = Some(name.to_string());
        meta.namespace = namespace.map(ToString::to_string);
        Self::from_definition(client, definition)
    }

    /// Loads an existing object. `namespace` is ignored for cluster-scoped
    /// kinds.
    #[tracing::instrument(skip(client), fields(kind = %K::kind(&())))]
    pub async fn pull(client: C, name: &str, namespace: Option<&str>) -> Result<Self> {
        let namespace = namespace.filter(|_| K::NAMESPACED);
        let mut builder = Self::from_name(client, name, namespace);
        builder.validate()?;
        let object = builder.get().await?;
        builder.definition = object.clone();
        builder.object = Some(object);
        Ok(builder)
    }
}

impl<K, C> ObjectBuilder<K, C>
where
    K: Object,
    C: ClusterClient,
{
    /// Wraps an existing definition.
    pub fn from_definition(client: C, definition: K) -> Self {
        let mut builder = ObjectBuilder {
            client,
            definition,
            object: None,
            error: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        };
        let meta = builder.definition.meta();
        let has_name = meta.name.as_deref().map_or(false, |n| !n.is_empty())
            || meta.generate_name.as_deref().map_or(false, |n| !n.is_empty());
        let has_namespace = meta.namespace.as_deref().map_or(false, |n| !n.is_empty());
        if !has_name {
            builder.record(BuilderError::NameEmpty);
        } else if K::NAMESPACED && !has_namespace {
            builder.record(BuilderError::NamespaceEmpty);
        }
        builder
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Desired state
    pub fn definition(&self) -> &K {
        &self.definition
    }

    pub fn definition_mut(&mut self) -> &mut K {
        &mut self.definition
    }

    /// State last observed on the cluster
    pub fn object(&self) -> Option<&K> {
        self.object.as_ref()
    }

    pub fn name(&self) -> &str {
        self.definition.meta().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        match K::NAMESPACED {
            true => self.definition.meta().namespace.as_deref(),
            false => None,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Keeps the first error only
    pub(crate) fn record(&mut self, error: BuilderError) {
        if self.error.is_none() {
            tracing::debug!(kind = %K::kind(&()), name = self.name(), error = %error, "builder is invalid");
            self.error = Some(error);
        }
    }

    pub(crate) fn api_error(&self, verb: Verb, source: kube::Error) -> Error {
        Error::api::<K>(verb, self.name(), source)
    }

    pub(crate) fn set_object(&mut self, object: Option<K>) {
        self.object = object;
    }

    /// Returns the recorded input error, if any.
    pub fn validate(&self) -> Result<()> {
        match &self.error {
            Some(err) => Err(Error::Builder(err.clone())),
            None => Ok(()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    pub fn with_label(&mut self, key: &str, value: &str) -> &mut Self {
        if key.is_empty() {
            self.record(BuilderError::Invalid("label key cannot be empty".to_string()));
            return self;
        }
        self.definition
            .meta_mut()
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_annotation(&mut self, key: &str, value: &str) -> &mut Self {
        if key.is_empty() {
            self.record(BuilderError::Invalid(
                "annotation key cannot be empty".to_string(),
            ));
            return self;
        }
        self.definition
            .meta_mut()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    /// How often waiters check the cluster
    pub fn with_poll_interval(&mut self, interval: Duration) -> &mut Self {
        if interval.is_zero() {
            self.record(BuilderError::Invalid(
                "poll interval must be positive".to_string(),
            ));
            return self;
        }
        self.poll_interval = interval;
        self
    }

    /// Applies options in order. Does nothing on an invalid builder.
    pub fn with_options(
        &mut self,
        options: impl IntoIterator<Item = BuilderOption<K, C>>,
    ) -> &mut Self {
        for option in options {
            if !self.is_valid() {
                break;
            }
            if let Err(err) = option(self) {
                self.record(BuilderError::Option(format!("{:#}", err)));
            }
        }
        self
    }

    /// Fetches the object named by the definition.
    pub async fn get(&self) -> Result<K> {
        self.validate()?;
        self.client
            .get::<K>(self.namespace(), self.name())
            .await
            .map_err(|err| self.api_error(Verb::Get, err))
    }

    /// Checks whether the object exists, remembering it if so.
    pub async fn exists(&mut self) -> bool {
        if self.validate().is_err() {
            return false;
        }
        match self.get().await {
            Ok(object) => {
                self.object = Some(object);
                true
            }
            Err(err) => {
                tracing::debug!(error = %err, "object does not exist");
                false
            }
        }
    }

    /// Creates the object unless it already exists.
    #[tracing::instrument(skip(self), fields(kind = %K::kind(&()), name = self.name()))]
    pub async fn create(&mut self) -> Result<&K> {
        self.validate()?;
        if !self.exists().await {
            // the server rejects creates that carry a resourceVersion
            self.definition.meta_mut().resource_version = None;
            let created = self
                .client
                .create(&self.definition)
                .await
                .map_err(|err| self.api_error(Verb::Create, err))?;
            tracing::info!(name = created.meta().name.as_deref(), "created");
            self.adopt(created);
        }
        self.current()
    }

    /// Replaces the object with the definition. With `force`, a failed
    /// replace is retried as delete followed by create.
    #[tracing::instrument(skip(self), fields(kind = %K::kind(&()), name = self.name()))]
    pub async fn update(&mut self, force: bool) -> Result<&K> {
        self.validate()?;
        if !self.exists().await {
            let missing = status(
                404,
                "NotFound",
                format!("cannot update non-existent {}", K::kind(&())),
            );
            return Err(self.api_error(Verb::Update, kube::Error::Api(missing)));
        }
        if let Some(current) = &self.object {
            self.definition.meta_mut().resource_version = current.resource_version();
        }

        let replaced = self.client.replace(&self.definition).await;
        match replaced {
            Ok(updated) => {
                self.object = Some(updated);
                self.current()
            }
            Err(err) if force => {
                tracing::info!(error = %err, "update failed, recreating object");
                self.delete_and_wait(DEFAULT_POLL_TIMEOUT).await?;
                self.definition.meta_mut().resource_version = None;
                let created = self
                    .client
                    .create(&self.definition)
                    .await
                    .map_err(|err| self.api_error(Verb::Create, err))?;
                self.adopt(created);
                self.current()
            }
            Err(err) => Err(self.api_error(Verb::Update, err)),
        }
    }

    // a definition with only generateName takes the name the server picked
    fn adopt(&mut self, created: K) {
        if self.name().is_empty() {
            self.definition.meta_mut().name = created.meta().name.clone();
        }
        self.object = Some(created);
    }

    fn current(&self) -> Result<&K> {
        // only called right after the object was stored
        self.object.as_ref().ok_or_else(|| {
            self.api_error(
                Verb::Get,
                kube::Error::Api(status(404, "NotFound", "object is not known")),
            )
        })
    }

    /// Lists objects of this kind as builders. `None` namespace means all
    /// namespaces.
    pub async fn list(client: C, namespace: Option<&str>, params: &ListParams) -> Result<Vec<Self>> {
        let items = client
            .list::<K>(namespace, params)
            .await
            .map_err(|err| Error::api::<K>(Verb::List, namespace.unwrap_or_default(), err))?;
        tracing::debug!(kind = %K::kind(&()), count = items.len(), "listed objects");
        Ok(items
            .into_iter()
            .map(|item| {
                let mut builder = Self::from_definition(client.clone(), item.clone());
                builder.object = Some(item);
                builder
            })
            .collect())
    }
}
