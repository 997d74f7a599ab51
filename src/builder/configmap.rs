use crate::{
    builder::ObjectBuilder,
    client::ClusterClient,
    errors::{BuilderError, Result},
};
use k8s_openapi::{api::core::v1::ConfigMap, ByteString};
use std::{
    collections::BTreeMap,
    ops::{Deref, DerefMut},
};

/// Utility for configmap creation
pub struct ConfigMapBuilder<C: ClusterClient = kube::Client>(ObjectBuilder<ConfigMap, C>);

impl<C: ClusterClient> ConfigMapBuilder<C> {
    pub fn new(client: C, name: &str, namespace: &str) -> Self {
        ConfigMapBuilder(ObjectBuilder::namespaced(client, name, namespace))
    }

    pub async fn pull(client: C, name: &str, namespace: &str) -> Result<Self> {
        ObjectBuilder::pull(client, name, Some(namespace))
            .await
            .map(ConfigMapBuilder)
    }

    /// Replaces string data. An empty map is rejected.
    pub fn with_data(&mut self, data: BTreeMap<String, String>) -> &mut Self {
        if data.is_empty() {
            self.0
                .record(BuilderError::Invalid("configmap data cannot be empty".to_string()));
            return self;
        }
        self.0.definition_mut().data = Some(data);
        self
    }

    pub fn add_binary(&mut self, key: &str, data: Vec<u8>) -> &mut Self {
        if key.is_empty() {
            self.0
                .record(BuilderError::Invalid("configmap key cannot be empty".to_string()));
            return self;
        }
        self.0
            .definition_mut()
            .binary_data
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), ByteString(data));
        self
    }

    pub fn immutable(&mut self) -> &mut Self {
        self.0.definition_mut().immutable = Some(true);
        self
    }

    pub fn into_inner(self) -> ObjectBuilder<ConfigMap, C> {
        self.0
    }
}

impl<C: ClusterClient> Deref for ConfigMapBuilder<C> {
    type Target = ObjectBuilder<ConfigMap, C>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<C: ClusterClient> DerefMut for ConfigMapBuilder<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
