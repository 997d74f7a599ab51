use crate::{builder::ObjectBuilder, client::ClusterClient, errors::Result};
use k8s_openapi::api::core::v1::Namespace;
use std::{
    ops::{Deref, DerefMut},
    time::Duration,
};

/// Namespace building
pub struct NamespaceBuilder<C: ClusterClient = kube::Client>(ObjectBuilder<Namespace, C>);

impl<C: ClusterClient> NamespaceBuilder<C> {
    pub fn new(client: C, name: &str) -> Self {
        NamespaceBuilder(ObjectBuilder::cluster_scoped(client, name))
    }

    pub async fn pull(client: C, name: &str) -> Result<Self> {
        ObjectBuilder::pull(client, name, None)
            .await
            .map(NamespaceBuilder)
    }

    pub fn with_label(&mut self, key: &str, value: &str) -> &mut Self {
        self.0.with_label(key, value);
        self
    }

    pub async fn wait_until_active(&self, timeout: Duration) -> Result<()> {
        self.0.wait_until_in_status("Active", timeout).await
    }
}

impl<C: ClusterClient> Deref for NamespaceBuilder<C> {
    type Target = ObjectBuilder<Namespace, C>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<C: ClusterClient> DerefMut for NamespaceBuilder<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
