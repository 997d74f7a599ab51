use crate::{
    builder::ObjectBuilder,
    client::ClusterClient,
    errors::{BuilderError, Result},
};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use std::{
    ops::{Deref, DerefMut},
    time::Duration,
};

/// Pod building. The pod starts with a single container called `main`.
pub struct PodBuilder<C: ClusterClient = kube::Client>(ObjectBuilder<Pod, C>);

impl<C: ClusterClient> PodBuilder<C> {
    pub fn new(client: C, name: &str, namespace: &str, image: &str) -> Self {
        let mut builder = ObjectBuilder::<Pod, C>::namespaced(client, name, namespace);
        builder.definition_mut().spec = Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        });
        if image.is_empty() {
            builder.record(BuilderError::Invalid("pod image cannot be empty".to_string()));
        }
        PodBuilder(builder)
    }

    pub async fn pull(client: C, name: &str, namespace: &str) -> Result<Self> {
        ObjectBuilder::pull(client, name, Some(namespace))
            .await
            .map(PodBuilder)
    }

    fn container(&mut self) -> Option<&mut Container> {
        self.0.definition_mut().spec.as_mut()?.containers.first_mut()
    }

    pub fn with_command(&mut self, command: Vec<String>) -> &mut Self {
        match self.container() {
            Some(container) => container.command = Some(command),
            None => self.0.record(BuilderError::Invalid("pod has no containers".to_string())),
        }
        self
    }

    /// Pins the pod to a node.
    pub fn with_node(&mut self, node: &str) -> &mut Self {
        if node.is_empty() {
            self.0.record(BuilderError::Invalid("node name cannot be empty".to_string()));
            return self;
        }
        self.0
            .definition_mut()
            .spec
            .get_or_insert_with(Default::default)
            .node_name = Some(node.to_string());
        self
    }

    pub async fn wait_until_running(&self, timeout: Duration) -> Result<()> {
        self.0.wait_until_in_status("Running", timeout).await
    }
}

impl<C: ClusterClient> Deref for PodBuilder<C> {
    type Target = ObjectBuilder<Pod, C>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<C: ClusterClient> DerefMut for PodBuilder<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
