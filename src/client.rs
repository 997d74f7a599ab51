//! Generic access to the cluster API.
//!
//! Builders and waiters only talk to the cluster through [`ClusterClient`],
//! so they work the same against a real `kube::Client` and against
//! [`MemoryClient`](crate::memory::MemoryClient).

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{
    api::{DeleteParams, ListParams, PostParams, Resource, ResourceExt, WatchEvent, WatchParams},
    Api,
};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;

/// Scope of a resource kind, known at compile time.
pub trait ApiScope {
    const NAMESPACED: bool;

    fn api<K>(client: kube::Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>;
}

impl ApiScope for NamespaceResourceScope {
    const NAMESPACED: bool = true;

    fn api<K>(client: kube::Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>,
    {
        match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        }
    }
}

impl ApiScope for ClusterResourceScope {
    const NAMESPACED: bool = false;

    fn api<K>(client: kube::Client, _namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>,
    {
        Api::all(client)
    }
}

/// Typed resource the builders can manage.
///
/// Lists are always `Vec<K>` of the same `K`, so an object type cannot be
/// paired with the wrong list type.
pub trait Object:
    Resource<DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const NAMESPACED: bool;

    fn api(client: kube::Client, namespace: Option<&str>) -> Api<Self>;
}

impl<K> Object for K
where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    K::Scope: ApiScope,
{
    const NAMESPACED: bool = <K::Scope as ApiScope>::NAMESPACED;

    fn api(client: kube::Client, namespace: Option<&str>) -> Api<Self> {
        <K::Scope as ApiScope>::api::<K>(client, namespace)
    }
}

pub type EventStream<K> = BoxStream<'static, kube::Result<WatchEvent<K>>>;

/// Operations on the cluster object store
#[async_trait]
pub trait ClusterClient: Clone + Send + Sync + 'static {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> kube::Result<K>;

    /// Creates the object in the namespace set on its metadata.
    async fn create<K: Object>(&self, object: &K) -> kube::Result<K>;

    /// Replaces the object. Fails with a conflict if its
    /// resourceVersion is stale.
    async fn replace<K: Object>(&self, object: &K) -> kube::Result<K>;

    async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> kube::Result<()>;

    /// Lists objects. `None` namespace means all namespaces.
    async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> kube::Result<Vec<K>>;

    /// Opens a watch starting after `version`.
    async fn watch<K: Object>(
        &self,
        namespace: Option<&str>,
        params: &WatchParams,
        version: &str,
    ) -> kube::Result<EventStream<K>>;
}

fn field_manager() -> PostParams {
    PostParams {
        field_manager: Some("kube-infra".to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl ClusterClient for kube::Client {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> kube::Result<K> {
        K::api(self.clone(), namespace).get(name).await
    }

    async fn create<K: Object>(&self, object: &K) -> kube::Result<K> {
        let namespace = object.namespace();
        K::api(self.clone(), namespace.as_deref())
            .create(&field_manager(), object)
            .await
    }

    async fn replace<K: Object>(&self, object: &K) -> kube::Result<K> {
        let namespace = object.namespace();
        K::api(self.clone(), namespace.as_deref())
            .replace(&object.name_any(), &field_manager(), object)
            .await
    }

    async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> kube::Result<()> {
        // either the object is gone, or it is finalizing; both count as deleted here
        K::api(self.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> kube::Result<Vec<K>> {
        let list = K::api(self.clone(), namespace).list(params).await?;
        Ok(list.items)
    }

    async fn watch<K: Object>(
        &self,
        namespace: Option<&str>,
        params: &WatchParams,
        version: &str,
    ) -> kube::Result<EventStream<K>> {
        let stream = K::api(self.clone(), namespace)
            .watch(params, version)
            .await?;
        Ok(stream.boxed())
    }
}
