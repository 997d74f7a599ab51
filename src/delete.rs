//! Deleting objects and waiting for them to go away.

use crate::{
    builder::ObjectBuilder,
    client::{ClusterClient, Object},
    errors::{is_not_found, Result, Verb},
    poll::poll_until_timeout,
};
use std::time::Duration;

impl<K, C> ObjectBuilder<K, C>
where
    K: Object,
    C: ClusterClient,
{
    /// Deletes the object. Deleting an absent object succeeds.
    #[tracing::instrument(skip(self), fields(kind = %K::kind(&()), name = self.name()))]
    pub async fn delete(&mut self) -> Result<()> {
        self.validate()?;
        if !self.exists().await {
            self.set_object(None);
            return Ok(());
        }
        match self.client().delete::<K>(self.namespace(), self.name()).await {
            Ok(()) => tracing::info!("deleted"),
            // someone else was faster
            Err(err) if is_not_found(&err) => (),
            Err(err) => return Err(self.api_error(Verb::Delete, err)),
        }
        self.set_object(None);
        Ok(())
    }

    /// Waits until the object is gone. An object recreated under the same
    /// name counts as gone if the last observed one had a different uid.
    pub async fn wait_until_deleted(&self, timeout: Duration) -> Result<()> {
        self.validate()?;
        let uid = self.object().and_then(|object| object.meta().uid.clone());
        self.wait_gone(uid.as_deref(), timeout).await
    }

    /// Deletes the object and waits until it is gone.
    pub async fn delete_and_wait(&mut self, timeout: Duration) -> Result<()> {
        self.validate()?;
        let exists = self.exists().await;
        let uid = self.object().and_then(|object| object.meta().uid.clone());
        self.delete().await?;
        if !exists {
            return Ok(());
        }
        self.wait_gone(uid.as_deref(), timeout).await
    }

    #[tracing::instrument(skip(self), fields(kind = %K::kind(&()), name = self.name()))]
    async fn wait_gone(&self, uid: Option<&str>, timeout: Duration) -> Result<()> {
        let this = self;
        poll_until_timeout(self.poll_interval(), timeout, true, move || async move {
            match this.client().get::<K>(this.namespace(), this.name()).await {
                Ok(object) => {
                    let replaced = uid.is_some() && object.meta().uid.as_deref() != uid;
                    if !replaced {
                        tracing::debug!("object still exists");
                    }
                    Ok(replaced)
                }
                Err(err) if is_not_found(&err) => Ok(true),
                Err(err) => Err(this.api_error(Verb::Get, err)),
            }
        })
        .await
    }
}
