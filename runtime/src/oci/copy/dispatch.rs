//! Bounded-parallel graph copy.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use tokio::sync::{OnceCell, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use a3s_oci_core::{Descriptor, Digest, OciError, Result};

use super::{copy_content, Handler};
use crate::content::{Ingester, Provider};

/// Copy `root` and its descendants with at most `parallelism` reads or
/// copies in flight.
///
/// Siblings are copied concurrently; a parent is copied only after all of
/// its children. A blob shared by several parents is copied once. The
/// first failure cancels the remaining work and is returned.
pub async fn dispatch(
    from: &dyn Provider,
    to: &dyn Ingester,
    handler: &dyn Handler,
    root: &Descriptor,
    parallelism: usize,
    cancel: &CancellationToken,
) -> Result<()> {
    Dispatcher::new(from, to, handler, parallelism, cancel)
        .visit(root.clone())
        .await
}

/// Like [`dispatch`], but leaves `root` itself uncopied.
pub async fn dispatch_children(
    from: &dyn Provider,
    to: &dyn Ingester,
    handler: &dyn Handler,
    root: &Descriptor,
    parallelism: usize,
    cancel: &CancellationToken,
) -> Result<()> {
    Dispatcher::new(from, to, handler, parallelism, cancel)
        .copy_children(root)
        .await
}

struct Dispatcher<'a> {
    from: &'a dyn Provider,
    to: &'a dyn Ingester,
    handler: &'a dyn Handler,
    limit: Semaphore,
    visited: DashMap<Digest, Arc<OnceCell<()>>>,
    cancel: CancellationToken,
}

impl<'a> Dispatcher<'a> {
    fn new(
        from: &'a dyn Provider,
        to: &'a dyn Ingester,
        handler: &'a dyn Handler,
        parallelism: usize,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            from,
            to,
            handler,
            limit: Semaphore::new(parallelism.max(1)),
            visited: DashMap::new(),
            cancel: cancel.clone(),
        }
    }

    fn visit(&self, desc: Descriptor) -> BoxFuture<'_, Result<()>> {
        async move {
            let cell = self.visited.entry(desc.digest.clone()).or_default().clone();
            cell.get_or_try_init(|| self.copy_tree(&desc)).await?;
            Ok(())
        }
        .boxed()
    }

    async fn copy_tree(&self, desc: &Descriptor) -> Result<()> {
        self.copy_children(desc).await?;
        let _permit = self.acquire().await?;
        copy_content(self.from, self.to, desc).await
    }

    async fn copy_children(&self, desc: &Descriptor) -> Result<()> {
        let children = {
            let _permit = self.acquire().await?;
            self.handler.children(self.from, desc).await?
        };
        try_join_all(children.into_iter().map(|child| self.visit(child))).await?;
        Ok(())
    }

    async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(OciError::Cancelled),
            permit = self.limit.acquire() => permit.map_err(|_| OciError::Cancelled),
        }
    }
}
