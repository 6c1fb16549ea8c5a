//! Deferred per-repository detail loading.
//!
//! Environments, action variables, and autolinks are expensive to fetch
//! for every repository up front. [`MappedEntityLazyLoader`] defers the
//! fetch until the reconciliator's equality check actually reaches the
//! field, and evaluates the producer at most once.

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use tokio::sync::OnceCell;

use crate::github::GithubError;

type Producer<V> = Box<dyn Fn() -> BoxFuture<'static, Result<BTreeMap<String, V>, GithubError>> + Send + Sync>;

pub(crate) struct MappedEntityLazyLoader<V> {
    cell: OnceCell<BTreeMap<String, V>>,
    producer: Producer<V>,
}

impl<V> MappedEntityLazyLoader<V> {
    pub(crate) fn new(producer: Producer<V>) -> Self {
        Self {
            cell: OnceCell::new(),
            producer,
        }
    }

    /// A loader that is already materialized. Used when a cache refresh
    /// already knows the value, and by tests.
    pub(crate) fn ready(value: BTreeMap<String, V>) -> Self {
        Self {
            cell: OnceCell::new_with(Some(value)),
            producer: Box::new(|| Box::pin(async { Ok(BTreeMap::new()) })),
        }
    }

    /// Returns the mapping, producing it on first call. Safe to call any
    /// number of times; concurrent callers share one evaluation.
    pub(crate) async fn get(&self) -> Result<&BTreeMap<String, V>, GithubError> {
        self.cell.get_or_try_init(|| (self.producer)()).await
    }

    /// The value, if already materialized.
    pub(crate) fn peek(&self) -> Option<&BTreeMap<String, V>> {
        self.cell.get()
    }
}

impl<V> std::fmt::Debug for MappedEntityLazyLoader<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedEntityLazyLoader")
            .field("materialized", &self.cell.initialized())
            .finish()
    }
}
