use std::{fmt::Debug, hash::Hash};

use async_trait::async_trait;

use crate::{
    data::{KeySet, ValueSet},
    error::StoreResult,
};

/// A batched fetch strategy for one kind of entity.
///
/// A source receives every distinct key requested since the previous flush
/// and must answer all of them at once. Because the only way to build a
/// [`ValueSet`] is through the [`KeySet`], every key is guaranteed an entry;
/// use `Option`, an empty `Vec`, or a default value for keys that have no
/// backing row.
#[async_trait]
pub trait Source: Send + Sync + 'static {
    type Key: Eq + Hash + Clone + Debug + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    /// Name used in logs and errors.
    const NAME: &'static str;

    async fn fetch_batch(&self, keys: KeySet<Self::Key>)
        -> StoreResult<ValueSet<Self::Key, Self::Value>>;
}
