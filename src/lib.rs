//! forumloader is the batched data-loading layer behind the read path of a
//! small discussion forum. It is an implementation of the
//! [dataloader pattern](https://github.com/graphql/dataloader): scattered
//! requests for individual entities, issued while resolving one
//! graph-shaped query, are coalesced into a single batched lookup per entity
//! type, and the results are handed back to each requester by key. Within
//! one request, every (source, key) pair is fetched at most once.
//!
//! ## Overview
//!
//! A [`Source`] is a batched fetch strategy for one kind of entity. It
//! receives a [`KeySet`] with every distinct key requested since the last
//! flush and answers with a [`ValueSet`]. The only way to create a
//! [`ValueSet`] is through the methods on [`KeySet`], which guarantee exactly
//! one value per key; keys without a backing row map to `None`, an empty
//! list, `0`, or `false`, depending on the source.
//!
//! ```
//! use async_trait::async_trait;
//! use forumloader::{KeySet, Loader, LoaderConfig, Source, StoreResult, ValueSet};
//!
//! struct Squares;
//!
//! #[async_trait]
//! impl Source for Squares {
//!     type Key = i64;
//!     type Value = i64;
//!     const NAME: &'static str = "squares";
//!
//!     async fn fetch_batch(&self, keys: KeySet<i64>) -> StoreResult<ValueSet<i64, i64>> {
//!         Ok(keys.into_values(|key| key * key))
//!     }
//! }
//!
//! let loader = Loader::new(Squares, LoaderConfig::default());
//!
//! // Both loads land in the same batch.
//! let values = futures::executor::block_on(async {
//!     futures::future::try_join(loader.load(3), loader.load(4)).await
//! });
//! assert_eq!(values.unwrap(), (9, 16));
//! ```
//!
//! A [`Loader`] fronts one source for one request. [`Loader::load`] never
//! fetches anything itself: it records the key in the accumulating batch and
//! returns a [`Placeholder`], a future that resolves once the batch has been
//! flushed. When the batch is flushed is decided by [`LoaderConfig`]:
//!
//! - By default a batch flushes as soon as a poll of one of its placeholders
//!   sees that nothing was added to it since the previous poll. In practice
//!   this means "after every sibling in the current resolution pass has had
//!   its chance to enqueue".
//! - `window` replaces that with a timed window, as a long-running server
//!   would use.
//! - `max_batch_size` flushes a batch as soon as it reaches that many keys.
//!   Later keys start a new batch.
//! - `flush_timeout` puts a deadline on each batched fetch.
//!
//! [`Loader::flush`] closes the window explicitly.
//!
//! The forum's loaders are bundled in a [`RequestScope`], which is built once
//! per inbound query and torn down after it. The [`forum`] module resolves
//! the full thread → comments → likes tree through a scope, with one flush
//! per source per level:
//!
//! ```
//! use std::sync::Arc;
//! use forumloader::{forum, ForumStore, LoaderConfig, RequestScope, Response, SqliteStore};
//!
//! let store = SqliteStore::open_in_memory()?;
//! let alice = store.create_user("alice", "!")?;
//! let thread = store.create_thread(alice.id, "Hello", "First post")?;
//! store.create_comment(alice.id, thread.id, "Replying to myself")?;
//!
//! let store: Arc<dyn ForumStore> = Arc::new(store);
//! let scope = RequestScope::new(store, Some(alice.id), &LoaderConfig::default());
//! let threads = futures::executor::block_on(forum::threads(&scope))?;
//! let response = Response::new(threads, scope);
//!
//! assert!(response.errors.is_empty());
//! assert_eq!(response.data[0].comment_count, Some(1));
//! # Ok::<(), forumloader::StoreError>(())
//! ```
//!
//! ## Design notes
//!
//! ### Poll-driven design
//!
//! All of the asynchronous work is driven by polling [`Placeholder`]s. The
//! batched fetch is not spawned on any runtime or run in the background; it
//! is driven in the foreground by whichever placeholder happens to be polled
//! after its window closes.
//!
//! Because a fetch only needs to be driven by a single task, a batch tracks
//! and notifies a single "driving" waker. The other placeholders are woken
//! only when the result is available, or when the driver is dropped and one
//! of them has to take over. Dropping every placeholder of a running fetch
//! drops the fetch.
//!
//! ### Caching and failure
//!
//! A successful flush moves its values into the loader's cache before any
//! placeholder sees its value, so a key re-requested while handling a result
//! is a cache hit. A failed flush hands one shared [`LoadError`] to every
//! placeholder waiting on it and caches nothing; loading those keys again
//! starts a new flush. Once the scope is closed, outstanding placeholders
//! resolve to [`LoadError::ScopeClosed`] and further loads panic.

mod config;
mod data;
mod error;
pub mod forum;
mod loader;
mod models;
mod scope;
mod source;
pub mod sources;
pub mod store;
mod wakerset;

pub use config::LoaderConfig;
pub use data::{KeySet, ValueSet};
pub use error::{LoadError, LoadResult, StoreError, StoreResult};
pub use forum::Response;
pub use loader::{Loader, Placeholder};
pub use models::{Comment, CommentId, Like, Thread, ThreadId, User, UserId, UserRef};
pub use scope::{FieldError, RequestScope};
pub use source::Source;
pub use store::{ForumStore, SqliteStore};
