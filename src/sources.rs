//! The batched sources behind each relationship of the forum read path.

use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Debug, Formatter},
    sync::Arc,
};

use async_trait::async_trait;

use crate::{
    data::{KeySet, ValueSet},
    error::StoreResult,
    models::{Comment, CommentId, Like, ThreadId, User, UserId},
    source::Source,
    store::ForumStore,
};

macro_rules! store_source {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            store: Arc<dyn ForumStore>,
        }

        impl $name {
            pub fn new(store: Arc<dyn ForumStore>) -> Self {
                Self { store }
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str(stringify!($name))
            }
        }
    };
}

store_source! {
    /// User by id. Unknown ids resolve to `None`.
    UserById
}

store_source! {
    /// The comments of a thread, oldest first. A thread with no comments
    /// resolves to an empty list.
    CommentsByThread
}

store_source! {
    /// The likes of a comment, each with the liking user.
    LikesByComment
}

store_source! {
    /// How many likes a comment has.
    LikeCountByComment
}

#[async_trait]
impl Source for UserById {
    type Key = UserId;
    type Value = Option<User>;
    const NAME: &'static str = "user_by_id";

    async fn fetch_batch(&self, keys: KeySet<UserId>) -> StoreResult<ValueSet<UserId, Option<User>>> {
        let users = self.store.users_by_ids(&keys.to_vec())?;
        Ok(keys.lookup_values(users.into_iter().map(|user| (user.id, user))))
    }
}

#[async_trait]
impl Source for CommentsByThread {
    type Key = ThreadId;
    type Value = Vec<Comment>;
    const NAME: &'static str = "comments_by_thread";

    async fn fetch_batch(&self, keys: KeySet<ThreadId>) -> StoreResult<ValueSet<ThreadId, Vec<Comment>>> {
        let comments = self.store.comments_by_thread_ids(&keys.to_vec())?;
        Ok(keys.group_values(comments.into_iter().map(|comment| (comment.thread_id, comment))))
    }
}

#[async_trait]
impl Source for LikesByComment {
    type Key = CommentId;
    type Value = Vec<Like>;
    const NAME: &'static str = "likes_by_comment";

    async fn fetch_batch(&self, keys: KeySet<CommentId>) -> StoreResult<ValueSet<CommentId, Vec<Like>>> {
        let likes = self.store.likes_by_comment_ids(&keys.to_vec())?;
        Ok(keys.group_values(likes.into_iter().map(|like| (like.comment_id, like))))
    }
}

#[async_trait]
impl Source for LikeCountByComment {
    type Key = CommentId;
    type Value = i64;
    const NAME: &'static str = "like_count_by_comment";

    async fn fetch_batch(&self, keys: KeySet<CommentId>) -> StoreResult<ValueSet<CommentId, i64>> {
        let counts: HashMap<CommentId, i64> = self.store.like_counts(&keys.to_vec())?.into_iter().collect();
        Ok(keys.into_values(|id| counts.get(id).copied().unwrap_or(0)))
    }
}

/// Whether the scope's user has liked a comment.
///
/// The user is fixed when the source is built, so cached answers can never
/// leak between users. An anonymous source answers `false` for every key
/// without touching storage.
#[derive(Clone)]
pub struct LikedByCurrentUser {
    store: Arc<dyn ForumStore>,
    current_user: Option<UserId>,
}

impl LikedByCurrentUser {
    pub fn new(store: Arc<dyn ForumStore>, current_user: Option<UserId>) -> Self {
        Self { store, current_user }
    }
}

impl Debug for LikedByCurrentUser {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LikedByCurrentUser")
            .field("current_user", &self.current_user)
            .finish()
    }
}

#[async_trait]
impl Source for LikedByCurrentUser {
    type Key = CommentId;
    type Value = bool;
    const NAME: &'static str = "liked_by_current_user";

    async fn fetch_batch(&self, keys: KeySet<CommentId>) -> StoreResult<ValueSet<CommentId, bool>> {
        let user = match self.current_user {
            Some(user) => user,
            None => return Ok(keys.into_values(|_| false)),
        };

        let liked: HashSet<CommentId> = self
            .store
            .liked_comment_ids(user, &keys.to_vec())?
            .into_iter()
            .collect();
        Ok(keys.into_values(|id| liked.contains(id)))
    }
}
