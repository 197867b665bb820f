use std::{
    fmt::{self, Debug, Display, Formatter},
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::Serialize;
use tracing::debug;

use crate::{
    config::LoaderConfig,
    error::LoadResult,
    loader::Loader,
    models::UserId,
    sources::{CommentsByThread, LikeCountByComment, LikedByCurrentUser, LikesByComment, UserById},
    store::ForumStore,
};

/// A failed field of a response. The field itself resolves to `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

/// Everything one inbound query needs: the requesting user, and a fresh
/// loader (with its own cache) for every forum source.
///
/// Nothing is shared between scopes. Dropping the scope, or calling
/// [`finish`](RequestScope::finish), closes every loader: further loads
/// panic and outstanding placeholders resolve to
/// [`LoadError::ScopeClosed`](crate::LoadError::ScopeClosed).
pub struct RequestScope {
    current_user: Option<UserId>,
    store: Arc<dyn ForumStore>,

    users: Loader<UserById>,
    comments: Loader<CommentsByThread>,
    likes: Loader<LikesByComment>,
    like_counts: Loader<LikeCountByComment>,
    liked: Loader<LikedByCurrentUser>,

    errors: Mutex<Vec<FieldError>>,
}

impl RequestScope {
    pub fn new(store: Arc<dyn ForumStore>, current_user: Option<UserId>, config: &LoaderConfig) -> Self {
        debug!(?current_user, "opening request scope");

        Self {
            users: Loader::new(UserById::new(Arc::clone(&store)), config.clone()),
            comments: Loader::new(CommentsByThread::new(Arc::clone(&store)), config.clone()),
            likes: Loader::new(LikesByComment::new(Arc::clone(&store)), config.clone()),
            like_counts: Loader::new(LikeCountByComment::new(Arc::clone(&store)), config.clone()),
            liked: Loader::new(
                LikedByCurrentUser::new(Arc::clone(&store), current_user),
                config.clone(),
            ),
            current_user,
            store,
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn current_user(&self) -> Option<UserId> {
        self.current_user
    }

    /// The backing store, for root fields that aren't batched.
    pub fn store(&self) -> &dyn ForumStore {
        &*self.store
    }

    pub fn users(&self) -> &Loader<UserById> {
        &self.users
    }

    pub fn comments(&self) -> &Loader<CommentsByThread> {
        &self.comments
    }

    pub fn likes(&self) -> &Loader<LikesByComment> {
        &self.likes
    }

    pub fn like_counts(&self) -> &Loader<LikeCountByComment> {
        &self.like_counts
    }

    pub fn liked(&self) -> &Loader<LikedByCurrentUser> {
        &self.liked
    }

    fn error_list(&self) -> MutexGuard<'_, Vec<FieldError>> {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a failed field at `path`.
    pub fn record_error(&self, path: impl Into<String>, error: impl Display) {
        self.error_list().push(FieldError {
            path: path.into(),
            message: error.to_string(),
        });
    }

    /// Unwrap the result of a field, recording it at `path` and yielding
    /// `None` if it failed.
    pub fn field<T>(&self, path: impl FnOnce() -> String, result: LoadResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                self.record_error(path(), error);
                None
            }
        }
    }

    /// The field errors recorded so far.
    pub fn errors(&self) -> Vec<FieldError> {
        self.error_list().clone()
    }

    /// Tear the scope down, returning every recorded field error.
    pub fn finish(self) -> Vec<FieldError> {
        let errors = mem::take(&mut *self.error_list());
        errors
    }

    fn close(&self) {
        self.users.close();
        self.comments.close();
        self.likes.close();
        self.like_counts.close();
        self.liked.close();
    }
}

impl Debug for RequestScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestScope")
            .field("current_user", &self.current_user)
            .field("users", &self.users)
            .field("comments", &self.comments)
            .field("likes", &self.likes)
            .field("like_counts", &self.like_counts)
            .field("liked", &self.liked)
            .finish()
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        debug!(current_user = ?self.current_user, "closing request scope");
        self.close();
    }
}
