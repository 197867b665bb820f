//! The forum's read path, resolved through a [`RequestScope`].
//!
//! Every level of the thread → comments → likes tree is resolved with all of
//! its siblings in flight at once, so each level costs at most one flush per
//! source no matter how many threads or comments it spans. A field whose load
//! fails resolves to `None` and leaves a [`FieldError`] on the scope; its
//! siblings are unaffected.

use futures::future;
use serde::Serialize;
use tracing::instrument;

use crate::{
    error::StoreResult,
    models::{Comment, CommentId, Like, Thread, ThreadId, User, UserRef},
    scope::{FieldError, RequestScope},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadView {
    pub id: ThreadId,
    pub title: String,
    pub content: String,
    pub created_at: String,
    pub user: Option<User>,
    pub comments: Option<Vec<CommentView>>,
    pub comment_count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentView {
    pub id: CommentId,
    pub content: String,
    pub created_at: String,
    pub user: Option<User>,
    pub likes: Option<Vec<LikeView>>,
    pub likes_count: Option<i64>,
    pub is_liked_by_current_user: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeView {
    pub id: i64,
    pub created_at: String,
    pub user: UserRef,
}

impl From<Like> for LikeView {
    fn from(like: Like) -> Self {
        LikeView {
            id: like.id,
            created_at: like.created_at,
            user: like.user,
        }
    }
}

/// A resolved query: its data plus every field that failed along the way.
#[derive(Debug, Clone, Serialize)]
pub struct Response<T> {
    pub data: T,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,
}

impl<T> Response<T> {
    /// Close `scope` and pair its recorded errors with `data`.
    pub fn new(data: T, scope: RequestScope) -> Self {
        Response {
            data,
            errors: scope.finish(),
        }
    }
}

/// Every thread, newest first, fully resolved.
#[instrument(level = "debug", skip(scope))]
pub async fn threads(scope: &RequestScope) -> StoreResult<Vec<ThreadView>> {
    let threads = scope.store().threads()?;

    let views = threads
        .into_iter()
        .enumerate()
        .map(|(index, thread)| resolve_thread(scope, thread, format!("threads.{}", index)));

    Ok(future::join_all(views).await)
}

/// One thread, fully resolved, or `None` if it doesn't exist.
#[instrument(level = "debug", skip(scope))]
pub async fn thread(scope: &RequestScope, id: ThreadId) -> StoreResult<Option<ThreadView>> {
    match scope.store().thread(id)? {
        None => Ok(None),
        Some(thread) => Ok(Some(resolve_thread(scope, thread, "thread".to_owned()).await)),
    }
}

async fn resolve_thread(scope: &RequestScope, thread: Thread, path: String) -> ThreadView {
    let (user, comments) = future::join(
        scope.users().load(thread.user_id),
        scope.comments().load(thread.id),
    )
    .await;

    let user = scope.field(|| format!("{}.user", path), user).flatten();
    let comments = scope.field(|| format!("{}.comments", path), comments);
    let comment_count = comments.as_ref().map(Vec::len);

    let comments = match comments {
        None => None,
        Some(comments) => {
            let views = comments.into_iter().enumerate().map(|(index, comment)| {
                resolve_comment(scope, comment, format!("{}.comments.{}", path, index))
            });
            Some(future::join_all(views).await)
        }
    };

    ThreadView {
        id: thread.id,
        title: thread.title,
        content: thread.content,
        created_at: thread.created_at,
        user,
        comments,
        comment_count,
    }
}

async fn resolve_comment(scope: &RequestScope, comment: Comment, path: String) -> CommentView {
    let (user, likes, likes_count, liked) = future::join4(
        scope.users().load(comment.user_id),
        scope.likes().load(comment.id),
        scope.like_counts().load(comment.id),
        scope.liked().load(comment.id),
    )
    .await;

    CommentView {
        id: comment.id,
        content: comment.content,
        created_at: comment.created_at,
        user: scope.field(|| format!("{}.user", path), user).flatten(),
        likes: scope
            .field(|| format!("{}.likes", path), likes)
            .map(|likes| likes.into_iter().map(LikeView::from).collect()),
        likes_count: scope.field(|| format!("{}.likesCount", path), likes_count),
        is_liked_by_current_user: scope.field(|| format!("{}.isLikedByCurrentUser", path), liked),
    }
}
