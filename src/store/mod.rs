//! Storage backends for the forum schema.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::{
    error::StoreResult,
    models::{Comment, CommentId, Like, Thread, ThreadId, User, UserId},
};

/// Abstract storage interface for forum data.
///
/// The batched reads take a slice of distinct keys and return every matching
/// row, each row carrying the key it belongs to; pairing rows with keys is the
/// caller's job. Implementations must be thread-safe.
pub trait ForumStore: Send + Sync + 'static {
    // Batched reads

    /// Users whose id is in `ids`. Unknown ids are simply absent.
    fn users_by_ids(&self, ids: &[UserId]) -> StoreResult<Vec<User>>;

    /// Comments of the given threads, oldest first (ties broken by id).
    fn comments_by_thread_ids(&self, ids: &[ThreadId]) -> StoreResult<Vec<Comment>>;

    /// Likes of the given comments, with the liking user joined in.
    fn likes_by_comment_ids(&self, ids: &[CommentId]) -> StoreResult<Vec<Like>>;

    /// `(comment id, like count)` for every given comment with at least one
    /// like.
    fn like_counts(&self, ids: &[CommentId]) -> StoreResult<Vec<(CommentId, i64)>>;

    /// The subset of `ids` liked by `user`.
    fn liked_comment_ids(&self, user: UserId, ids: &[CommentId]) -> StoreResult<Vec<CommentId>>;

    // Root reads

    /// All threads, newest first.
    fn threads(&self) -> StoreResult<Vec<Thread>>;

    fn thread(&self, id: ThreadId) -> StoreResult<Option<Thread>>;

    // Writes

    fn create_user(&self, username: &str, password_hash: &str) -> StoreResult<User>;

    fn create_thread(&self, author: UserId, title: &str, content: &str) -> StoreResult<Thread>;

    fn create_comment(&self, author: UserId, thread: ThreadId, content: &str) -> StoreResult<Comment>;

    /// Like or unlike `comment` on behalf of `user`. Returns whether the
    /// comment is liked afterwards.
    fn toggle_like(&self, user: UserId, comment: CommentId) -> StoreResult<bool>;
}
