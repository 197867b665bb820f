//! Rows of the forum schema.

use serde::Serialize;

pub type UserId = i64;
pub type ThreadId = i64;
pub type CommentId = i64;

/// A forum member. The password hash never leaves the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub created_at: String,
}

/// The identity of a user as joined onto another row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRef {
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Thread {
    pub id: ThreadId,
    pub title: String,
    pub content: String,
    pub user_id: UserId,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Comment {
    pub id: CommentId,
    pub content: String,
    pub thread_id: ThreadId,
    pub user_id: UserId,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Like {
    pub id: i64,
    pub comment_id: CommentId,
    pub user: UserRef,
    pub created_at: String,
}
