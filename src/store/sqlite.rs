use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
};

use rusqlite::{params as sql_params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::instrument;

use super::ForumStore;
use crate::{
    error::{StoreError, StoreResult},
    models::{Comment, CommentId, Like, Thread, ThreadId, User, UserId, UserRef},
};

/// A [`ForumStore`] backed by a single SQLite connection.
///
/// Every statement runs under one mutex, so concurrent flushes from different
/// loaders are serialized here. The store counts the read queries it executes,
/// which lets callers observe how well their loads were batched.
#[derive(Debug)]
pub struct SqliteStore {
    db: Mutex<Connection>,
    queries: AtomicUsize,
}

/// SQLite refuses statements with more than 32766 bound parameters, so
/// batched lookups bind at most this many keys per statement.
const MAX_BOUND_KEYS: usize = 32_000;

/// `?, ?, ?` with one placeholder per bound key.
fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn user_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        created_at: row.get(2)?,
    })
}

fn thread_row(row: &Row<'_>) -> rusqlite::Result<Thread> {
    Ok(Thread {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        user_id: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn comment_row(row: &Row<'_>) -> rusqlite::Result<Comment> {
    Ok(Comment {
        id: row.get(0)?,
        content: row.get(1)?,
        thread_id: row.get(2)?,
        user_id: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn like_row(row: &Row<'_>) -> rusqlite::Result<Like> {
    Ok(Like {
        id: row.get(0)?,
        comment_id: row.get(1)?,
        user: UserRef {
            id: row.get(2)?,
            username: row.get(3)?,
        },
        created_at: row.get(4)?,
    })
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and install the
    /// schema. `":memory:"` opens a private in-memory database.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> StoreResult<Self> {
        db.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            db: Mutex::new(db),
            queries: AtomicUsize::new(0),
        })
    }

    /// The number of read queries executed so far.
    pub fn queries_executed(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn db(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| StoreError::Unavailable {
            message: "connection lock poisoned".to_owned(),
        })
    }

    /// Take the connection for a read query, counting it.
    fn read(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        let db = self.db()?;
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(db)
    }

    /// Run `query` once for each slice of `ids` that fits in a statement,
    /// leaving `reserved` parameters for the query's own use, and concatenate
    /// the rows. Each statement counts as a query.
    fn read_chunked<K, T>(
        &self,
        ids: &[K],
        reserved: usize,
        mut query: impl FnMut(&Connection, &[K]) -> rusqlite::Result<Vec<T>>,
    ) -> StoreResult<Vec<T>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let db = self.db()?;
        let mut rows = Vec::new();
        for chunk in ids.chunks(MAX_BOUND_KEYS - reserved) {
            self.queries.fetch_add(1, Ordering::SeqCst);
            rows.extend(query(&db, chunk)?);
        }
        Ok(rows)
    }

    fn require_user(db: &Connection, id: UserId) -> StoreResult<()> {
        let found = db
            .prepare_cached("SELECT 1 FROM users WHERE id = ?;")?
            .query_row(sql_params![id], |_| Ok(()))
            .optional()?;

        found.ok_or(StoreError::NotFound { entity: "user", id })
    }
}

impl ForumStore for SqliteStore {
    #[instrument(level = "debug", skip(self, ids), fields(keys = ids.len()))]
    fn users_by_ids(&self, ids: &[UserId]) -> StoreResult<Vec<User>> {
        self.read_chunked(ids, 0, |db, ids| {
            let mut s = db.prepare(&format!(
                "SELECT id, username, created_at FROM users WHERE id IN ({});",
                placeholders(ids.len())
            ))?;
            let rows = s.query_map(params_from_iter(ids), user_row)?;
            let users: rusqlite::Result<Vec<User>> = rows.collect();
            users
        })
    }

    #[instrument(level = "debug", skip(self, ids), fields(keys = ids.len()))]
    fn comments_by_thread_ids(&self, ids: &[ThreadId]) -> StoreResult<Vec<Comment>> {
        // A thread's comments all come from the same chunk, so each thread
        // keeps its ordering.
        self.read_chunked(ids, 0, |db, ids| {
            let mut s = db.prepare(&format!(
                "SELECT id, content, thread_id, user_id, created_at FROM comments
                    WHERE thread_id IN ({})
                    ORDER BY created_at ASC, id ASC;",
                placeholders(ids.len())
            ))?;
            let rows = s.query_map(params_from_iter(ids), comment_row)?;
            let comments: rusqlite::Result<Vec<Comment>> = rows.collect();
            comments
        })
    }

    #[instrument(level = "debug", skip(self, ids), fields(keys = ids.len()))]
    fn likes_by_comment_ids(&self, ids: &[CommentId]) -> StoreResult<Vec<Like>> {
        self.read_chunked(ids, 0, |db, ids| {
            let mut s = db.prepare(&format!(
                "SELECT l.id, l.comment_id, u.id, u.username, l.created_at
                    FROM likes l JOIN users u ON l.user_id = u.id
                    WHERE l.comment_id IN ({})
                    ORDER BY l.created_at ASC, l.id ASC;",
                placeholders(ids.len())
            ))?;
            let rows = s.query_map(params_from_iter(ids), like_row)?;
            let likes: rusqlite::Result<Vec<Like>> = rows.collect();
            likes
        })
    }

    #[instrument(level = "debug", skip(self, ids), fields(keys = ids.len()))]
    fn like_counts(&self, ids: &[CommentId]) -> StoreResult<Vec<(CommentId, i64)>> {
        self.read_chunked(ids, 0, |db, ids| {
            let mut s = db.prepare(&format!(
                "SELECT comment_id, COUNT(*) FROM likes
                    WHERE comment_id IN ({})
                    GROUP BY comment_id;",
                placeholders(ids.len())
            ))?;
            let rows = s.query_map(params_from_iter(ids), |row| Ok((row.get(0)?, row.get(1)?)))?;
            let counts: rusqlite::Result<Vec<(CommentId, i64)>> = rows.collect();
            counts
        })
    }

    #[instrument(level = "debug", skip(self, ids), fields(keys = ids.len()))]
    fn liked_comment_ids(&self, user: UserId, ids: &[CommentId]) -> StoreResult<Vec<CommentId>> {
        // One parameter goes to the user.
        self.read_chunked(ids, 1, |db, ids| {
            let mut s = db.prepare(&format!(
                "SELECT comment_id FROM likes WHERE user_id = ? AND comment_id IN ({});",
                placeholders(ids.len())
            ))?;
            let params = std::iter::once(user).chain(ids.iter().copied());
            let rows = s.query_map(params_from_iter(params), |row| row.get(0))?;
            let liked: rusqlite::Result<Vec<CommentId>> = rows.collect();
            liked
        })
    }

    #[instrument(level = "debug", skip(self))]
    fn threads(&self) -> StoreResult<Vec<Thread>> {
        let db = self.read()?;
        let mut s = db.prepare_cached(
            "SELECT id, title, content, user_id, created_at FROM threads
                ORDER BY created_at DESC, id DESC;",
        )?;
        let rows = s.query_map(sql_params![], thread_row)?;
        let threads: rusqlite::Result<Vec<Thread>> = rows.collect();
        Ok(threads?)
    }

    #[instrument(level = "debug", skip(self))]
    fn thread(&self, id: ThreadId) -> StoreResult<Option<Thread>> {
        let db = self.read()?;
        let thread = db
            .prepare_cached("SELECT id, title, content, user_id, created_at FROM threads WHERE id = ?;")?
            .query_row(sql_params![id], thread_row)
            .optional()?;
        Ok(thread)
    }

    #[instrument(level = "debug", skip(self, password_hash))]
    fn create_user(&self, username: &str, password_hash: &str) -> StoreResult<User> {
        let db = self.db()?;
        let user = db
            .prepare_cached(
                "INSERT INTO users (username, password) VALUES (?, ?)
                    RETURNING id, username, created_at;",
            )?
            .query_row(sql_params![username, password_hash], user_row)?;
        Ok(user)
    }

    #[instrument(level = "debug", skip(self, content))]
    fn create_thread(&self, author: UserId, title: &str, content: &str) -> StoreResult<Thread> {
        let db = self.db()?;
        Self::require_user(&db, author)?;

        let thread = db
            .prepare_cached(
                "INSERT INTO threads (title, content, user_id) VALUES (?, ?, ?)
                    RETURNING id, title, content, user_id, created_at;",
            )?
            .query_row(sql_params![title, content, author], thread_row)?;
        Ok(thread)
    }

    #[instrument(level = "debug", skip(self, content))]
    fn create_comment(&self, author: UserId, thread: ThreadId, content: &str) -> StoreResult<Comment> {
        let db = self.db()?;
        Self::require_user(&db, author)?;

        let exists = db
            .prepare_cached("SELECT 1 FROM threads WHERE id = ?;")?
            .query_row(sql_params![thread], |_| Ok(()))
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound {
                entity: "thread",
                id: thread,
            });
        }

        let comment = db
            .prepare_cached(
                "INSERT INTO comments (content, thread_id, user_id) VALUES (?, ?, ?)
                    RETURNING id, content, thread_id, user_id, created_at;",
            )?
            .query_row(sql_params![content, thread, author], comment_row)?;
        Ok(comment)
    }

    #[instrument(level = "debug", skip(self))]
    fn toggle_like(&self, user: UserId, comment: CommentId) -> StoreResult<bool> {
        let db = self.db()?;

        let removed = db
            .prepare_cached("DELETE FROM likes WHERE comment_id = ? AND user_id = ?;")?
            .execute(sql_params![comment, user])?;
        if removed > 0 {
            return Ok(false);
        }

        Self::require_user(&db, user)?;
        let exists = db
            .prepare_cached("SELECT 1 FROM comments WHERE id = ?;")?
            .query_row(sql_params![comment], |_| Ok(()))
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound {
                entity: "comment",
                id: comment,
            });
        }

        db.prepare_cached("INSERT INTO likes (comment_id, user_id) VALUES (?, ?);")?
            .execute(sql_params![comment, user])?;
        Ok(true)
    }
}
