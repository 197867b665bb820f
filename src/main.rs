use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;
use futures::executor::block_on;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use forumloader::{forum, ForumStore, LoaderConfig, RequestScope, Response, SqliteStore, StoreResult};

/// Resolve the forum's threads, with every relationship loaded in batches,
/// and print the result as JSON.
#[derive(Debug, Parser)]
#[command(name = "forumloader", version)]
struct Cli {
    /// SQLite database to read. The default is a fresh in-memory database.
    #[arg(long, env = "FORUMLOADER_DATABASE", default_value = ":memory:")]
    database: String,

    /// Insert a few demo users, threads, comments and likes first.
    #[arg(long)]
    seed: bool,

    /// Resolve like status on behalf of this user id. Anonymous if omitted.
    #[arg(long, env = "FORUMLOADER_USER")]
    as_user: Option<i64>,

    /// Resolve only this thread.
    #[arg(long)]
    thread: Option<i64>,

    /// Timed accumulation window, in milliseconds. Without it, a batch
    /// flushes once a resolution pass adds no more keys to it.
    #[arg(long, env = "FORUMLOADER_WINDOW_MS")]
    window_ms: Option<u64>,

    /// Flush a batch as soon as it holds this many keys (at least 2).
    #[arg(long, env = "FORUMLOADER_MAX_BATCH_SIZE")]
    max_batch_size: Option<usize>,

    /// Deadline for each batched fetch, in milliseconds.
    #[arg(long, env = "FORUMLOADER_FLUSH_TIMEOUT_MS")]
    flush_timeout_ms: Option<u64>,
}

impl Cli {
    fn loader_config(&self) -> anyhow::Result<LoaderConfig> {
        let mut config = LoaderConfig::default();

        if let Some(ms) = self.window_ms {
            config = config.with_window(Duration::from_millis(ms));
        }
        if let Some(max) = self.max_batch_size {
            if max < 2 {
                bail!("--max-batch-size must be at least 2, got {}", max);
            }
            config = config.with_max_batch_size(max);
        }
        if let Some(ms) = self.flush_timeout_ms {
            config = config.with_flush_timeout(Duration::from_millis(ms));
        }

        Ok(config)
    }
}

// Seeded accounts have no usable password.
const LOCKED_PASSWORD: &str = "!";

fn seed(store: &dyn ForumStore) -> StoreResult<()> {
    let alice = store.create_user("alice", LOCKED_PASSWORD)?;
    let bob = store.create_user("bob", LOCKED_PASSWORD)?;
    let carol = store.create_user("carol", LOCKED_PASSWORD)?;

    let welcome = store.create_thread(alice.id, "Welcome", "Introduce yourself here.")?;
    let rust = store.create_thread(bob.id, "Batching in Rust", "How do you avoid N+1 queries?")?;
    store.create_thread(carol.id, "Quiet corner", "Nothing to see yet.")?;

    let hello = store.create_comment(bob.id, welcome.id, "Hi, I'm Bob.")?;
    let hi = store.create_comment(carol.id, welcome.id, "Carol here, hello!")?;
    let loaders = store.create_comment(alice.id, rust.id, "Use a dataloader.")?;

    store.toggle_like(alice.id, hello.id)?;
    store.toggle_like(carol.id, hello.id)?;
    store.toggle_like(bob.id, hi.id)?;
    store.toggle_like(bob.id, loaders.id)?;
    store.toggle_like(carol.id, loaders.id)?;

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .compact()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .with_env_var("FORUMLOADER_LOG")
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting tracing default failed")?;

    let config = cli.loader_config()?;

    let store = SqliteStore::open(&cli.database)
        .with_context(|| format!("failed to open database {:?}", cli.database))?;
    if cli.seed {
        seed(&store).context("failed to seed demo data")?;
    }
    let store: Arc<dyn ForumStore> = Arc::new(store);

    let scope = RequestScope::new(store, cli.as_user, &config);

    let output = match cli.thread {
        Some(id) => {
            let thread = block_on(forum::thread(&scope, id)).context("failed to resolve thread")?;
            serde_json::to_string_pretty(&Response::new(thread, scope))?
        }
        None => {
            let threads = block_on(forum::threads(&scope)).context("failed to resolve threads")?;
            serde_json::to_string_pretty(&Response::new(threads, scope))?
        }
    };

    println!("{}", output);
    Ok(())
}
