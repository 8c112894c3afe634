//! Savepoint-based nested transactions with retry/timeout/audit log (§4.5).
//!
//! A single dedicated connection is checked out from the pool for the
//! lifetime of the outermost transaction, matching the single-writer
//! assumption of §5: metadata operations for one logical filesystem are
//! already serialized, so there is never contention for this connection.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use sqlx::pool::PoolConnection;
use sqlx::{Executor, Sqlite, SqliteConnection, SqlitePool};

use crate::clock::SharedClock;
use crate::config::TransactionConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct TransactionLogEntry {
    pub id: u64,
    pub status: TransactionStatus,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub operation_count: u32,
    pub rollback_reason: Option<String>,
    pub retry_count: u32,
}

struct ActiveTransaction {
    conn: PoolConnection<Sqlite>,
    savepoints: Vec<String>,
    log_id: u64,
    deadline_ms: Option<i64>,
    operation_count: u32,
    retry_count: u32,
}

pub struct TransactionOptions {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: Option<u64>,
    pub is_retryable: fn(&Error) -> bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self { max_retries: 0, retry_delay_ms: 0, timeout_ms: None, is_retryable: Error::is_retryable }
    }
}

pub struct TransactionManager {
    pool: SqlitePool,
    active: Mutex<Option<ActiveTransaction>>,
    log: Mutex<VecDeque<TransactionLogEntry>>,
    config: TransactionConfig,
    clock: SharedClock,
    next_id: AtomicU64,
}

impl TransactionManager {
    pub fn new(pool: SqlitePool, config: TransactionConfig, clock: SharedClock) -> Self {
        Self {
            pool,
            active: Mutex::new(None),
            log: Mutex::new(VecDeque::new()),
            config,
            clock,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn is_in_transaction(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn get_transaction_depth(&self) -> usize {
        self.active.lock().as_ref().map(|tx| tx.savepoints.len() + 1).unwrap_or(0)
    }

    /// Begins a top-level transaction, or a savepoint if already inside one.
    pub async fn begin_transaction(&self, timeout_ms: Option<u64>) -> Result<()> {
        let already_active = self.active.lock().is_some();
        if !already_active {
            let mut conn = self.pool.acquire().await?;
            conn.execute("BEGIN").await?;
            let timeout_ms = timeout_ms.or(Some(self.config.default_timeout_ms));
            let deadline_ms = timeout_ms.map(|ms| self.clock.now_ms() + ms as i64);
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.push_log(TransactionLogEntry {
                id,
                status: TransactionStatus::Active,
                start_time: self.clock.now_ms(),
                end_time: None,
                operation_count: 0,
                rollback_reason: None,
                retry_count: 0,
            });
            *self.active.lock() = Some(ActiveTransaction {
                conn,
                savepoints: Vec::new(),
                log_id: id,
                deadline_ms,
                operation_count: 0,
                retry_count: 0,
            });
            Ok(())
        } else {
            self.check_timeout().await?;
            let name = {
                let mut guard = self.active.lock();
                let tx = guard.as_mut().expect("checked above");
                let name = format!("sp_{}", tx.savepoints.len() + 1);
                tx.savepoints.push(name.clone());
                name
            };
            self.execute_on_active(&format!("SAVEPOINT {name}")).await
        }
    }

    pub async fn commit(&self) -> Result<()> {
        self.check_timeout().await?;
        let depth = self.get_transaction_depth();
        if depth == 0 {
            return Err(Error::invalid_argument("commit called outside a transaction"));
        }
        if depth >= 2 {
            let name = {
                let mut guard = self.active.lock();
                guard.as_mut().expect("depth >= 2").savepoints.pop().expect("savepoint present")
            };
            self.execute_on_active(&format!("RELEASE SAVEPOINT {name}")).await
        } else {
            let mut tx = self.active.lock().take().expect("depth == 1");
            tx.conn.execute("COMMIT").await?;
            self.finalize_log(tx.log_id, TransactionStatus::Committed, None, tx.retry_count);
            Ok(())
        }
    }

    pub async fn rollback(&self, reason: Option<String>) -> Result<()> {
        let depth = self.get_transaction_depth();
        if depth == 0 {
            return Err(Error::invalid_argument("rollback called outside a transaction"));
        }
        if depth >= 2 {
            let name = {
                let mut guard = self.active.lock();
                guard.as_mut().expect("depth >= 2").savepoints.pop().expect("savepoint present")
            };
            self.execute_on_active(&format!("ROLLBACK TO SAVEPOINT {name}")).await?;
            self.execute_on_active(&format!("RELEASE SAVEPOINT {name}")).await
        } else {
            let mut tx = self.active.lock().take().expect("depth == 1");
            let _ = tx.conn.execute("ROLLBACK").await;
            self.finalize_log(tx.log_id, TransactionStatus::RolledBack, reason, tx.retry_count);
            Ok(())
        }
    }

    /// Checks whether the active transaction has exceeded its deadline; if
    /// so, rolls back with `timed_out` and returns `Error::Timeout`. Called
    /// at the start of every operation that touches the active transaction,
    /// matching §5's "the awaiting caller observes the failure at its next
    /// suspension point".
    pub async fn check_timeout(&self) -> Result<()> {
        let expired = {
            let guard = self.active.lock();
            match guard.as_ref() {
                Some(tx) => match tx.deadline_ms {
                    Some(deadline) if self.clock.now_ms() >= deadline => {
                        Some((tx.log_id, tx.retry_count))
                    }
                    _ => None,
                },
                None => return Ok(()),
            }
        };
        if let Some((log_id, retry_count)) = expired {
            if let Some(tx) = self.active.lock().take() {
                let _ = tx.conn.execute("ROLLBACK").await;
            }
            self.finalize_log(log_id, TransactionStatus::TimedOut, Some("timeout".into()), retry_count);
            return Err(Error::Timeout { timeout_ms: self.config.default_timeout_ms });
        }
        Ok(())
    }

    fn set_current_retry_count(&self, retry_count: u32) {
        if let Some(tx) = self.active.lock().as_mut() {
            tx.retry_count = retry_count;
        }
    }

    async fn execute_on_active(&self, sql: &str) -> Result<()> {
        let mut guard = self.active.lock();
        let tx = guard.as_mut().ok_or_else(|| Error::invalid_argument("no active transaction"))?;
        tx.conn.execute(sql).await?;
        tx.operation_count += 1;
        Ok(())
    }

    /// Executes `f` against the transaction's dedicated connection when one
    /// is open, or a freshly checked-out connection otherwise. Every CRUD
    /// call in [`crate::metadata::MetadataStore`] routes through this so a
    /// multi-step mutation wrapped in [`Self::transaction`] commits or rolls
    /// back as one unit instead of each statement auto-committing on its own
    /// connection (§4.5, §5 "all write-buffer flushes happen under the
    /// enclosing SQL transaction").
    pub async fn exec<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, std::result::Result<T, sqlx::Error>>,
    {
        self.check_timeout().await?;
        let mut guard = self.active.lock();
        if let Some(tx) = guard.as_mut() {
            let conn: &mut SqliteConnection = &mut tx.conn;
            let result = f(conn).await;
            tx.operation_count += 1;
            drop(guard);
            Ok(result?)
        } else {
            drop(guard);
            let mut conn = self.pool.acquire().await?;
            let conn_ref: &mut SqliteConnection = &mut conn;
            Ok(f(conn_ref).await?)
        }
    }

    fn push_log(&self, entry: TransactionLogEntry) {
        let mut log = self.log.lock();
        log.push_back(entry);
        while log.len() > self.config.max_log_entries {
            log.pop_front();
        }
    }

    fn finalize_log(
        &self,
        id: u64,
        status: TransactionStatus,
        reason: Option<String>,
        retry_count: u32,
    ) {
        let mut log = self.log.lock();
        if let Some(entry) = log.iter_mut().find(|e| e.id == id) {
            entry.status = status;
            entry.end_time = Some(self.clock.now_ms());
            entry.rollback_reason = reason;
            entry.retry_count = retry_count;
        }
    }

    pub fn get_transaction_log(&self) -> Vec<TransactionLogEntry> {
        self.log.lock().iter().cloned().collect()
    }

    /// Marks any log entries still `active` (left over from a prior run
    /// that never reached a terminal status) as `rolled_back`.
    pub fn recover_transactions(&self) {
        let mut log = self.log.lock();
        for entry in log.iter_mut() {
            if entry.status == TransactionStatus::Active {
                entry.status = TransactionStatus::RolledBack;
                entry.rollback_reason = Some("recovered_on_startup".into());
                entry.end_time = Some(self.clock.now_ms());
            }
        }
    }

    /// Runs `f` inside a fresh top-level transaction, retrying on a
    /// retryable failure by re-beginning (not resuming) up to
    /// `opts.max_retries` times (§4.5, §8 S7).
    pub async fn transaction<F, Fut, T>(&self, opts: TransactionOptions, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            self.begin_transaction(opts.timeout_ms).await?;
            self.set_current_retry_count(attempt);
            match f().await {
                Ok(value) => {
                    self.commit().await?;
                    return Ok(value);
                }
                Err(err) => {
                    let _ = self.rollback(Some(err.to_string())).await;
                    if attempt < opts.max_retries && (opts.is_retryable)(&err) {
                        attempt += 1;
                        if opts.retry_delay_ms > 0 {
                            self.clock.sleep(std::time::Duration::from_millis(opts.retry_delay_ms)).await;
                        }
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}
