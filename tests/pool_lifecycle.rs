//! End-to-end exercises of the borrow/restore/critical-drain/reducer
//! lifecycle against an in-memory mock connector, grounded on the
//! concrete scenarios worked through while designing the pool (warm
//! reuse, timeout dump, critical SQLSTATE drain, idle validation,
//! statement cache LRU, reducer trims).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vibur::{ConnectMeta, Connector, DataSource, Error, PoolConfig, PoolError, RawConnection, RawResultSet};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A raw connection standing in for a real driver: it knows its own id,
/// counts how many statements it has prepared, and can be told to fail a
/// specific SQL with a given SQLSTATE.
struct MockConnection {
    id: u64,
    log: Arc<Mutex<Vec<u64>>>,
    prepare_count: Arc<AtomicU64>,
    is_valid_count: Arc<AtomicU64>,
    fail_sql: Option<(&'static str, &'static str)>,
}

#[derive(Debug)]
struct MockDbError {
    state: &'static str,
}

impl std::fmt::Display for MockDbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mock database error {}", self.state)
    }
}
impl std::error::Error for MockDbError {}
impl vibur::DatabaseError for MockDbError {
    fn message(&self) -> &str {
        "mock database error"
    }
    fn sql_state(&self) -> Option<&str> {
        Some(self.state)
    }
}

struct MockResultSet;

impl RawResultSet for MockResultSet {
    fn next(&mut self) -> BoxFuture<'_, Result<bool, Error>> {
        Box::pin(async { Ok(false) })
    }
    fn close(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }
}

impl RawConnection for MockConnection {
    type Statement = String;
    type ResultSet = MockResultSet;

    fn prepare<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, Result<String, Error>> {
        self.prepare_count.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(sql.to_string()) })
    }

    fn execute<'a>(
        &'a mut self,
        stmt: &'a mut String,
        _params: &'a [String],
    ) -> BoxFuture<'a, Result<MockResultSet, Error>> {
        self.log.lock().unwrap().push(self.id);
        if let Some((sql, state)) = self.fail_sql {
            if stmt == sql {
                return Box::pin(async move { Err(Error::Database(Box::new(MockDbError { state }))) });
            }
        }
        Box::pin(async { Ok(MockResultSet) })
    }

    fn close_statement<'a>(&'a mut self, _stmt: String) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }

    fn is_valid(&mut self, _timeout: Duration) -> BoxFuture<'_, Result<bool, Error>> {
        self.is_valid_count.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(true) })
    }

    fn execute_sql<'a>(&'a mut self, _sql: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }

    fn set_auto_commit(&mut self, _auto_commit: bool) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }

    fn set_read_only(&mut self, _read_only: bool) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }

    fn set_transaction_isolation(&mut self, _level: vibur::IsolationLevel) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }

    fn set_catalog<'a>(&'a mut self, _catalog: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }

    fn clear_warnings(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }
}

/// Shared state behind every mock connector in this file: a monotonic id
/// source plus a log of which connection id actually ran a query.
#[derive(Clone, Default)]
struct MockState {
    next_id: Arc<AtomicU64>,
    executed_by: Arc<Mutex<Vec<u64>>>,
    created_ids: Arc<Mutex<Vec<u64>>>,
    prepare_count: Arc<AtomicU64>,
    is_valid_count: Arc<AtomicU64>,
}

impl MockState {
    fn connector(&self, fail_sql: Option<(&'static str, &'static str)>) -> impl Connector<Connection = MockConnection> {
        let state = self.clone();
        move |_meta: ConnectMeta| {
            let state = state.clone();
            async move {
                let id = state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                state.created_ids.lock().unwrap().push(id);
                Ok(MockConnection {
                    id,
                    log: state.executed_by.clone(),
                    prepare_count: state.prepare_count.clone(),
                    is_valid_count: state.is_valid_count.clone(),
                    fail_sql,
                })
            }
        }
    }
}

#[tokio::test]
async fn warm_reuse_hands_back_the_same_connection() {
    let state = MockState::default();
    let ds = DataSource::new(
        state.connector(None),
        PoolConfig::builder()
            .pool_initial_size(0)
            .pool_max_size(2)
            .reducer_time_interval_secs(60)
            .build()
            .unwrap(),
    );
    ds.start().await.unwrap();

    let mut conn = ds.get_connection(None).await.unwrap();
    let mut stmt = conn.prepare_statement("select 1").await.unwrap();
    conn.execute(&mut stmt, &[]).await.unwrap();
    conn.close_statement(stmt).await.unwrap();
    conn.close().await.unwrap();

    let mut conn2 = ds.get_connection(None).await.unwrap();
    let mut stmt2 = conn2.prepare_statement("select 1").await.unwrap();
    conn2.execute(&mut stmt2, &[]).await.unwrap();
    conn2.close_statement(stmt2).await.unwrap();
    conn2.close().await.unwrap();

    assert_eq!(state.created_ids.lock().unwrap().len(), 1, "only one connection should ever be created");
    let log = state.executed_by.lock().unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0], log[1], "the second borrow should reuse the first connection");
}

#[tokio::test]
async fn timeout_reports_vi002_when_pool_is_exhausted() {
    let state = MockState::default();
    let ds = DataSource::new(
        state.connector(None),
        PoolConfig::builder()
            .pool_initial_size(0)
            .pool_max_size(1)
            .connection_timeout_ms(50)
            .reducer_time_interval_secs(60)
            .build()
            .unwrap(),
    );
    ds.start().await.unwrap();

    let _holder = ds.get_connection(None).await.unwrap();
    let start = std::time::Instant::now();
    let err = ds.get_connection(None).await.unwrap_err();
    assert!(start.elapsed() >= Duration::from_millis(45));
    assert!(matches!(err, Error::Pool(PoolError::Timeout(_))));
}

#[tokio::test]
async fn critical_sqlstate_drains_the_stale_generation() {
    let state = MockState::default();
    let ds = DataSource::new(
        state.connector(Some(("bad query", "57P01"))),
        PoolConfig::builder()
            .pool_initial_size(0)
            .pool_max_size(3)
            .reducer_time_interval_secs(60)
            .build()
            .unwrap(),
    );
    ds.start().await.unwrap();

    let mut a = ds.get_connection(None).await.unwrap();
    let mut b = ds.get_connection(None).await.unwrap();
    let mut c = ds.get_connection(None).await.unwrap();
    assert_eq!(ds.total_len(), 3);

    // b and c finish healthy and go idle under the current generation.
    let mut stmt_b = b.prepare_statement("select 1").await.unwrap();
    b.execute(&mut stmt_b, &[]).await.unwrap();
    b.close_statement(stmt_b).await.unwrap();
    b.close().await.unwrap();

    let mut stmt_c = c.prepare_statement("select 1").await.unwrap();
    c.execute(&mut stmt_c, &[]).await.unwrap();
    c.close_statement(stmt_c).await.unwrap();
    c.close().await.unwrap();
    assert_eq!(ds.idle_len(), 2);

    // a's query raises the critical SQLSTATE.
    let mut stmt_a = a.prepare_statement("bad query").await.unwrap();
    let err = a.execute(&mut stmt_a, &[]).await.unwrap_err();
    assert!(matches!(err, Error::Database(_)));
    drop(stmt_a);
    a.close().await.unwrap();

    // The whole stale generation (b and c, both idle under the old version)
    // is drained, even though neither of them ever saw the error directly.
    assert_eq!(ds.idle_len(), 0, "critical failure should drain the other idle connections too");
    assert_eq!(ds.total_len(), 0);

    // The next borrow creates a brand-new connection under the bumped generation.
    let created_before = state.created_ids.lock().unwrap().len();
    let d = ds.get_connection(None).await.unwrap();
    assert_eq!(state.created_ids.lock().unwrap().len(), created_before + 1);
    d.close().await.unwrap();
}

#[tokio::test]
async fn idle_connection_is_validated_after_the_idle_limit_elapses() {
    let state = MockState::default();
    let ds = DataSource::new(
        state.connector(None),
        PoolConfig::builder()
            .pool_initial_size(0)
            .pool_max_size(1)
            .connection_idle_limit_secs(0)
            .test_connection_query(vibur::config::IS_VALID)
            .reducer_time_interval_secs(60)
            .build()
            .unwrap(),
    );
    ds.start().await.unwrap();

    let conn = ds.get_connection(None).await.unwrap();
    conn.close().await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;

    let conn2 = ds.get_connection(None).await.unwrap();
    conn2.close().await.unwrap();

    // connectionIdleLimitInSeconds = 0 validates on every take; exactly the
    // one idle connection was checked exactly once between the two borrows.
    assert_eq!(state.is_valid_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn statement_cache_evicts_lru_entry_past_its_cap() {
    let state = MockState::default();
    let ds = DataSource::new(
        state.connector(None),
        PoolConfig::builder()
            .pool_initial_size(0)
            .pool_max_size(1)
            .statement_cache_max_size(2)
            .reducer_time_interval_secs(60)
            .build()
            .unwrap(),
    );
    ds.start().await.unwrap();

    let mut conn = ds.get_connection(None).await.unwrap();

    for sql in ["select 1", "select 2", "select 3"] {
        let mut stmt = conn.prepare_statement(sql).await.unwrap();
        conn.execute(&mut stmt, &[]).await.unwrap();
        conn.close_statement(stmt).await.unwrap();
    }
    assert_eq!(
        state.prepare_count.load(Ordering::SeqCst),
        3,
        "each distinct SQL should be a cache miss the first time"
    );

    // Re-running "select 3" and "select 2" should hit the cache (no new
    // prepare calls); "select 1" was evicted to make room for "select 3".
    let mut stmt3 = conn.prepare_statement("select 3").await.unwrap();
    conn.execute(&mut stmt3, &[]).await.unwrap();
    conn.close_statement(stmt3).await.unwrap();
    assert_eq!(state.prepare_count.load(Ordering::SeqCst), 3, "select 3 should be cached");

    let mut stmt1 = conn.prepare_statement("select 1").await.unwrap();
    conn.execute(&mut stmt1, &[]).await.unwrap();
    conn.close_statement(stmt1).await.unwrap();
    assert_eq!(state.prepare_count.load(Ordering::SeqCst), 4, "select 1 should have been evicted");

    conn.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reducer_trims_idle_surplus_back_toward_initial_size() {
    let state = MockState::default();
    let ds = DataSource::new(
        state.connector(None),
        PoolConfig::builder()
            .pool_initial_size(2)
            .pool_max_size(10)
            .connection_idle_limit_secs(0)
            .reducer_time_interval_secs(1)
            .reducer_samples(2)
            .build()
            .unwrap(),
    );
    ds.start().await.unwrap();
    assert_eq!(ds.total_len(), 2);

    // Drive a peak of 7 concurrently taken connections, then let them all
    // go idle again.
    let mut conns = Vec::new();
    for _ in 0..7 {
        conns.push(ds.get_connection(None).await.unwrap());
    }
    assert_eq!(ds.total_len(), 7);
    for conn in conns {
        conn.close().await.unwrap();
    }
    assert_eq!(ds.idle_len(), 7);

    tokio::time::advance(Duration::from_secs(3)).await;
    tokio::task::yield_now().await;

    assert_eq!(ds.total_len(), 2, "reducer should converge created connections back to poolInitialSize");
    assert_eq!(ds.idle_len(), 2);
}

#[tokio::test]
async fn terminate_is_idempotent_and_closed_connections_report_vi001() {
    let state = MockState::default();
    let ds = DataSource::new(
        state.connector(None),
        PoolConfig::builder()
            .pool_initial_size(1)
            .pool_max_size(2)
            .reducer_time_interval_secs(60)
            .build()
            .unwrap(),
    );
    ds.start().await.unwrap();
    ds.terminate().await;
    ds.terminate().await;

    let err = ds.get_connection(None).await.unwrap_err();
    assert!(matches!(err, Error::Pool(PoolError::Closed)));
}

#[tokio::test]
async fn terminate_after_allow_connection_after_termination_serves_a_raw_connection() {
    let state = MockState::default();
    let ds = DataSource::new(
        state.connector(None),
        PoolConfig::builder()
            .pool_initial_size(1)
            .pool_max_size(2)
            .allow_connection_after_termination(true)
            .reducer_time_interval_secs(60)
            .build()
            .unwrap(),
    );
    ds.start().await.unwrap();
    ds.terminate().await;

    let created_before = state.created_ids.lock().unwrap().len();
    let conn = ds.get_connection(None).await.unwrap();
    assert_eq!(
        state.created_ids.lock().unwrap().len(),
        created_before + 1,
        "a post-termination connection is built fresh, not drawn from the (now drained) idle queue"
    );
    conn.close().await.unwrap();
    assert_eq!(ds.idle_len(), 0, "a post-termination connection is never pooled back");
}

#[tokio::test]
async fn credentialed_connection_is_never_handed_to_a_default_caller() {
    let state = MockState::default();
    let ds = DataSource::new(
        state.connector(None),
        PoolConfig::builder()
            .pool_initial_size(0)
            .pool_max_size(2)
            .reducer_time_interval_secs(60)
            .build()
            .unwrap(),
    );
    ds.start().await.unwrap();

    let conn = ds
        .get_connection_with_credentials(None, "alice", "secret")
        .await
        .unwrap();
    conn.close().await.unwrap();
    assert_eq!(
        ds.idle_len(),
        0,
        "a credentialed connection must not be pooled back to the shared idle queue"
    );

    let created_before = state.created_ids.lock().unwrap().len();
    let default_conn = ds.get_connection(None).await.unwrap();
    assert_eq!(
        state.created_ids.lock().unwrap().len(),
        created_before + 1,
        "a default-credential caller must get its own connection, never the credentialed one"
    );
    default_conn.close().await.unwrap();
}

#[tokio::test]
async fn sever_connection_forces_invalidation_on_next_touch() {
    let state = MockState::default();
    let ds = DataSource::new(
        state.connector(None),
        PoolConfig::builder()
            .pool_initial_size(0)
            .pool_max_size(2)
            .pool_enable_connection_tracking(true)
            .reducer_time_interval_secs(60)
            .build()
            .unwrap(),
    );
    ds.start().await.unwrap();

    let mut conn = ds.get_connection(None).await.unwrap();
    let taken = ds.taken_connections();
    assert_eq!(taken.len(), 1);
    let id = taken[0].connection_id;

    ds.sever_connection(id);
    // The sever mark takes effect on the very next intercepted call, which
    // then finds the holder already gone and reports it as closed.
    let err = conn.prepare_statement("select 1").await.unwrap_err();
    assert!(matches!(err, Error::Pool(PoolError::Closed4Use)));

    // Give the spawned restore a chance to run.
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    assert_eq!(ds.idle_len(), 0, "a severed connection must never return to the idle pool");
    assert!(ds.taken_connections().is_empty(), "a severed connection must drop out of the taken registry");
}
