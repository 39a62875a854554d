// Prepared-statement cache
//
// Keyed by (keyspace, query text). The first caller for a key becomes the
// preparer; everyone else waits on the same outcome, so a hot query is
// prepared exactly once per keyspace no matter how many requests race.
// Prepared entries are also indexed by query id for the server's
// "unprepared" re-preparation flow.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tracing::{debug, trace};

use crate::cluster::Host;
use crate::error::{DriverError, Result};
use crate::frame::response::{ColumnSpec, PreparedResult};
use crate::policy::QueryPlan;

/// A fully prepared statement as consumed by the executor.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub id: Vec<u8>,
    pub query: String,
    pub keyspace: Option<String>,
    pub pk_indexes: Vec<u16>,
    pub parameters: Vec<ColumnSpec>,
    pub result_columns: Vec<ColumnSpec>,
}

/// The network half of preparation, implemented by the session: producing
/// query plans and running PREPARE on one host.
#[async_trait::async_trait]
pub trait PrepareBackend: Send + Sync {
    fn new_plan(&self, keyspace: Option<&str>) -> QueryPlan;

    async fn prepare_on(
        &self,
        host: &Arc<Host>,
        keyspace: Option<&str>,
        query: &str,
    ) -> Result<PreparedResult>;
}

type Waiter = oneshot::Sender<Result<Arc<PreparedStatement>>>;

enum Slot {
    Preparing(Vec<Waiter>),
    Ready(Arc<PreparedStatement>),
}

pub struct PreparedCache {
    entries: Mutex<HashMap<(String, String), Slot>>,
    by_id: DashMap<Vec<u8>, Arc<PreparedStatement>>,
    prepare_on_all_hosts: bool,
    /// Upper bound on how long a waiter may block on someone else's
    /// in-flight preparation.
    wait_timeout: Duration,
}

impl PreparedCache {
    pub fn new(prepare_on_all_hosts: bool) -> Arc<PreparedCache> {
        Arc::new(PreparedCache {
            entries: Mutex::new(HashMap::new()),
            by_id: DashMap::new(),
            prepare_on_all_hosts,
            wait_timeout: Duration::from_millis(30_000),
        })
    }

    fn key(keyspace: Option<&str>, query: &str) -> (String, String) {
        (keyspace.unwrap_or("").to_string(), query.to_string())
    }

    /// Resolve a query to its prepared form, preparing it first if needed.
    pub async fn get_or_prepare(
        self: &Arc<Self>,
        backend: &Arc<dyn PrepareBackend>,
        keyspace: Option<&str>,
        query: &str,
    ) -> Result<Arc<PreparedStatement>> {
        let key = Self::key(keyspace, query);

        enum Role {
            Owner,
            Waiter(oneshot::Receiver<Result<Arc<PreparedStatement>>>),
            Done(Arc<PreparedStatement>),
        }

        let role = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&key) {
                Some(Slot::Ready(statement)) => Role::Done(Arc::clone(statement)),
                Some(Slot::Preparing(waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Role::Waiter(rx)
                }
                None => {
                    entries.insert(key.clone(), Slot::Preparing(Vec::new()));
                    Role::Owner
                }
            }
        };

        match role {
            Role::Done(statement) => Ok(statement),
            Role::Waiter(rx) => match timeout(self.wait_timeout, rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_sender_dropped)) => Err(DriverError::Internal(
                    "prepare owner vanished without notifying waiters".to_string(),
                )),
                Err(_elapsed) => Err(DriverError::Internal(format!(
                    "timed out waiting for preparation of '{query}'"
                ))),
            },
            Role::Owner => {
                // If this future is dropped mid-prepare the guard clears
                // the Preparing entry and releases the waiters, so the slot
                // can never be stranded.
                let mut guard = OwnerGuard {
                    cache: self.as_ref(),
                    key: Some(key.clone()),
                };
                let outcome = self.run_prepare(backend, keyspace, query).await;
                guard.key = None;

                let waiters = {
                    let mut entries = self.entries.lock();
                    let waiters = match entries.remove(&key) {
                        Some(Slot::Preparing(waiters)) => waiters,
                        _ => Vec::new(),
                    };
                    if let Ok(statement) = &outcome {
                        entries.insert(key, Slot::Ready(Arc::clone(statement)));
                    }
                    waiters
                };
                for waiter in waiters {
                    let _ = waiter.send(outcome.clone());
                }
                outcome
            }
        }
    }

    /// Drive a fresh plan: socket errors and timeouts advance to the next
    /// host, any other response error (syntax in particular) is terminal.
    async fn run_prepare(
        self: &Arc<Self>,
        backend: &Arc<dyn PrepareBackend>,
        keyspace: Option<&str>,
        query: &str,
    ) -> Result<Arc<PreparedStatement>> {
        let mut plan = backend.new_plan(keyspace);
        let mut last_error: Option<DriverError> = None;

        while let Some(host) = plan.next() {
            if !host.is_up() {
                continue;
            }
            match backend.prepare_on(&host, keyspace, query).await {
                Ok(result) => {
                    let statement = Arc::new(PreparedStatement {
                        id: result.id.clone(),
                        query: query.to_string(),
                        keyspace: keyspace.map(str::to_string),
                        pk_indexes: result.pk_indexes,
                        parameters: result.parameters,
                        result_columns: result.result_columns,
                    });
                    self.by_id.insert(result.id, Arc::clone(&statement));
                    debug!(query, host = %host.address(), "statement prepared");

                    if self.prepare_on_all_hosts {
                        self.spawn_prepare_on_remaining(backend, plan, &statement);
                    }
                    return Ok(statement);
                }
                Err(error) if error.is_host_level() => {
                    trace!(host = %host.address(), %error, "prepare moved to next host");
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DriverError::NoHostAvailable(HashMap::new())
        }))
    }

    /// Best-effort preparation on the remaining hosts of the plan, after
    /// the primary prepare has already completed. Never blocks the caller;
    /// failures are only logged.
    fn spawn_prepare_on_remaining(
        self: &Arc<Self>,
        backend: &Arc<dyn PrepareBackend>,
        plan: QueryPlan,
        statement: &Arc<PreparedStatement>,
    ) {
        let backend = Arc::clone(backend);
        let statement = Arc::clone(statement);
        tokio::spawn(async move {
            for host in plan {
                if !host.is_up() {
                    continue;
                }
                if let Err(error) = backend
                    .prepare_on(&host, statement.keyspace.as_deref(), &statement.query)
                    .await
                {
                    debug!(
                        host = %host.address(),
                        query = statement.query,
                        %error,
                        "background prepare failed"
                    );
                }
            }
        });
    }

    /// Fast lookup for the server's "unprepared" response.
    pub fn statement_for_id(&self, id: &[u8]) -> Option<Arc<PreparedStatement>> {
        self.by_id.get(id).map(|entry| Arc::clone(&entry))
    }

    /// Re-prepare every cached statement on a host that just came up
    /// (best-effort, used when `re_prepare_on_up` is configured).
    pub fn re_prepare_all_on(self: &Arc<Self>, backend: Arc<dyn PrepareBackend>, host: Arc<Host>) {
        let statements: Vec<Arc<PreparedStatement>> = {
            let entries = self.entries.lock();
            entries
                .values()
                .filter_map(|slot| match slot {
                    Slot::Ready(statement) => Some(Arc::clone(statement)),
                    Slot::Preparing(_) => None,
                })
                .collect()
        };
        if statements.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for statement in statements {
                if let Err(error) = backend
                    .prepare_on(&host, statement.keyspace.as_deref(), &statement.query)
                    .await
                {
                    debug!(host = %host.address(), %error, "re-prepare on up host failed");
                }
            }
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Clears an abandoned Preparing slot when the owning future is dropped
/// before completion.
struct OwnerGuard<'a> {
    cache: &'a PreparedCache,
    key: Option<(String, String)>,
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else { return };
        let waiters = {
            let mut entries = self.cache.entries.lock();
            match entries.remove(&key) {
                Some(Slot::Preparing(waiters)) => waiters,
                other => {
                    // A Ready slot must not be dropped by a stale guard
                    if let Some(slot) = other {
                        entries.insert(key, slot);
                    }
                    Vec::new()
                }
            }
        };
        for waiter in waiters {
            let _ = waiter.send(Err(DriverError::Internal(
                "preparation was cancelled before completing".to_string(),
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResponseError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeBackend {
        hosts: Vec<Arc<Host>>,
        prepares: AtomicUsize,
        /// Endpoint -> error to return instead of success.
        failures: HashMap<std::net::SocketAddr, DriverError>,
        delay: Duration,
    }

    impl FakeBackend {
        fn new(hosts: Vec<Arc<Host>>) -> Arc<FakeBackend> {
            Arc::new(FakeBackend {
                hosts,
                prepares: AtomicUsize::new(0),
                failures: HashMap::new(),
                delay: Duration::from_millis(5),
            })
        }

        fn with_failures(
            hosts: Vec<Arc<Host>>,
            failures: HashMap<std::net::SocketAddr, DriverError>,
        ) -> Arc<FakeBackend> {
            Arc::new(FakeBackend {
                hosts,
                prepares: AtomicUsize::new(0),
                failures,
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait::async_trait]
    impl PrepareBackend for FakeBackend {
        fn new_plan(&self, _keyspace: Option<&str>) -> QueryPlan {
            Box::new(self.hosts.clone().into_iter())
        }

        async fn prepare_on(
            &self,
            host: &Arc<Host>,
            _keyspace: Option<&str>,
            query: &str,
        ) -> Result<PreparedResult> {
            tokio::time::sleep(self.delay).await;
            self.prepares.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.failures.get(&host.address()) {
                return Err(error.clone());
            }
            Ok(PreparedResult {
                id: crate::testing::prepared_id(query),
                pk_indexes: vec![0],
                parameters: Vec::new(),
                result_columns: Vec::new(),
            })
        }
    }

    fn hosts(n: usize) -> Vec<Arc<Host>> {
        (0..n)
            .map(|i| Host::for_tests(&format!("127.0.0.{}:9042", i + 1), &[]))
            .collect()
    }

    #[tokio::test]
    async fn test_concurrent_callers_prepare_once() {
        let cache = PreparedCache::new(false);
        let backend: Arc<dyn PrepareBackend> = FakeBackend::new(hosts(3));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let cache = Arc::clone(&cache);
            let backend = Arc::clone(&backend);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_prepare(&backend, Some("ks1"), "SELECT * FROM t WHERE id = ?")
                    .await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().id.clone());
        }
        // All callers observed the same id, from exactly one PREPARE
        assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_single_prepare_on_wire() {
        let cache = PreparedCache::new(false);
        let fake = FakeBackend::new(hosts(2));
        let backend: Arc<dyn PrepareBackend> = Arc::clone(&fake) as Arc<dyn PrepareBackend>;

        let mut handles = Vec::new();
        for _ in 0..100 {
            let cache = Arc::clone(&cache);
            let backend = Arc::clone(&backend);
            handles.push(tokio::spawn(async move {
                cache.get_or_prepare(&backend, Some("ks1"), "SELECT 1").await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(fake.prepares.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keyspaces_prepare_separately() {
        let cache = PreparedCache::new(false);
        let fake = FakeBackend::new(hosts(1));
        let backend: Arc<dyn PrepareBackend> = Arc::clone(&fake) as Arc<dyn PrepareBackend>;

        cache
            .get_or_prepare(&backend, Some("ks1"), "SELECT 1")
            .await
            .unwrap();
        cache
            .get_or_prepare(&backend, Some("ks2"), "SELECT 1")
            .await
            .unwrap();
        cache
            .get_or_prepare(&backend, None, "SELECT 1")
            .await
            .unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(fake.prepares.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_socket_errors_move_to_next_host() {
        let all = hosts(3);
        let mut failures = HashMap::new();
        failures.insert(
            all[0].address(),
            DriverError::IoMessage("connection refused".into()),
        );
        failures.insert(
            all[1].address(),
            DriverError::OperationTimedOut {
                endpoint: all[1].address(),
                elapsed_ms: 100,
            },
        );
        let cache = PreparedCache::new(false);
        let backend: Arc<dyn PrepareBackend> =
            FakeBackend::with_failures(all, failures) as Arc<dyn PrepareBackend>;

        let statement = cache
            .get_or_prepare(&backend, None, "SELECT 1")
            .await
            .unwrap();
        assert!(!statement.id.is_empty());
    }

    #[tokio::test]
    async fn test_syntax_errors_are_terminal_and_clear_entry() {
        let all = hosts(3);
        let mut failures = HashMap::new();
        for host in &all {
            failures.insert(
                host.address(),
                DriverError::Response(ResponseError::new(0x2000, "syntax error")),
            );
        }
        let fake = FakeBackend::with_failures(all, failures);
        let backend: Arc<dyn PrepareBackend> = Arc::clone(&fake) as Arc<dyn PrepareBackend>;
        let cache = PreparedCache::new(false);

        let result = cache.get_or_prepare(&backend, None, "SELEC bogus").await;
        assert!(matches!(result, Err(DriverError::Response(_))));
        // Syntax errors stop at the first host
        assert_eq!(fake.prepares.load(Ordering::SeqCst), 1);
        // The failed entry is gone, a later call may try again
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_prepare_on_all_hosts_is_background() {
        let all = hosts(3);
        let cache = PreparedCache::new(true);
        let fake = FakeBackend::new(all);
        let backend: Arc<dyn PrepareBackend> = Arc::clone(&fake) as Arc<dyn PrepareBackend>;

        cache
            .get_or_prepare(&backend, None, "SELECT 1")
            .await
            .unwrap();
        // The primary prepare has happened; the remaining two hosts get
        // prepared in the background shortly after
        for _ in 0..100 {
            if fake.prepares.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fake.prepares.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_lookup_by_id() {
        let cache = PreparedCache::new(false);
        let backend: Arc<dyn PrepareBackend> = FakeBackend::new(hosts(1));
        let statement = cache
            .get_or_prepare(&backend, None, "SELECT 1")
            .await
            .unwrap();
        let found = cache.statement_for_id(&statement.id).unwrap();
        assert_eq!(found.query, "SELECT 1");
        assert!(cache.statement_for_id(b"missing").is_none());
    }
}
