//! Test doubles for the signer, the database driver, and the todo store.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::database::{
    ConnectError, Connector, NewTodo, QueryError, SqlParam, TodoRecord, TodoStore, TodoStoreError,
};
use crate::iam::{AuthToken, CredentialsError, SigningError, TokenSigner};

/// Hands out `token-1`, `token-2`, ... and counts calls.
pub struct MockSigner {
    calls: AtomicUsize,
    failures_remaining: AtomicUsize,
}

impl MockSigner {
    pub fn new() -> Arc<Self> {
        Self::failing_first(0)
    }

    /// Fail the first `n` calls, then succeed.
    pub fn failing_first(n: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(n),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSigner for MockSigner {
    async fn auth_token(&self) -> Result<AuthToken, SigningError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SigningError::Credentials(CredentialsError::NotFound));
        }
        Ok(AuthToken::new(format!("token-{}", call)))
    }
}

#[derive(Default)]
struct MockState {
    tokens: Mutex<Vec<String>>,
    statements: Mutex<Vec<String>>,
    query_delay: Mutex<Option<Duration>>,
    closed: AtomicUsize,
    pings: AtomicUsize,
    fail_connect: AtomicBool,
    fail_ping: AtomicBool,
    fail_close: AtomicBool,
}

/// In-memory driver. Connections are just the token they were opened with.
///
/// SQL starting with `FAIL CONNECTION` fails as a broken link; any other SQL
/// starting with `FAIL` fails as a statement error. Rows echo the SQL.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Passwords presented to `connect`, in order.
    pub fn tokens(&self) -> Vec<String> {
        self.state.tokens.lock().unwrap().clone()
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.statements.lock().unwrap().clone()
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn fail_connects(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_pings(&self, fail: bool) {
        self.state.fail_ping.store(fail, Ordering::SeqCst);
    }

    pub fn fail_closes(&self, fail: bool) {
        self.state.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn set_query_delay(&self, delay: Duration) {
        *self.state.query_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Connection = String;
    type Row = String;

    async fn connect(&self, password: AuthToken) -> Result<String, ConnectError> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(ConnectError::Handshake("connection refused".into()));
        }
        let token = password.expose().to_string();
        self.state.tokens.lock().unwrap().push(token.clone());
        Ok(token)
    }

    async fn query(
        &self,
        _conn: &mut String,
        sql: &str,
        _params: &[SqlParam],
    ) -> Result<Vec<String>, QueryError> {
        self.state.statements.lock().unwrap().push(sql.to_string());
        let delay = *self.state.query_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if sql.starts_with("FAIL CONNECTION") {
            Err(QueryError::Connection("server closed the connection".into()))
        } else if sql.starts_with("FAIL") {
            Err(QueryError::Statement("syntax error".into()))
        } else {
            Ok(vec![sql.to_string()])
        }
    }

    async fn ping(&self, _conn: &mut String) -> Result<(), QueryError> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_ping.load(Ordering::SeqCst) {
            return Err(QueryError::Connection("terminating connection".into()));
        }
        Ok(())
    }

    async fn close(&self, _conn: String) -> Result<(), QueryError> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(QueryError::Connection("close failed".into()));
        }
        Ok(())
    }
}

/// Todo store backed by a vector; `unavailable` makes every call fail.
#[derive(Default)]
pub struct MemoryTodoStore {
    todos: Mutex<Vec<TodoRecord>>,
    unavailable: AtomicBool,
}

impl MemoryTodoStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), TodoStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueryError::Connection("connection refused".into()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl TodoStore for MemoryTodoStore {
    async fn list(&self) -> Result<Vec<TodoRecord>, TodoStoreError> {
        self.check()?;
        let mut todos = self.todos.lock().unwrap().clone();
        todos.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(todos)
    }

    async fn create(&self, todo: NewTodo) -> Result<TodoRecord, TodoStoreError> {
        self.check()?;
        let mut todos = self.todos.lock().unwrap();
        let record = TodoRecord {
            id: todos.len() as i32 + 1,
            text: todo.text().to_string(),
            created_at: Utc::now(),
        };
        todos.push(record.clone());
        Ok(record)
    }
}
