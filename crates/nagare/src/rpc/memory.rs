//! In-process database double.

use super::{
    Ack, DatabaseClient, DatabaseInfo, DocRef, Document, JobRef, ReplicationOptions,
    ReplicationState, ReplicationStatus, RpcError, RpcResult,
};
use async_trait::async_trait;
use nagare_core::PermanentKind;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

/// The operations a [`MemoryClient`] can fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// [`DatabaseClient::create_database`].
    CreateDatabase,
    /// [`DatabaseClient::delete_database`].
    DeleteDatabase,
    /// [`DatabaseClient::start_replication`].
    StartReplication,
    /// [`DatabaseClient::stop_replication`].
    StopReplication,
    /// [`DatabaseClient::replication_status`].
    ReplicationStatus,
    /// [`DatabaseClient::save_doc`].
    SaveDoc,
    /// [`DatabaseClient::get_doc`].
    GetDoc,
}

#[derive(Debug, Clone)]
struct StoredDoc {
    seq: u32,
    body: Value,
}

impl StoredDoc {
    fn rev(&self) -> String {
        format!("{}-memory", self.seq)
    }
}

#[derive(Debug)]
struct Job {
    seq: u32,
    source: String,
    target: String,
    continuous: bool,
    state: Option<ReplicationState>,
    status_queries: u32,
}

impl Job {
    fn rev(&self) -> String {
        format!("{}-memory", self.seq)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    databases: HashMap<String, BTreeMap<String, StoredDoc>>,
    jobs: HashMap<String, Job>,
    next_id: u64,
    trigger_after: u32,
    failures: HashMap<Operation, VecDeque<RpcError>>,
    calls: HashMap<Operation, u32>,
}

impl MemoryState {
    /// Counts the call and pops an injected failure, if any.
    fn enter(&mut self, op: Operation) -> RpcResult<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:04}", prefix, self.next_id)
    }

    fn database(&self, name: &str) -> RpcResult<&BTreeMap<String, StoredDoc>> {
        self.databases
            .get(name)
            .ok_or_else(|| RpcError::not_found(format!("Database {} does not exist.", name)))
    }

    /// Copies source documents into the targets of every triggered job.
    fn propagate(&mut self) {
        let pending: Vec<(String, String)> = self
            .jobs
            .values()
            .filter(|job| job.state.as_ref().is_some_and(ReplicationState::is_active))
            .map(|job| (job.source.clone(), job.target.clone()))
            .collect();

        for (source, target) in pending {
            let Some(docs) = self.databases.get(&source).cloned() else {
                continue;
            };
            if let Some(target_docs) = self.databases.get_mut(&target) {
                for (id, doc) in docs {
                    target_docs.insert(id, doc);
                }
            }
        }
    }
}

/// A [`DatabaseClient`] that keeps everything in memory.
///
/// Replication jobs start without a state and are triggered by the N-th
/// status query (N = 1 by default, see [`MemoryClient::trigger_after`]).
/// Triggering bumps the job's revision, so stopping it with the revision
/// returned by `start_replication` conflicts, as it does on a real server.
/// Triggered jobs copy source documents into their target whenever the
/// job's status or a document is read.
///
/// Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryClient {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    /// Creates an empty server.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                trigger_after: 1,
                ..MemoryState::default()
            })),
        }
    }

    /// Jobs become triggered on the `queries`-th status query.
    pub async fn trigger_after(&self, queries: u32) {
        self.state.lock().await.trigger_after = queries.max(1);
    }

    /// Makes the next call to `op` fail with `error`. Failures queue up.
    pub async fn fail_next(&self, op: Operation, error: RpcError) {
        self.state
            .lock()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Number of calls made to `op`, including failed ones.
    pub async fn calls(&self, op: Operation) -> u32 {
        self.state.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// Returns `true` if the database exists.
    pub async fn has_database(&self, name: &str) -> bool {
        self.state.lock().await.databases.contains_key(name)
    }

    /// Number of documents in a database.
    pub async fn doc_count(&self, name: &str) -> Option<usize> {
        self.state.lock().await.databases.get(name).map(BTreeMap::len)
    }

    /// Number of jobs that have not been stopped.
    pub async fn active_jobs(&self) -> usize {
        self.state.lock().await.jobs.len()
    }
}

fn is_valid_db_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || "_$()+-/".contains(c)
        })
}

#[async_trait]
impl DatabaseClient for MemoryClient {
    async fn create_database(&self, name: &str) -> RpcResult<DatabaseInfo> {
        let mut state = self.state.lock().await;
        state.enter(Operation::CreateDatabase)?;

        if !is_valid_db_name(name) {
            return Err(RpcError::permanent(
                PermanentKind::InvalidInput,
                format!("illegal_database_name: {}", name),
            ));
        }
        if state.databases.contains_key(name) {
            return Err(RpcError::conflict(format!(
                "file_exists: database {} already exists",
                name
            )));
        }
        state.databases.insert(name.to_string(), BTreeMap::new());
        Ok(DatabaseInfo {
            name: name.to_string(),
            ok: true,
        })
    }

    async fn delete_database(&self, name: &str) -> RpcResult<Ack> {
        let mut state = self.state.lock().await;
        state.enter(Operation::DeleteDatabase)?;

        match state.databases.remove(name) {
            Some(_) => Ok(Ack { ok: true }),
            None => Err(RpcError::not_found(format!(
                "Database {} does not exist.",
                name
            ))),
        }
    }

    async fn start_replication(
        &self,
        source: &str,
        target: &str,
        options: ReplicationOptions,
    ) -> RpcResult<JobRef> {
        let mut state = self.state.lock().await;
        state.enter(Operation::StartReplication)?;

        state.database(source)?;
        if !state.databases.contains_key(target) {
            if !options.create_target {
                return Err(RpcError::not_found(format!(
                    "Database {} does not exist.",
                    target
                )));
            }
            state.databases.insert(target.to_string(), BTreeMap::new());
        }

        let id = state.next_id("job");
        let job = Job {
            seq: 1,
            source: source.to_string(),
            target: target.to_string(),
            continuous: options.continuous,
            state: None,
            status_queries: 0,
        };
        let rev = job.rev();
        state.jobs.insert(id.clone(), job);
        Ok(JobRef { id, rev })
    }

    async fn stop_replication(&self, job: &JobRef) -> RpcResult<Ack> {
        let mut state = self.state.lock().await;
        state.enter(Operation::StopReplication)?;

        let current = state
            .jobs
            .get(&job.id)
            .ok_or_else(|| RpcError::not_found(format!("Replication {} not found", job.id)))?;
        if current.rev() != job.rev {
            return Err(RpcError::conflict(format!(
                "Document update conflict on {} (rev {} is stale)",
                job.id, job.rev
            )));
        }
        state.jobs.remove(&job.id);
        Ok(Ack { ok: true })
    }

    async fn replication_status(&self, job_id: &str) -> RpcResult<ReplicationStatus> {
        let mut state = self.state.lock().await;
        state.enter(Operation::ReplicationStatus)?;

        let trigger_after = state.trigger_after;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| RpcError::not_found(format!("Replication {} not found", job_id)))?;

        job.status_queries += 1;
        if job.state.is_none() && job.status_queries >= trigger_after {
            job.state = Some(if job.continuous {
                ReplicationState::Triggered
            } else {
                ReplicationState::Completed
            });
            job.seq += 1;
        }
        let status = ReplicationStatus {
            id: job_id.to_string(),
            rev: job.rev(),
            state: job.state.clone(),
            source: job.source.clone(),
            target: job.target.clone(),
        };

        state.propagate();
        Ok(status)
    }

    async fn save_doc(&self, db: &str, doc: &Value) -> RpcResult<DocRef> {
        let mut state = self.state.lock().await;
        state.enter(Operation::SaveDoc)?;

        if !doc.is_object() {
            return Err(RpcError::permanent(
                PermanentKind::InvalidInput,
                "bad_request: Document must be a JSON object",
            ));
        }
        state.database(db)?;

        let id = match doc.get("_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => state.next_id("doc"),
        };
        let given_rev = doc.get("_rev").and_then(Value::as_str).map(str::to_string);

        let docs = state
            .databases
            .get_mut(db)
            .ok_or_else(|| RpcError::not_found(format!("Database {} does not exist.", db)))?;
        let seq = match (docs.get(&id), given_rev) {
            (None, None) => 1,
            (Some(existing), Some(rev)) if existing.rev() == rev => existing.seq + 1,
            _ => {
                return Err(RpcError::conflict(format!(
                    "Document update conflict on {}",
                    id
                )))
            }
        };

        let mut body = doc.clone();
        if let Value::Object(map) = &mut body {
            map.insert("_id".to_string(), Value::String(id.clone()));
            map.remove("_rev");
        }
        let stored = StoredDoc { seq, body };
        let rev = stored.rev();
        docs.insert(id.clone(), stored);
        Ok(DocRef { id, rev })
    }

    async fn get_doc(&self, db: &str, id: &str) -> RpcResult<Document> {
        let mut state = self.state.lock().await;
        state.enter(Operation::GetDoc)?;
        state.propagate();

        let doc = state
            .database(db)?
            .get(id)
            .ok_or_else(|| RpcError::not_found(format!("Document {} is missing", id)))?;

        let rev = doc.rev();
        let mut body = doc.body.clone();
        if let Value::Object(map) = &mut body {
            map.insert("_rev".to_string(), Value::String(rev.clone()));
        }
        Ok(Document {
            id: id.to_string(),
            rev,
            body,
        })
    }
}
