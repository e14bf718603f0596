//! In-memory reference backend.
//!
//! Backs the test suite and any process that wants a repository without
//! touching disk. Revisions are parent lists plus an opaque payload;
//! write groups buffer records until commit; locks follow the token
//! protocol in [`crate::lock`].

use crate::graph::Graph;
use crate::lock::TokenLock;
use crate::revision::RevisionId;
use crate::search::SearchResult;
use crate::traits::{Backend, Branch, InsertOutcome, NetworkRecord, Repository, Transport};
use crate::{Result, StoreError};
use bytes::{BufMut, Bytes, BytesMut};
use keel_pack::StreamRecord;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

const MEMORY_ROOT: &str = "memory:///";

/// The substream kind carrying revision records.
pub const REVISIONS_KIND: &[u8] = b"revisions";

/// A revision stored in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRevision {
    /// Parent revision ids, normalized (no null sentinel).
    pub parents: Vec<RevisionId>,
    /// Opaque revision payload.
    pub payload: Bytes,
}

/// Serializes a revision as a stream record body: one line of
/// space-joined parent ids, then the payload.
pub fn format_revision_record(parents: &[RevisionId], payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    for (i, parent) in parents.iter().enumerate() {
        if i > 0 {
            buf.put_u8(b' ');
        }
        buf.put_slice(parent.as_bytes());
    }
    buf.put_u8(b'\n');
    buf.put_slice(payload);
    buf.freeze()
}

/// Parses a revision record body back into parents and payload.
pub fn parse_revision_record(body: &[u8]) -> Result<(Vec<RevisionId>, Bytes)> {
    let newline = body
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| StoreError::InvalidRecord("revision record has no parent line".into()))?;
    let parents = body[..newline]
        .split(|&b| b == b' ')
        .filter(|part| !part.is_empty())
        .map(RevisionId::from)
        .filter(|id| !id.is_null())
        .collect();
    Ok((parents, Bytes::copy_from_slice(&body[newline + 1..])))
}

#[derive(Debug, Default)]
struct RepoState {
    revisions: BTreeMap<RevisionId, StoredRevision>,
    active: Option<Vec<NetworkRecord>>,
    suspended: BTreeMap<String, Vec<NetworkRecord>>,
}

/// An in-memory repository.
pub struct MemoryRepository {
    path: String,
    readonly: Arc<AtomicBool>,
    lock: TokenLock,
    state: Mutex<RepoState>,
}

impl MemoryRepository {
    fn new(path: &str, readonly: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            path: path.to_string(),
            readonly,
            lock: TokenLock::new(format!("repository at {MEMORY_ROOT}{path}")),
            state: Mutex::new(RepoState::default()),
        })
    }

    /// Stores a revision directly, outside any write group. Test setup
    /// convenience.
    pub fn add_revision(
        &self,
        revision: impl Into<RevisionId>,
        parents: Vec<RevisionId>,
        payload: impl Into<Bytes>,
    ) {
        let parents = parents.into_iter().filter(|p| !p.is_null()).collect();
        self.state.lock().revisions.insert(
            revision.into(),
            StoredRevision {
                parents,
                payload: payload.into(),
            },
        );
    }

    /// Number of revisions present.
    pub fn revision_count(&self) -> usize {
        self.state.lock().revisions.len()
    }

    fn check_lockable(&self) -> Result<()> {
        if self.readonly.load(Ordering::SeqCst) {
            return Err(StoreError::LockFailed {
                lock: self.path.clone(),
                why: "readonly transport".to_string(),
            });
        }
        Ok(())
    }

    fn check_write_locked(&self) -> Result<()> {
        if !self.lock.is_locked() {
            return Err(StoreError::NotLocked);
        }
        Ok(())
    }

    fn build_record(&self, revision: &RevisionId) -> Result<StreamRecord> {
        let state = self.state.lock();
        let stored = state
            .revisions
            .get(revision)
            .ok_or_else(|| StoreError::NoSuchRevision(revision.clone()))?;
        Ok(StreamRecord {
            key: vec![revision.to_bytes()],
            body: format_revision_record(&stored.parents, &stored.payload),
        })
    }

    /// Applies write-group records to the revision table. Validates every
    /// record before touching anything so a failure leaves the table
    /// unchanged.
    fn apply_records(state: &mut RepoState, records: &[NetworkRecord]) -> Result<()> {
        let mut parsed = Vec::new();
        for record in records {
            if record.kind != REVISIONS_KIND {
                continue;
            }
            let key = record
                .key
                .first()
                .ok_or_else(|| StoreError::InvalidRecord("revision record without a key".into()))?;
            let (parents, payload) = parse_revision_record(&record.body)?;
            parsed.push((RevisionId::new(key.clone()), StoredRevision { parents, payload }));
        }
        for (revision, stored) in parsed {
            state.revisions.insert(revision, stored);
        }
        Ok(())
    }

    /// Basis keys referenced by pending records but present nowhere.
    fn missing_basis(state: &RepoState) -> Result<Vec<(Bytes, RevisionId)>> {
        let records = state.active.as_deref().unwrap_or(&[]);
        let mut pending_ids = BTreeSet::new();
        for record in records {
            if record.kind == REVISIONS_KIND {
                if let Some(key) = record.key.first() {
                    pending_ids.insert(RevisionId::new(key.clone()));
                }
            }
        }
        let mut missing = BTreeSet::new();
        for record in records {
            if record.kind != REVISIONS_KIND {
                continue;
            }
            let (parents, _) = parse_revision_record(&record.body)?;
            for parent in parents {
                if !state.revisions.contains_key(&parent) && !pending_ids.contains(&parent) {
                    missing.insert((Bytes::from_static(REVISIONS_KIND), parent));
                }
            }
        }
        Ok(missing.into_iter().collect())
    }
}

impl Repository for MemoryRepository {
    fn lock_write(&self, token: Option<&str>) -> Result<String> {
        self.check_lockable()?;
        self.lock.lock_write(token)
    }

    fn unlock(&self) -> Result<()> {
        self.lock.unlock()
    }

    fn leave_lock_in_place(&self) {
        self.lock.leave_in_place();
    }

    fn dont_leave_lock_in_place(&self) {
        self.lock.dont_leave_in_place();
    }

    fn break_lock(&self) -> Result<()> {
        self.lock.break_lock();
        Ok(())
    }

    fn get_physical_lock_status(&self) -> bool {
        self.lock.is_physically_locked()
    }

    fn network_format_name(&self) -> Bytes {
        Bytes::from_static(b"keel-memory-repository-1")
    }

    fn get_graph(&self) -> Graph {
        let state = self.state.lock();
        let parents: HashMap<RevisionId, Vec<RevisionId>> = state
            .revisions
            .iter()
            .map(|(key, stored)| (key.clone(), stored.parents.clone()))
            .collect();
        Graph::new(parents)
    }

    fn all_revision_ids(&self) -> Vec<RevisionId> {
        self.state.lock().revisions.keys().cloned().collect()
    }

    fn has_revision(&self, revision: &RevisionId) -> bool {
        self.state.lock().revisions.contains_key(revision)
    }

    fn start_write_group(&self) -> Result<()> {
        self.check_write_locked()?;
        let mut state = self.state.lock();
        if state.active.is_some() {
            return Err(StoreError::WriteGroupActive);
        }
        state.active = Some(Vec::new());
        Ok(())
    }

    fn suspend_write_group(&self) -> Result<Vec<String>> {
        self.check_write_locked()?;
        let mut state = self.state.lock();
        let records = state.active.take().ok_or(StoreError::NoWriteGroup)?;
        let token = Uuid::new_v4().simple().to_string();
        state.suspended.insert(token.clone(), records);
        Ok(vec![token])
    }

    fn resume_write_group(&self, tokens: &[String]) -> Result<()> {
        self.check_write_locked()?;
        let mut state = self.state.lock();
        if state.active.is_some() {
            return Err(StoreError::WriteGroupActive);
        }
        if tokens.is_empty() {
            return Err(StoreError::UnresumableWriteGroup {
                tokens: Vec::new(),
                reason: "no write group tokens given".to_string(),
            });
        }
        // All tokens must name suspended groups before anything changes.
        for token in tokens {
            if !state.suspended.contains_key(token) {
                return Err(StoreError::UnresumableWriteGroup {
                    tokens: tokens.to_vec(),
                    reason: format!("unknown write group token {token}"),
                });
            }
        }
        let mut records = Vec::new();
        for token in tokens {
            if let Some(group) = state.suspended.remove(token) {
                records.extend(group);
            }
        }
        state.active = Some(records);
        Ok(())
    }

    fn commit_write_group(&self) -> Result<()> {
        self.check_write_locked()?;
        let mut state = self.state.lock();
        let records = state.active.take().ok_or(StoreError::NoWriteGroup)?;
        if let Err(err) = Self::apply_records(&mut state, &records) {
            // Leave the group active so the caller can re-suspend it.
            state.active = Some(records);
            return Err(err);
        }
        Ok(())
    }

    fn abort_write_group(&self) -> Result<()> {
        self.check_write_locked()?;
        let mut state = self.state.lock();
        state.active.take().ok_or(StoreError::NoWriteGroup)?;
        Ok(())
    }

    fn insert_stream(
        &self,
        records: &mut dyn Iterator<Item = Result<NetworkRecord>>,
        resume_tokens: &[String],
    ) -> Result<InsertOutcome> {
        if resume_tokens.is_empty() {
            self.start_write_group()?;
        } else {
            self.resume_write_group(resume_tokens)?;
        }
        let mut incoming = Vec::new();
        for record in records {
            match record {
                Ok(record) => incoming.push(record),
                Err(err) => {
                    // A corrupt stream abandons the whole group.
                    let _ = self.abort_write_group();
                    return Err(err);
                }
            }
        }
        {
            let mut state = self.state.lock();
            state
                .active
                .as_mut()
                .ok_or(StoreError::NoWriteGroup)?
                .extend(incoming);
        }
        let missing = {
            let state = self.state.lock();
            Self::missing_basis(&state)?
        };
        if missing.is_empty() {
            self.commit_write_group()?;
            Ok(InsertOutcome::Complete)
        } else {
            let tokens = self.suspend_write_group()?;
            Ok(InsertOutcome::MissingBasis { tokens, missing })
        }
    }

    fn get_stream(&self, search: &SearchResult) -> Result<Vec<(Bytes, Vec<StreamRecord>)>> {
        let kind = Bytes::from_static(REVISIONS_KIND);
        let mut records = Vec::new();
        for revision in search.get_keys() {
            records.push(self.build_record(revision)?);
        }
        if records.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![(kind, records)])
    }

    fn get_stream_for_missing_keys(
        &self,
        keys: &[(Bytes, RevisionId)],
    ) -> Result<Vec<(Bytes, Vec<StreamRecord>)>> {
        let mut grouped: BTreeMap<Bytes, Vec<StreamRecord>> = BTreeMap::new();
        for (kind, revision) in keys {
            let record = self.build_record(revision)?;
            grouped.entry(kind.clone()).or_default().push(record);
        }
        Ok(grouped.into_iter().collect())
    }
}

#[derive(Debug)]
struct BranchState {
    revno: u64,
    tip: RevisionId,
}

/// An in-memory branch paired with its repository.
pub struct MemoryBranch {
    path: String,
    readonly: Arc<AtomicBool>,
    repository: Arc<MemoryRepository>,
    lock: TokenLock,
    state: Mutex<BranchState>,
}

impl MemoryBranch {
    fn new(path: &str, readonly: Arc<AtomicBool>, repository: Arc<MemoryRepository>) -> Arc<Self> {
        Arc::new(Self {
            path: path.to_string(),
            readonly,
            repository,
            lock: TokenLock::new(format!("branch at {MEMORY_ROOT}{path}")),
            state: Mutex::new(BranchState {
                revno: 0,
                tip: RevisionId::null(),
            }),
        })
    }

    /// The concrete repository, for test setup.
    pub fn memory_repository(&self) -> Arc<MemoryRepository> {
        self.repository.clone()
    }
}

impl Branch for MemoryBranch {
    fn repository(&self) -> Arc<dyn Repository> {
        self.repository.clone()
    }

    fn lock_write(&self, token: Option<&str>) -> Result<String> {
        if self.readonly.load(Ordering::SeqCst) {
            return Err(StoreError::LockFailed {
                lock: self.path.clone(),
                why: "readonly transport".to_string(),
            });
        }
        // The repository lock rides along with the branch lock.
        self.repository.lock_write(None)?;
        match self.lock.lock_write(token) {
            Ok(token) => Ok(token),
            Err(err) => {
                let _ = self.repository.unlock();
                Err(err)
            }
        }
    }

    fn unlock(&self) -> Result<()> {
        self.lock.unlock()?;
        self.repository.unlock()
    }

    fn leave_lock_in_place(&self) {
        self.lock.leave_in_place();
    }

    fn dont_leave_lock_in_place(&self) {
        self.lock.dont_leave_in_place();
    }

    fn break_lock(&self) -> Result<()> {
        self.lock.break_lock();
        self.repository.break_lock()
    }

    fn get_physical_lock_status(&self) -> bool {
        self.lock.is_physically_locked()
    }

    fn last_revision_info(&self) -> (u64, RevisionId) {
        let state = self.state.lock();
        (state.revno, state.tip.clone())
    }

    fn set_last_revision_info(&self, revno: u64, revision: RevisionId) -> Result<()> {
        if !self.lock.is_locked() {
            return Err(StoreError::NotLocked);
        }
        let mut state = self.state.lock();
        state.revno = revno;
        state.tip = revision;
        Ok(())
    }
}

#[derive(Default)]
struct Nodes {
    repositories: HashMap<String, Arc<MemoryRepository>>,
    branches: HashMap<String, Arc<MemoryBranch>>,
}

/// An in-memory tree of repositories and branches addressed by path.
pub struct MemoryBackend {
    readonly: Arc<AtomicBool>,
    nodes: Mutex<Nodes>,
}

impl MemoryBackend {
    /// Creates an empty, writable backend.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            readonly: Arc::new(AtomicBool::new(false)),
            nodes: Mutex::new(Nodes::default()),
        })
    }

    /// Flips the backend (and everything in it) read-only or writable.
    pub fn set_readonly(&self, readonly: bool) {
        self.readonly.store(readonly, Ordering::SeqCst);
    }

    /// Creates a repository at `path`, replacing nothing.
    pub fn create_repository(&self, path: &str) -> Result<Arc<MemoryRepository>> {
        let path = normalize_path("", path)?;
        let mut nodes = self.nodes.lock();
        if nodes.repositories.contains_key(&path) {
            return Err(StoreError::FileExists {
                path: format!("{MEMORY_ROOT}{path}"),
            });
        }
        let repository = MemoryRepository::new(&path, self.readonly.clone());
        nodes.repositories.insert(path, repository.clone());
        Ok(repository)
    }

    /// Creates a branch (with its own repository) at `path`.
    pub fn create_branch(&self, path: &str) -> Result<Arc<MemoryBranch>> {
        let repository = self.create_repository(path)?;
        let path = normalize_path("", path)?;
        let branch = MemoryBranch::new(&path, self.readonly.clone(), repository);
        self.nodes.lock().branches.insert(path, branch.clone());
        Ok(branch)
    }

    /// Returns a transport rooted at the backend root.
    pub fn root_transport(self: &Arc<Self>) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport {
            backend: self.clone(),
            path: String::new(),
        })
    }

    fn node_path(transport: &dyn Transport) -> Result<String> {
        let base = transport.base();
        base.strip_prefix(MEMORY_ROOT)
            .map(|path| path.trim_matches('/').to_string())
            .ok_or_else(|| StoreError::NotBranch { path: base.clone() })
    }
}

impl Backend for MemoryBackend {
    fn open_repository(&self, transport: &dyn Transport) -> Result<Arc<dyn Repository>> {
        let path = Self::node_path(transport)?;
        let nodes = self.nodes.lock();
        nodes
            .repositories
            .get(&path)
            .cloned()
            .map(|repo| repo as Arc<dyn Repository>)
            .ok_or(StoreError::NoSuchFile {
                path: transport.base(),
            })
    }

    fn open_branch(&self, transport: &dyn Transport) -> Result<Arc<dyn Branch>> {
        let path = Self::node_path(transport)?;
        let nodes = self.nodes.lock();
        nodes
            .branches
            .get(&path)
            .cloned()
            .map(|branch| branch as Arc<dyn Branch>)
            .ok_or(StoreError::NotBranch {
                path: transport.base(),
            })
    }
}

/// Joins `relpath` onto `base`, refusing to escape the root.
fn normalize_path(base: &str, relpath: &str) -> Result<String> {
    let mut segments: Vec<&str> = if base.is_empty() {
        Vec::new()
    } else {
        base.split('/').collect()
    };
    for segment in relpath.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(StoreError::PathNotChild {
                        path: relpath.to_string(),
                        base: format!("{MEMORY_ROOT}{base}"),
                    });
                }
            }
            other => segments.push(other),
        }
    }
    Ok(segments.join("/"))
}

struct MemoryTransport {
    backend: Arc<MemoryBackend>,
    path: String,
}

impl Transport for MemoryTransport {
    fn base(&self) -> String {
        format!("{MEMORY_ROOT}{}", self.path)
    }

    fn clone_path(&self, relpath: &str) -> Result<Arc<dyn Transport>> {
        let path = normalize_path(&self.path, relpath)?;
        Ok(Arc::new(MemoryTransport {
            backend: self.backend.clone(),
            path,
        }))
    }

    fn is_readonly(&self) -> bool {
        self.backend.readonly.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rev(id: &str) -> RevisionId {
        RevisionId::from(id)
    }

    fn record(id: &str, parents: &[&str]) -> NetworkRecord {
        let parents: Vec<RevisionId> = parents.iter().map(|p| rev(p)).collect();
        NetworkRecord {
            kind: Bytes::from_static(REVISIONS_KIND),
            key: vec![Bytes::copy_from_slice(id.as_bytes())],
            body: format_revision_record(&parents, b"payload"),
        }
    }

    fn insert(
        repo: &MemoryRepository,
        records: Vec<NetworkRecord>,
        resume: &[String],
    ) -> Result<InsertOutcome> {
        let mut iter = records.into_iter().map(Ok);
        repo.insert_stream(&mut iter, resume)
    }

    #[test]
    fn revision_record_roundtrip() {
        let parents = vec![rev("p1"), rev("p2")];
        let body = format_revision_record(&parents, b"data");
        let (parsed, payload) = parse_revision_record(&body).unwrap();
        assert_eq!(parsed, parents);
        assert_eq!(payload.as_ref(), b"data");
    }

    #[test]
    fn revision_record_no_parents() {
        let body = format_revision_record(&[], b"data");
        let (parsed, payload) = parse_revision_record(&body).unwrap();
        assert!(parsed.is_empty());
        assert_eq!(payload.as_ref(), b"data");
    }

    #[test]
    fn insert_stream_commits_complete_stream() {
        let backend = MemoryBackend::new();
        let repo = backend.create_repository("repo").unwrap();
        repo.lock_write(None).unwrap();
        let outcome = insert(&repo, vec![record("a", &[]), record("b", &["a"])], &[]).unwrap();
        repo.unlock().unwrap();
        assert_eq!(outcome, InsertOutcome::Complete);
        assert!(repo.has_revision(&rev("a")));
        assert!(repo.has_revision(&rev("b")));
    }

    #[test]
    fn insert_stream_empty_is_complete() {
        let backend = MemoryBackend::new();
        let repo = backend.create_repository("repo").unwrap();
        repo.lock_write(None).unwrap();
        let outcome = insert(&repo, vec![], &[]).unwrap();
        repo.unlock().unwrap();
        assert_eq!(outcome, InsertOutcome::Complete);
        assert_eq!(repo.revision_count(), 0);
    }

    #[test]
    fn insert_stream_reports_missing_basis() {
        let backend = MemoryBackend::new();
        let repo = backend.create_repository("repo").unwrap();
        repo.lock_write(None).unwrap();
        let outcome = insert(&repo, vec![record("child", &["absent"])], &[]).unwrap();
        let InsertOutcome::MissingBasis { tokens, missing } = outcome else {
            panic!("expected missing basis");
        };
        assert_eq!(tokens.len(), 1);
        assert_eq!(
            missing,
            vec![(Bytes::from_static(REVISIONS_KIND), rev("absent"))]
        );
        // Nothing applied yet.
        assert_eq!(repo.revision_count(), 0);

        // Supply the basis and resume: everything lands.
        let outcome = insert(&repo, vec![record("absent", &[])], &tokens).unwrap();
        repo.unlock().unwrap();
        assert_eq!(outcome, InsertOutcome::Complete);
        assert!(repo.has_revision(&rev("child")));
        assert!(repo.has_revision(&rev("absent")));
    }

    #[test]
    fn resume_with_unknown_token_fails_closed() {
        let backend = MemoryBackend::new();
        let repo = backend.create_repository("repo").unwrap();
        repo.lock_write(None).unwrap();
        repo.start_write_group().unwrap();
        let tokens = repo.suspend_write_group().unwrap();
        let bogus = vec![tokens[0].clone(), "no-such-token".to_string()];
        let err = repo.resume_write_group(&bogus).unwrap_err();
        assert!(matches!(err, StoreError::UnresumableWriteGroup { .. }));
        // The genuine token still resumes: nothing was consumed.
        repo.resume_write_group(&tokens).unwrap();
        repo.abort_write_group().unwrap();
        repo.unlock().unwrap();
    }

    #[test]
    fn write_group_requires_lock() {
        let backend = MemoryBackend::new();
        let repo = backend.create_repository("repo").unwrap();
        assert!(matches!(
            repo.start_write_group(),
            Err(StoreError::NotLocked)
        ));
    }

    #[test]
    fn commit_twice_with_same_tokens_is_unresumable() {
        let backend = MemoryBackend::new();
        let repo = backend.create_repository("repo").unwrap();
        repo.lock_write(None).unwrap();
        repo.start_write_group().unwrap();
        let tokens = repo.suspend_write_group().unwrap();
        repo.resume_write_group(&tokens).unwrap();
        repo.commit_write_group().unwrap();
        let err = repo.resume_write_group(&tokens).unwrap_err();
        repo.unlock().unwrap();
        assert!(matches!(err, StoreError::UnresumableWriteGroup { .. }));
    }

    #[test]
    fn readonly_backend_refuses_locks() {
        let backend = MemoryBackend::new();
        let repo = backend.create_repository("repo").unwrap();
        backend.set_readonly(true);
        let err = repo.lock_write(None).unwrap_err();
        assert!(matches!(err, StoreError::LockFailed { .. }));
    }

    #[test]
    fn branch_lock_pairs_with_repository() {
        let backend = MemoryBackend::new();
        let branch = backend.create_branch("b").unwrap();
        let repo = branch.memory_repository();

        let token = branch.lock_write(None).unwrap();
        assert!(!token.is_empty());
        assert!(repo.get_physical_lock_status());
        branch.unlock().unwrap();
        assert!(!repo.get_physical_lock_status());
        assert!(!branch.get_physical_lock_status());
    }

    #[test]
    fn get_stream_covers_search_keys() {
        let backend = MemoryBackend::new();
        let repo = backend.create_repository("repo").unwrap();
        repo.add_revision(rev("a"), vec![], "one");
        repo.add_revision(rev("b"), vec![rev("a")], "two");
        let search = SearchResult::covering([rev("a"), rev("b")].into_iter().collect());
        let substreams = repo.get_stream(&search).unwrap();
        assert_eq!(substreams.len(), 1);
        assert_eq!(substreams[0].0.as_ref(), REVISIONS_KIND);
        assert_eq!(substreams[0].1.len(), 2);
    }

    #[test]
    fn get_stream_for_absent_key_is_an_error() {
        let backend = MemoryBackend::new();
        let repo = backend.create_repository("repo").unwrap();
        let keys = vec![(Bytes::from_static(REVISIONS_KIND), rev("nope"))];
        let err = repo.get_stream_for_missing_keys(&keys).unwrap_err();
        assert!(matches!(err, StoreError::NoSuchRevision(_)));
    }

    #[test]
    fn transport_clone_path_stays_in_jail() {
        let backend = MemoryBackend::new();
        let transport = backend.root_transport();
        let sub = transport.clone_path("a/b").unwrap();
        assert_eq!(sub.base(), "memory:///a/b");
        let back = sub.clone_path("../c").unwrap();
        assert_eq!(back.base(), "memory:///a/c");
        assert!(matches!(
            transport.clone_path("../escape"),
            Err(StoreError::PathNotChild { .. })
        ));
    }

    #[test]
    fn open_repository_by_transport() {
        let backend = MemoryBackend::new();
        backend.create_repository("repo").unwrap();
        let transport = backend.root_transport().clone_path("repo").unwrap();
        assert!(backend.open_repository(&*transport).is_ok());
        let missing = backend.root_transport().clone_path("missing").unwrap();
        assert!(matches!(
            backend.open_repository(&*missing),
            Err(StoreError::NoSuchFile { .. })
        ));
    }
}
