//! Repository request handlers: locking, graph queries, record
//! streaming and write groups.

use crate::error::ServerError;
use crate::estimate::ZlibEstimator;
use crate::insert::StreamInserter;
use crate::request::{required_arg as arg, token_arg, RequestContext, Verb};
use crate::response::{BodyStream, Response};
use crate::search::{parse_search_lines, recreate_search, recreate_search_from_recipe};
use crate::Result;
use bytes::{BufMut, Bytes, BytesMut};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use keel_pack::encode_stream;
use keel_store::{Graph, Repository, RevisionId, StoreError};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::sync::Arc;

/// Parent-map responses stop growing near this compressed size.
const PARENT_MAP_BUDGET: u64 = 64 * 1024;

fn ok() -> Bytes {
    Bytes::from_static(b"ok")
}

/// Splits a space-separated token-set argument.
fn parse_tokens(bytes: &[u8]) -> Result<Vec<String>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| ServerError::Protocol("write group tokens are not valid UTF-8".to_string()))?;
    Ok(text
        .split(' ')
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect())
}

fn joined_tokens(tokens: &[String]) -> Bytes {
    Bytes::from(tokens.join(" ").into_bytes())
}

/// `Repository.lock_write` - take (or re-validate) the repository write
/// lock, leaving the physical lock in place for the client.
#[derive(Debug, Default)]
pub(crate) struct RepositoryLockWrite;

impl Verb for RepositoryLockWrite {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        let repository = ctx.open_repository(arg(args, 0)?)?;
        let token = token_arg(args, 1)?;
        let token = match repository.lock_write(token.as_deref()) {
            Ok(token) => token,
            Err(StoreError::LockContention { .. }) => {
                return Ok(Some(Response::failed(vec![Bytes::from_static(
                    b"LockContention",
                )])));
            }
            Err(StoreError::UnlockableTransport) => {
                return Ok(Some(Response::failed(vec![Bytes::from_static(
                    b"UnlockableTransport",
                )])));
            }
            Err(StoreError::LockFailed { lock, why }) => {
                return Ok(Some(Response::failed(vec![
                    Bytes::from_static(b"LockFailed"),
                    Bytes::from(lock.into_bytes()),
                    Bytes::from(why.into_bytes()),
                ])));
            }
            Err(err) => return Err(err.into()),
        };
        repository.leave_lock_in_place();
        repository.unlock()?;
        Ok(Some(Response::success(vec![
            ok(),
            Bytes::from(token.into_bytes()),
        ])))
    }
}

/// `Repository.unlock` - release the physical lock named by the token.
#[derive(Debug, Default)]
pub(crate) struct RepositoryUnlock;

impl Verb for RepositoryUnlock {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        let repository = ctx.open_repository(arg(args, 0)?)?;
        let token = token_arg(args, 1)?;
        match repository.lock_write(token.as_deref()) {
            Ok(_) => {}
            Err(StoreError::TokenMismatch { .. }) => {
                return Ok(Some(Response::failed(vec![Bytes::from_static(
                    b"TokenMismatch",
                )])));
            }
            Err(err) => return Err(err.into()),
        }
        repository.dont_leave_lock_in_place();
        repository.unlock()?;
        Ok(Some(Response::success(vec![ok()])))
    }
}

/// `Repository.break_lock`.
#[derive(Debug, Default)]
pub(crate) struct RepositoryBreakLock;

impl Verb for RepositoryBreakLock {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        let repository = ctx.open_repository(arg(args, 0)?)?;
        repository.break_lock()?;
        Ok(Some(Response::success(vec![ok()])))
    }
}

/// `Repository.get_physical_lock_status`.
#[derive(Debug, Default)]
pub(crate) struct RepositoryPhysicalLockStatus;

impl Verb for RepositoryPhysicalLockStatus {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        let repository = ctx.open_repository(arg(args, 0)?)?;
        let answer: &'static [u8] = if repository.get_physical_lock_status() {
            b"yes"
        } else {
            b"no"
        };
        Ok(Some(Response::success(vec![Bytes::from_static(answer)])))
    }
}

/// `Repository.has_revision`.
#[derive(Debug, Default)]
pub(crate) struct RepositoryHasRevision;

impl Verb for RepositoryHasRevision {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        let repository = ctx.open_repository(arg(args, 0)?)?;
        let revision = RevisionId::new(arg(args, 1)?.clone());
        let answer: &'static [u8] = if repository.has_revision(&revision) {
            b"yes"
        } else {
            b"no"
        };
        Ok(Some(Response::success(vec![Bytes::from_static(answer)])))
    }
}

/// `Repository.all_revision_ids` - newline-separated body, sorted for
/// determinism.
#[derive(Debug, Default)]
pub(crate) struct RepositoryAllRevisionIds;

impl Verb for RepositoryAllRevisionIds {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        let repository = ctx.open_repository(arg(args, 0)?)?;
        let mut ids = repository.all_revision_ids();
        ids.sort();
        let mut body = BytesMut::new();
        for (i, id) in ids.iter().enumerate() {
            if i > 0 {
                body.put_u8(b'\n');
            }
            body.put_slice(id.as_bytes());
        }
        Ok(Some(Response::success_with_body(vec![ok()], body.freeze())))
    }
}

fn missing_prefixed(revision: &RevisionId) -> Bytes {
    let mut encoded = BytesMut::with_capacity(8 + revision.as_bytes().len());
    encoded.put_slice(b"missing:");
    encoded.put_slice(revision.as_bytes());
    encoded.freeze()
}

/// Expands the requested ids breadth-first, one generation at a time,
/// within a compressed-size budget.
///
/// Each id is queried at most once per request. Ids the client already
/// knows are omitted from the result but still traversed for their
/// parents. Ghosts serialize with a `missing:` prefix and an empty
/// parent list when `include_missing` is set, and are omitted otherwise.
fn expand_requested_revs(
    graph: &Graph,
    revision_ids: &[RevisionId],
    client_seen: &HashSet<RevisionId>,
    include_missing: bool,
    no_extra_results: bool,
    max_size: u64,
) -> Result<BTreeMap<Bytes, Vec<RevisionId>>> {
    let mut result = BTreeMap::new();
    let mut queried: HashSet<RevisionId> = HashSet::new();
    let mut estimator = ZlibEstimator::new(max_size);
    let mut next_revs: Vec<RevisionId> = Vec::new();
    for id in revision_ids {
        if !next_revs.contains(id) {
            next_revs.push(id.clone());
        }
    }
    let mut first_loop_done = false;
    while !next_revs.is_empty() {
        queried.extend(next_revs.iter().cloned());
        let parent_map = graph.get_parent_map(&next_revs);
        let current = std::mem::take(&mut next_revs);
        let mut frontier: HashSet<RevisionId> = HashSet::new();
        for revision in current {
            let (encoded, parents, missing) = match parent_map.get(&revision) {
                Some(parents) => {
                    frontier.extend(parents.iter().cloned());
                    (revision.to_bytes(), parents.clone(), false)
                }
                None => (missing_prefixed(&revision), Vec::new(), true),
            };
            if !client_seen.contains(&revision) && (!missing || include_missing) {
                // Approximate the serialized cost of this entry.
                let mut line = BytesMut::new();
                line.put_slice(&encoded);
                for parent in &parents {
                    line.put_u8(b' ');
                    line.put_slice(parent.as_bytes());
                }
                line.put_u8(b'\n');
                estimator.add_content(&line)?;
                result.insert(encoded, parents);
            }
        }
        // Flesh the response out to the compressed budget, one whole
        // generation at a time so client and server walk in step.
        if no_extra_results || (first_loop_done && estimator.full()?) {
            break;
        }
        next_revs = frontier
            .into_iter()
            .filter(|revision| !queried.contains(revision))
            .collect();
        first_loop_done = true;
    }
    Ok(result)
}

fn compress_body(data: &[u8]) -> Result<Bytes> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(Bytes::from(encoder.finish()?))
}

/// `Repository.get_parent_map` - bulk parent lookup during graph
/// negotiation.
///
/// Args are the requested revision ids (plus the `include-missing:`
/// flag); the body carries the client's current search state as the
/// three `search` recipe lines. The response body is the
/// zlib-compressed, sorted `id parent...` lines.
#[derive(Default)]
pub(crate) struct RepositoryGetParentMap {
    repository: Option<Arc<dyn Repository>>,
    revision_ids: Vec<RevisionId>,
    include_missing: bool,
}

impl Verb for RepositoryGetParentMap {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        self.repository = Some(ctx.open_repository(arg(args, 0)?)?);
        for argument in &args[1..] {
            if argument.as_ref() == b"include-missing:" {
                self.include_missing = true;
            } else {
                self.revision_ids.push(RevisionId::new(argument.clone()));
            }
        }
        Ok(None)
    }

    fn body(&mut self, _ctx: &mut RequestContext, body: Bytes) -> Result<Response> {
        let repository = self
            .repository
            .take()
            .ok_or_else(|| ServerError::Protocol("body received before arguments".to_string()))?;
        let lines: Vec<&[u8]> = body.split(|&b| b == b'\n').collect();
        let (start, exclude, count) = parse_search_lines(&lines)?;
        let search = recreate_search_from_recipe(&*repository, start, exclude, count, false)?;

        let mut client_seen: HashSet<RevisionId> = search.get_keys().iter().cloned().collect();
        // Always answer for the ids actually asked about.
        for revision in &self.revision_ids {
            client_seen.remove(revision);
        }

        let graph = repository.get_graph();
        let result = expand_requested_revs(
            &graph,
            &self.revision_ids,
            &client_seen,
            self.include_missing,
            false,
            PARENT_MAP_BUDGET,
        )?;

        // Sorting puts lexicographically similar ids together, which
        // also helps the compressor.
        let mut payload = BytesMut::new();
        for (i, (encoded, parents)) in result.iter().enumerate() {
            if i > 0 {
                payload.put_u8(b'\n');
            }
            payload.put_slice(encoded);
            for parent in parents {
                payload.put_u8(b' ');
                payload.put_slice(parent.as_bytes());
            }
        }
        let compressed = compress_body(&payload)?;
        Ok(Response::success_with_body(vec![ok()], compressed))
    }
}

fn stream_response(
    repository: &Arc<dyn Repository>,
    substreams: Vec<(Bytes, Vec<keel_pack::StreamRecord>)>,
) -> Response {
    let encoded = encode_stream(repository.network_format_name(), substreams)
        .map(|chunk| chunk.map_err(ServerError::from));
    let stream: BodyStream = Box::new(encoded);
    Response::success_with_stream(vec![ok()], stream)
}

/// `Repository.get_stream` - stream the records covering a search
/// recipe, as a lazily-produced pack container.
#[derive(Default)]
pub(crate) struct RepositoryGetStream {
    repository: Option<Arc<dyn Repository>>,
}

impl Verb for RepositoryGetStream {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        // args[1] names the client's target format; the memory backend
        // streams one network format, so it only needs to be present.
        arg(args, 1)?;
        self.repository = Some(ctx.open_repository(arg(args, 0)?)?);
        Ok(None)
    }

    fn body(&mut self, _ctx: &mut RequestContext, body: Bytes) -> Result<Response> {
        let repository = self
            .repository
            .take()
            .ok_or_else(|| ServerError::Protocol("body received before arguments".to_string()))?;
        // Streaming verbs tolerate excess: the client fetches anything
        // missing from elsewhere.
        let search = recreate_search(&*repository, &body, true)?;
        let substreams = repository.get_stream(&search)?;
        Ok(stream_response(&repository, substreams))
    }
}

/// `Repository.get_stream_for_missing_keys` - stream records for
/// specific `(kind, revision)` keys, typically the basis data a prior
/// insert reported missing.
#[derive(Default)]
pub(crate) struct RepositoryGetStreamForMissingKeys {
    repository: Option<Arc<dyn Repository>>,
}

impl Verb for RepositoryGetStreamForMissingKeys {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        arg(args, 1)?;
        self.repository = Some(ctx.open_repository(arg(args, 0)?)?);
        Ok(None)
    }

    fn body(&mut self, _ctx: &mut RequestContext, body: Bytes) -> Result<Response> {
        let repository = self
            .repository
            .take()
            .ok_or_else(|| ServerError::Protocol("body received before arguments".to_string()))?;
        let mut keys = Vec::new();
        for line in body.split(|&b| b == b'\n').filter(|line| !line.is_empty()) {
            let tab = line.iter().position(|&b| b == b'\t').ok_or_else(|| {
                ServerError::Protocol("missing-key entry is not kind<TAB>revision".to_string())
            })?;
            keys.push((
                Bytes::copy_from_slice(&line[..tab]),
                RevisionId::from(&line[tab + 1..]),
            ));
        }
        let substreams = repository.get_stream_for_missing_keys(&keys)?;
        Ok(stream_response(&repository, substreams))
    }
}

/// Shared machinery for the insert verbs: locks the repository, spawns
/// the insert pipeline, forwards chunks, and reports the outcome.
#[derive(Default)]
struct InsertStreamCore {
    repository: Option<Arc<dyn Repository>>,
    inserter: Option<StreamInserter>,
}

impl InsertStreamCore {
    fn start(
        &mut self,
        ctx: &mut RequestContext,
        args: &[Bytes],
        lock_token: Option<String>,
    ) -> Result<Option<Response>> {
        let repository = ctx.open_repository(arg(args, 0)?)?;
        let resume_tokens = parse_tokens(arg(args, 1)?)?;
        repository.lock_write(lock_token.as_deref())?;
        let inserter = match StreamInserter::spawn(repository.clone(), resume_tokens) {
            Ok(inserter) => inserter,
            Err(err) => {
                let _ = repository.unlock();
                return Err(err);
            }
        };
        self.repository = Some(repository);
        self.inserter = Some(inserter);
        Ok(None)
    }

    fn chunk(&mut self, bytes: Bytes) -> Result<()> {
        let inserter = self
            .inserter
            .as_ref()
            .ok_or_else(|| ServerError::Protocol("body chunk before insert started".to_string()))?;
        inserter.push_chunk(bytes);
        Ok(())
    }

    fn finish(&mut self) -> Result<Response> {
        let inserter = self
            .inserter
            .take()
            .ok_or_else(|| ServerError::Protocol("end of body before insert started".to_string()))?;
        let repository = self
            .repository
            .take()
            .ok_or_else(|| ServerError::Protocol("end of body before insert started".to_string()))?;
        let outcome = inserter.finish();
        let unlock = repository.unlock();
        let outcome = outcome?;
        unlock?;
        match outcome {
            keel_store::InsertOutcome::Complete => Ok(Response::success(vec![ok()])),
            keel_store::InsertOutcome::MissingBasis { tokens, missing } => {
                // First line: the resume tokens. Then one
                // kind<TAB>revision line per missing key, sorted.
                let mut body = BytesMut::new();
                body.put_slice(&joined_tokens(&tokens));
                for (kind, revision) in &missing {
                    body.put_u8(b'\n');
                    body.put_slice(kind);
                    body.put_u8(b'\t');
                    body.put_slice(revision.as_bytes());
                }
                Ok(Response::success(vec![
                    Bytes::from_static(b"missing-basis"),
                    body.freeze(),
                ]))
            }
        }
    }
}

/// `Repository.insert_stream` - insert a record stream pushed as body
/// chunks into an unlocked repository.
#[derive(Default)]
pub(crate) struct RepositoryInsertStream {
    core: InsertStreamCore,
}

impl Verb for RepositoryInsertStream {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        self.core.start(ctx, args, None)
    }

    fn chunk(&mut self, _ctx: &mut RequestContext, bytes: Bytes) -> Result<()> {
        self.core.chunk(bytes)
    }

    fn finish(&mut self, _ctx: &mut RequestContext) -> Result<Response> {
        self.core.finish()
    }
}

/// `Repository.insert_stream_locked` - the same, for a repository the
/// client holds a lock token for.
#[derive(Default)]
pub(crate) struct RepositoryInsertStreamLocked {
    core: InsertStreamCore,
}

impl Verb for RepositoryInsertStreamLocked {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        let lock_token = token_arg(args, 2)?;
        self.core.start(ctx, args, lock_token)
    }

    fn chunk(&mut self, _ctx: &mut RequestContext, bytes: Bytes) -> Result<()> {
        self.core.chunk(bytes)
    }

    fn finish(&mut self, _ctx: &mut RequestContext) -> Result<Response> {
        self.core.finish()
    }
}

/// `Repository.start_write_group` - start a group and immediately
/// suspend it, answering with the resume tokens the client will present
/// to later verbs.
#[derive(Debug, Default)]
pub(crate) struct RepositoryStartWriteGroup;

impl Verb for RepositoryStartWriteGroup {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        let repository = ctx.open_repository(arg(args, 0)?)?;
        let lock_token = token_arg(args, 1)?;
        repository.lock_write(lock_token.as_deref())?;
        let result = repository
            .start_write_group()
            .and_then(|()| repository.suspend_write_group());
        let unlock = repository.unlock();
        let response = match result {
            Ok(tokens) => Response::success(vec![ok(), joined_tokens(&tokens)]),
            Err(StoreError::UnsuspendableWriteGroup) => {
                Response::failed(vec![Bytes::from_static(b"UnsuspendableWriteGroup")])
            }
            Err(err) => return Err(err.into()),
        };
        unlock?;
        Ok(Some(response))
    }
}

/// Resumes a write group and runs `operation` on it; the repository
/// lock taken for the verb is released on every path.
fn with_resumed_write_group<F>(
    ctx: &RequestContext,
    args: &[Bytes],
    operation: F,
) -> Result<Response>
where
    F: FnOnce(&Arc<dyn Repository>) -> Result<Response>,
{
    let repository = ctx.open_repository(arg(args, 0)?)?;
    let lock_token = token_arg(args, 1)?;
    let write_group_tokens = parse_tokens(arg(args, 2)?)?;
    repository.lock_write(lock_token.as_deref())?;
    let result = (|| {
        match repository.resume_write_group(&write_group_tokens) {
            Ok(()) => {}
            Err(StoreError::UnresumableWriteGroup { tokens, reason }) => {
                return Ok(Response::failed(vec![
                    Bytes::from_static(b"UnresumableWriteGroup"),
                    joined_tokens(&tokens),
                    Bytes::from(reason.into_bytes()),
                ]));
            }
            Err(err) => return Err(err.into()),
        }
        operation(&repository)
    })();
    let unlock = repository.unlock();
    let response = result?;
    unlock?;
    Ok(response)
}

/// `Repository.commit_write_group` - resume and commit. A commit
/// failure re-suspends the group before the error propagates, so the
/// transaction is never lost.
#[derive(Debug, Default)]
pub(crate) struct RepositoryCommitWriteGroup;

impl Verb for RepositoryCommitWriteGroup {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        with_resumed_write_group(ctx, args, |repository| {
            if let Err(err) = repository.commit_write_group() {
                let _ = repository.suspend_write_group();
                return Err(err.into());
            }
            Ok(Response::success(vec![ok()]))
        })
        .map(Some)
    }
}

/// `Repository.abort_write_group` - resume and discard.
#[derive(Debug, Default)]
pub(crate) struct RepositoryAbortWriteGroup;

impl Verb for RepositoryAbortWriteGroup {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        with_resumed_write_group(ctx, args, |repository| {
            repository.abort_write_group()?;
            Ok(Response::success(vec![ok()]))
        })
        .map(Some)
    }
}

/// `Repository.check_write_group` - verify a suspended group is still
/// resumable, answering with the tokens under which it was re-suspended.
#[derive(Debug, Default)]
pub(crate) struct RepositoryCheckWriteGroup;

impl Verb for RepositoryCheckWriteGroup {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        with_resumed_write_group(ctx, args, |repository| {
            let tokens = repository.suspend_write_group()?;
            Ok(Response::success(vec![ok(), joined_tokens(&tokens)]))
        })
        .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_store::{MemoryBackend, MemoryRepository};
    use pretty_assertions::assert_eq;
    use std::io::Read;

    fn rev(id: &str) -> RevisionId {
        RevisionId::from(id)
    }

    /// Repository at `repo` with history a <- b <- c.
    fn sample() -> (std::sync::Arc<MemoryBackend>, std::sync::Arc<MemoryRepository>) {
        let backend = MemoryBackend::new();
        let repo = backend.create_repository("repo").unwrap();
        repo.add_revision(rev("a"), vec![], "");
        repo.add_revision(rev("b"), vec![rev("a")], "");
        repo.add_revision(rev("c"), vec![rev("b")], "");
        (backend, repo)
    }

    fn ctx(backend: &std::sync::Arc<MemoryBackend>) -> RequestContext {
        let mut context =
            RequestContext::new(backend.clone(), backend.root_transport(), "/", None);
        context.setup_jail();
        context
    }

    fn args(parts: &[&[u8]]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p)).collect()
    }

    fn decompress(body: &[u8]) -> Vec<u8> {
        let mut decoder = flate2::read::ZlibDecoder::new(body);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn lock_write_and_unlock() {
        let (backend, repo) = sample();
        let mut context = ctx(&backend);

        let mut verb = RepositoryLockWrite;
        let response = verb
            .call(&mut context, &args(&[b"repo", b""]))
            .unwrap()
            .unwrap();
        assert!(response.is_successful());
        let token = response.args()[1].clone();
        assert!(!token.is_empty());
        assert!(repo.get_physical_lock_status());

        // Contention while the physical lock is held.
        let mut verb = RepositoryLockWrite;
        let response = verb
            .call(&mut context, &args(&[b"repo", b""]))
            .unwrap()
            .unwrap();
        assert_eq!(response.args()[0].as_ref(), b"LockContention");

        let mut verb = RepositoryUnlock;
        let response = verb
            .call(&mut context, &args(&[b"repo", token.as_ref()]))
            .unwrap()
            .unwrap();
        assert!(response.is_successful());
        assert!(!repo.get_physical_lock_status());
    }

    #[test]
    fn unlock_with_wrong_token_is_token_mismatch() {
        let (backend, repo) = sample();
        let mut context = ctx(&backend);
        let token = repo.lock_write(None).unwrap();
        repo.leave_lock_in_place();
        repo.unlock().unwrap();

        let mut verb = RepositoryUnlock;
        let response = verb
            .call(&mut context, &args(&[b"repo", b"wrong-token"]))
            .unwrap()
            .unwrap();
        assert!(!response.is_successful());
        assert_eq!(response.args()[0].as_ref(), b"TokenMismatch");
        // Lock state unchanged.
        assert!(repo.get_physical_lock_status());
        repo.lock_write(Some(&token)).unwrap();
        repo.dont_leave_lock_in_place();
        repo.unlock().unwrap();
    }

    #[test]
    fn has_revision_answers_yes_and_no() {
        let (backend, _repo) = sample();
        let mut context = ctx(&backend);

        let mut verb = RepositoryHasRevision;
        let response = verb
            .call(&mut context, &args(&[b"repo", b"b"]))
            .unwrap()
            .unwrap();
        assert_eq!(response.args()[0].as_ref(), b"yes");

        let mut verb = RepositoryHasRevision;
        let response = verb
            .call(&mut context, &args(&[b"repo", b"nope"]))
            .unwrap()
            .unwrap();
        assert_eq!(response.args()[0].as_ref(), b"no");
    }

    #[test]
    fn all_revision_ids_sorted_body() {
        let (backend, _repo) = sample();
        let mut context = ctx(&backend);

        let mut verb = RepositoryAllRevisionIds;
        let response = verb
            .call(&mut context, &args(&[b"repo"]))
            .unwrap()
            .unwrap();
        assert_eq!(response.body().unwrap().as_ref(), b"a\nb\nc");
    }

    #[test]
    fn get_parent_map_returns_compressed_parents() {
        let (backend, _repo) = sample();
        let mut context = ctx(&backend);

        let mut verb = RepositoryGetParentMap::default();
        let pending = verb
            .call(&mut context, &args(&[b"repo", b"c"]))
            .unwrap();
        assert!(pending.is_none());
        // Client state: nothing walked yet.
        let response = verb
            .body(&mut context, Bytes::from_static(b"\n\n0"))
            .unwrap();
        assert!(response.is_successful());
        let lines = decompress(response.body().unwrap());
        // Expansion continues past the requested id until the budget or
        // the graph is exhausted.
        assert_eq!(lines, b"a\nb a\nc b");
    }

    #[test]
    fn get_parent_map_omits_client_seen_ids() {
        let (backend, _repo) = sample();
        let mut context = ctx(&backend);

        let mut verb = RepositoryGetParentMap::default();
        verb.call(&mut context, &args(&[b"repo", b"c"])).unwrap();
        // The client has already walked b (and excludes a beneath it).
        let response = verb
            .body(&mut context, Bytes::from_static(b"b\na\n1"))
            .unwrap();
        let lines = decompress(response.body().unwrap());
        assert_eq!(lines, b"a\nc b");
    }

    #[test]
    fn get_parent_map_reports_ghosts_when_asked() {
        let (backend, repo) = sample();
        repo.add_revision(rev("tip"), vec![rev("ghost")], "");
        let mut context = ctx(&backend);

        let mut verb = RepositoryGetParentMap::default();
        verb.call(
            &mut context,
            &args(&[b"repo", b"include-missing:", b"ghost"]),
        )
        .unwrap();
        let response = verb
            .body(&mut context, Bytes::from_static(b"\n\n0"))
            .unwrap();
        let lines = decompress(response.body().unwrap());
        assert_eq!(lines, b"missing:ghost");
    }

    #[test]
    fn get_parent_map_with_wrong_count_is_no_such_revision() {
        let (backend, _repo) = sample();
        let mut context = ctx(&backend);

        let mut verb = RepositoryGetParentMap::default();
        verb.call(&mut context, &args(&[b"repo", b"c"])).unwrap();
        let err = verb
            .body(&mut context, Bytes::from_static(b"b\na\n5"))
            .unwrap_err();
        assert!(matches!(err, ServerError::SearchCountMismatch { .. }));
    }

    #[test]
    fn expansion_queries_each_id_once() {
        // A diamond: d has parents b and c, both children of a. The
        // shared parent a is queried exactly once even though two paths
        // reach it.
        let backend = MemoryBackend::new();
        let repo = backend.create_repository("repo").unwrap();
        repo.add_revision(rev("a"), vec![], "");
        repo.add_revision(rev("b"), vec![rev("a")], "");
        repo.add_revision(rev("c"), vec![rev("a")], "");
        repo.add_revision(rev("d"), vec![rev("b"), rev("c")], "");
        let graph = repo.get_graph();
        let result = expand_requested_revs(
            &graph,
            &[rev("d")],
            &HashSet::new(),
            false,
            false,
            PARENT_MAP_BUDGET,
        )
        .unwrap();
        assert_eq!(result.len(), 4);
        assert_eq!(result[&Bytes::from_static(b"d")], vec![rev("b"), rev("c")]);
        assert_eq!(result[&Bytes::from_static(b"a")], Vec::<RevisionId>::new());
    }

    #[test]
    fn no_extra_results_stops_after_requested_ids() {
        let (_backend, repo) = sample();
        let graph = repo.get_graph();
        let result = expand_requested_revs(
            &graph,
            &[rev("c")],
            &HashSet::new(),
            false,
            true,
            PARENT_MAP_BUDGET,
        )
        .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[&Bytes::from_static(b"c")], vec![rev("b")]);
    }

    #[test]
    fn get_stream_encodes_search_results() {
        let (backend, _repo) = sample();
        let mut context = ctx(&backend);

        let mut verb = RepositoryGetStream::default();
        let pending = verb
            .call(&mut context, &args(&[b"repo", b"keel-memory-repository-1"]))
            .unwrap();
        assert!(pending.is_none());
        let mut response = verb
            .body(&mut context, Bytes::from_static(b"search\nc\na\n2"))
            .unwrap();
        assert!(response.is_successful());
        assert!(response.has_body_stream());

        let chunks: Vec<Bytes> = response
            .take_body_stream()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let mut decoder = keel_pack::StreamDecoder::new(chunks.into_iter());
        assert_eq!(
            decoder.read_format_name().unwrap().as_ref(),
            b"keel-memory-repository-1"
        );
        let mut keys = Vec::new();
        while let Some((kind, record)) = decoder.next_keyed_record().unwrap() {
            assert_eq!(kind.as_ref(), b"revisions");
            keys.push(record.key[0].clone());
        }
        assert_eq!(keys, vec![Bytes::from_static(b"b"), Bytes::from_static(b"c")]);
    }

    #[test]
    fn get_stream_with_bad_recipe_fails() {
        let (backend, _repo) = sample();
        let mut context = ctx(&backend);

        let mut verb = RepositoryGetStream::default();
        verb.call(&mut context, &args(&[b"repo", b"fmt"])).unwrap();
        let err = verb
            .body(&mut context, Bytes::from_static(b"gibberish"))
            .unwrap_err();
        assert!(matches!(err, ServerError::BadSearch));
    }

    #[test]
    fn write_group_verbs_roundtrip() {
        let (backend, repo) = sample();
        let mut context = ctx(&backend);
        let lock_token = repo.lock_write(None).unwrap();
        repo.leave_lock_in_place();
        repo.unlock().unwrap();

        let mut verb = RepositoryStartWriteGroup;
        let response = verb
            .call(&mut context, &args(&[b"repo", lock_token.as_bytes()]))
            .unwrap()
            .unwrap();
        assert!(response.is_successful());
        let tokens = response.args()[1].clone();
        assert!(!tokens.is_empty());

        let mut verb = RepositoryCommitWriteGroup;
        let response = verb
            .call(
                &mut context,
                &args(&[b"repo", lock_token.as_bytes(), tokens.as_ref()]),
            )
            .unwrap()
            .unwrap();
        assert!(response.is_successful());

        // Committing the same tokens again fails closed.
        let mut verb = RepositoryCommitWriteGroup;
        let response = verb
            .call(
                &mut context,
                &args(&[b"repo", lock_token.as_bytes(), tokens.as_ref()]),
            )
            .unwrap()
            .unwrap();
        assert!(!response.is_successful());
        assert_eq!(response.args()[0].as_ref(), b"UnresumableWriteGroup");

        repo.lock_write(Some(&lock_token)).unwrap();
        repo.dont_leave_lock_in_place();
        repo.unlock().unwrap();
    }

    #[test]
    fn check_write_group_returns_fresh_tokens() {
        let (backend, repo) = sample();
        let mut context = ctx(&backend);
        let lock_token = repo.lock_write(None).unwrap();
        repo.leave_lock_in_place();
        repo.unlock().unwrap();

        let mut verb = RepositoryStartWriteGroup;
        let response = verb
            .call(&mut context, &args(&[b"repo", lock_token.as_bytes()]))
            .unwrap()
            .unwrap();
        let tokens = response.args()[1].clone();

        let mut verb = RepositoryCheckWriteGroup;
        let response = verb
            .call(
                &mut context,
                &args(&[b"repo", lock_token.as_bytes(), tokens.as_ref()]),
            )
            .unwrap()
            .unwrap();
        assert!(response.is_successful());
        let fresh = response.args()[1].clone();
        assert!(!fresh.is_empty());

        // The old tokens were consumed by the check's resume.
        let mut verb = RepositoryAbortWriteGroup;
        let response = verb
            .call(
                &mut context,
                &args(&[b"repo", lock_token.as_bytes(), tokens.as_ref()]),
            )
            .unwrap()
            .unwrap();
        assert!(!response.is_successful());

        // The fresh ones work.
        let mut verb = RepositoryAbortWriteGroup;
        let response = verb
            .call(
                &mut context,
                &args(&[b"repo", lock_token.as_bytes(), fresh.as_ref()]),
            )
            .unwrap()
            .unwrap();
        assert!(response.is_successful());

        repo.lock_write(Some(&lock_token)).unwrap();
        repo.dont_leave_lock_in_place();
        repo.unlock().unwrap();
    }
}
