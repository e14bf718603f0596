//! Branch request handlers: locking and tip changes.

use crate::error::ServerError;
use crate::request::{required_arg as arg, token_arg, RequestContext, Verb};
use crate::response::Response;
use crate::Result;
use bytes::Bytes;
use keel_store::{Branch, Repository, RevisionId, StoreError};
use std::sync::Arc;

fn bool_arg(args: &[Bytes], index: usize) -> Result<bool> {
    match arg(args, index)?.as_ref() {
        b"0" => Ok(false),
        b"1" => Ok(true),
        other => Err(ServerError::Protocol(format!(
            "{:?} is not a valid flag",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn revno_bytes(revno: u64) -> Bytes {
    Bytes::from(revno.to_string().into_bytes())
}

fn ok() -> Bytes {
    Bytes::from_static(b"ok")
}

/// Locks a branch and its repository with the supplied tokens, mirroring
/// the paired-lock dance: the repository is locked first, the branch lock
/// acquires the repository again transiently, and the extra in-process
/// reference is dropped so the repository ends at exactly one.
fn lock_branch_pair(
    branch: &Arc<dyn Branch>,
    repository: &Arc<dyn Repository>,
    branch_token: Option<&str>,
    repo_token: Option<&str>,
) -> keel_store::Result<(String, String)> {
    let repo_token = repository.lock_write(repo_token)?;
    let branch_result = branch.lock_write(branch_token);
    repository.unlock()?;
    let branch_token = branch_result?;
    Ok((branch_token, repo_token))
}

/// Runs `operation` with the branch write-locked under the client's
/// tokens; the branch (and paired repository) is unlocked on every path.
fn with_locked_branch<F>(
    ctx: &RequestContext,
    args: &[Bytes],
    operation: F,
) -> Result<Response>
where
    F: FnOnce(&Arc<dyn Branch>, &Arc<dyn Repository>) -> Result<Response>,
{
    let branch = ctx.open_branch(arg(args, 0)?)?;
    let repository = branch.repository();
    let branch_token = token_arg(args, 1)?;
    let repo_token = token_arg(args, 2)?;
    match lock_branch_pair(
        &branch,
        &repository,
        branch_token.as_deref(),
        repo_token.as_deref(),
    ) {
        Ok(_) => {}
        Err(StoreError::TokenMismatch { .. }) => {
            return Ok(Response::failed(vec![Bytes::from_static(b"TokenMismatch")]));
        }
        Err(err) => return Err(err.into()),
    }
    let outcome = operation(&branch, &repository);
    let unlock = branch.unlock();
    let response = outcome?;
    unlock?;
    Ok(response)
}

/// `Branch.lock_write` - acquire (or re-validate) the paired locks,
/// leaving the physical locks in place for the client to use across the
/// RPC boundary.
#[derive(Debug, Default)]
pub(crate) struct BranchLockWrite;

impl Verb for BranchLockWrite {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        let branch = ctx.open_branch(arg(args, 0)?)?;
        let repository = branch.repository();
        let branch_token = token_arg(args, 1)?;
        let repo_token = token_arg(args, 2)?;
        let (branch_token, repo_token) = match lock_branch_pair(
            &branch,
            &repository,
            branch_token.as_deref(),
            repo_token.as_deref(),
        ) {
            Ok(tokens) => tokens,
            Err(StoreError::LockContention { .. }) => {
                return Ok(Some(Response::failed(vec![Bytes::from_static(
                    b"LockContention",
                )])));
            }
            Err(StoreError::TokenMismatch { .. }) => {
                return Ok(Some(Response::failed(vec![Bytes::from_static(
                    b"TokenMismatch",
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
        branch.leave_lock_in_place();
        branch.unlock()?;
        Ok(Some(Response::success(vec![
            ok(),
            Bytes::from(branch_token.into_bytes()),
            Bytes::from(repo_token.into_bytes()),
        ])))
    }
}

/// `Branch.unlock` - release the paired physical locks named by the
/// client's tokens.
#[derive(Debug, Default)]
pub(crate) struct BranchUnlock;

impl Verb for BranchUnlock {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        let branch = ctx.open_branch(arg(args, 0)?)?;
        let repository = branch.repository();
        let branch_token = token_arg(args, 1)?;
        let repo_token = token_arg(args, 2)?;
        match lock_branch_pair(
            &branch,
            &repository,
            branch_token.as_deref(),
            repo_token.as_deref(),
        ) {
            Ok(_) => {}
            Err(StoreError::TokenMismatch { .. }) => {
                return Ok(Some(Response::failed(vec![Bytes::from_static(
                    b"TokenMismatch",
                )])));
            }
            Err(err) => return Err(err.into()),
        }
        if repo_token.is_some() {
            repository.dont_leave_lock_in_place();
        }
        branch.dont_leave_lock_in_place();
        branch.unlock()?;
        Ok(Some(Response::success(vec![ok()])))
    }
}

/// `Branch.break_lock` - forcibly break any physical lock on the branch
/// and its repository.
#[derive(Debug, Default)]
pub(crate) struct BranchBreakLock;

impl Verb for BranchBreakLock {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        let branch = ctx.open_branch(arg(args, 0)?)?;
        branch.break_lock()?;
        Ok(Some(Response::success(vec![ok()])))
    }
}

/// `Branch.get_physical_lock_status`.
#[derive(Debug, Default)]
pub(crate) struct BranchPhysicalLockStatus;

impl Verb for BranchPhysicalLockStatus {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        let branch = ctx.open_branch(arg(args, 0)?)?;
        let answer: &'static [u8] = if branch.get_physical_lock_status() {
            b"yes"
        } else {
            b"no"
        };
        Ok(Some(Response::success(vec![Bytes::from_static(answer)])))
    }
}

/// `Branch.last_revision_info` - the current `(revno, revision)` tip.
#[derive(Debug, Default)]
pub(crate) struct BranchLastRevisionInfo;

impl Verb for BranchLastRevisionInfo {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        let branch = ctx.open_branch(arg(args, 0)?)?;
        let (revno, revision) = branch.last_revision_info();
        Ok(Some(Response::success(vec![
            ok(),
            revno_bytes(revno),
            revision.to_bytes(),
        ])))
    }
}

/// `Branch.revision_history` - the left-hand history as a
/// NUL-separated body, oldest first.
#[derive(Debug, Default)]
pub(crate) struct BranchRevisionHistory;

impl Verb for BranchRevisionHistory {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        let branch = ctx.open_branch(arg(args, 0)?)?;
        let (_, tip) = branch.last_revision_info();
        let history = if tip.is_null() {
            Vec::new()
        } else {
            branch.repository().get_graph().left_hand_history(&tip)?
        };
        let mut body = Vec::new();
        for (i, revision) in history.iter().enumerate() {
            if i > 0 {
                body.push(0);
            }
            body.extend_from_slice(revision.as_bytes());
        }
        Ok(Some(Response::success_with_body(vec![ok()], body)))
    }
}

/// Decides a new revno for `new_tip` and moves the branch there.
fn set_tip(
    branch: &Arc<dyn Branch>,
    repository: &Arc<dyn Repository>,
    new_tip: &RevisionId,
) -> Result<(u64, RevisionId)> {
    let (last_revno, last_revision) = branch.last_revision_info();
    let graph = repository.get_graph();
    let new_revno = graph.find_distance_to_null(new_tip, &[(last_revision, last_revno)])?;
    branch.set_last_revision_info(new_revno, new_tip.clone())?;
    Ok((new_revno, new_tip.clone()))
}

/// `Branch.set_last_revision` - move the tip to a revision present in
/// the repository, with no divergence checking.
#[derive(Debug, Default)]
pub(crate) struct BranchSetLastRevision;

impl Verb for BranchSetLastRevision {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        let new_tip = RevisionId::new(arg(args, 3)?.clone());
        with_locked_branch(ctx, args, |branch, repository| {
            if new_tip.is_null() {
                branch.set_last_revision_info(0, RevisionId::null())?;
                return Ok(Response::success(vec![ok()]));
            }
            if !repository.has_revision(&new_tip) {
                return Ok(Response::failed(vec![
                    Bytes::from_static(b"NoSuchRevision"),
                    new_tip.to_bytes(),
                ]));
            }
            set_tip(branch, repository, &new_tip)?;
            Ok(Response::success(vec![ok()]))
        })
        .map(Some)
    }
}

/// `Branch.set_last_revision_info` - move the tip to a client-supplied
/// `(revno, revision)` pair.
#[derive(Debug, Default)]
pub(crate) struct BranchSetLastRevisionInfo;

impl Verb for BranchSetLastRevisionInfo {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        let revno_arg = arg(args, 3)?;
        let revno = std::str::from_utf8(revno_arg)
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or_else(|| {
                ServerError::Protocol(format!(
                    "{:?} is not a valid revision number",
                    String::from_utf8_lossy(revno_arg)
                ))
            })?;
        let new_tip = RevisionId::new(arg(args, 4)?.clone());
        with_locked_branch(ctx, args, |branch, repository| {
            if !new_tip.is_null() && !repository.has_revision(&new_tip) {
                return Ok(Response::failed(vec![
                    Bytes::from_static(b"NoSuchRevision"),
                    new_tip.to_bytes(),
                ]));
            }
            branch.set_last_revision_info(revno, new_tip.clone())?;
            Ok(Response::success(vec![ok()]))
        })
        .map(Some)
    }
}

/// `Branch.set_last_revision_ex` - tip change with divergence and
/// rewind control; answers with the resulting `(revno, revision)`.
///
/// With `allow_divergence` unset, a new tip that has diverged from the
/// current history fails with `Diverged`. With
/// `allow_overwrite_descendant` unset, a new tip that is an ancestor of
/// the current tip is a no-op answered with the unchanged tip.
#[derive(Debug, Default)]
pub(crate) struct BranchSetLastRevisionEx;

impl Verb for BranchSetLastRevisionEx {
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>> {
        let new_tip = RevisionId::new(arg(args, 3)?.clone());
        let allow_divergence = bool_arg(args, 4)?;
        let allow_overwrite_descendant = bool_arg(args, 5)?;
        with_locked_branch(ctx, args, |branch, repository| {
            if new_tip.is_null() {
                branch.set_last_revision_info(0, RevisionId::null())?;
                return Ok(Response::success(vec![
                    ok(),
                    revno_bytes(0),
                    RevisionId::null().to_bytes(),
                ]));
            }
            if !repository.has_revision(&new_tip) {
                return Ok(Response::failed(vec![
                    Bytes::from_static(b"NoSuchRevision"),
                    new_tip.to_bytes(),
                ]));
            }
            let (last_revno, last_revision) = branch.last_revision_info();
            let graph = repository.get_graph();
            if !allow_divergence || !allow_overwrite_descendant {
                let new_descends_from_tip = graph.is_ancestor(&last_revision, &new_tip);
                let tip_descends_from_new = graph.is_ancestor(&new_tip, &last_revision);
                if !allow_divergence && !new_descends_from_tip && !tip_descends_from_new {
                    return Ok(Response::failed(vec![Bytes::from_static(b"Diverged")]));
                }
                if !allow_overwrite_descendant
                    && tip_descends_from_new
                    && new_tip != last_revision
                {
                    // The tip already descends from the requested
                    // revision; leave it alone and answer with it.
                    return Ok(Response::success(vec![
                        ok(),
                        revno_bytes(last_revno),
                        last_revision.to_bytes(),
                    ]));
                }
            }
            let (new_revno, new_revision) = set_tip(branch, repository, &new_tip)?;
            Ok(Response::success(vec![
                ok(),
                revno_bytes(new_revno),
                new_revision.to_bytes(),
            ]))
        })
        .map(Some)
    }
}
