//! Request lifecycle: verb dispatch, the per-request context, and the
//! path jail.
//!
//! One [`RequestHandler`] serves exactly one request. The protocol layer
//! feeds it `args_received`, then zero or more `accept_body` chunks, then
//! `end_received`; it exposes the response once one exists. Every handler
//! step runs inside a single boundary that installs the jail, tears it
//! down on every exit path, and converts any error into a `Failed`
//! response. Nothing escapes to the transport layer.

use crate::error::{translate_error, ServerError};
use crate::registry::{vfs_enabled, Registry};
use crate::response::Response;
use crate::Result;
use bytes::{BufMut, Bytes, BytesMut};
use keel_store::{Backend, Branch, Repository, StoreError, Transport};
use std::sync::Arc;
use tracing::{debug, trace};

/// The allowed-roots list restricting which transports a request may
/// open.
///
/// This is explicit per-request state, not ambient thread-local state:
/// every path-resolving call goes through the [`RequestContext`] that
/// owns the jail.
#[derive(Debug, Clone)]
pub struct Jail {
    roots: Vec<String>,
}

impl Jail {
    /// A jail allowing only descendants of the given roots.
    pub fn new(roots: Vec<String>) -> Self {
        Self { roots }
    }

    /// True if `base` lies under one of the allowed roots.
    pub fn allows(&self, base: &str) -> bool {
        self.roots.iter().any(|root| is_descendant(base, root))
    }
}

fn is_descendant(base: &str, root: &str) -> bool {
    if base == root {
        return true;
    }
    let root = root.trim_end_matches('/');
    match base.strip_prefix(root) {
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// Per-request state shared with the active verb: the backing transport,
/// the client path root, the jail, and the body chunk accumulator.
pub struct RequestContext {
    backend: Arc<dyn Backend>,
    transport: Arc<dyn Transport>,
    jail_root: Arc<dyn Transport>,
    root_client_path: String,
    jail: Option<Jail>,
    body_chunks: Vec<Bytes>,
}

impl RequestContext {
    /// Creates a context for one request.
    ///
    /// `root_client_path` is the client path that maps to the root of
    /// `transport`; clients cannot refer to paths above it. `jail_root`
    /// overrides the jail boundary when the request should be allowed a
    /// wider (or different) tree than the backing transport.
    pub fn new(
        backend: Arc<dyn Backend>,
        transport: Arc<dyn Transport>,
        root_client_path: &str,
        jail_root: Option<Arc<dyn Transport>>,
    ) -> Self {
        let mut root = root_client_path.to_string();
        if !root.starts_with('/') {
            root.insert(0, '/');
        }
        if !root.ends_with('/') {
            root.push('/');
        }
        Self {
            backend,
            jail_root: jail_root.unwrap_or_else(|| transport.clone()),
            transport,
            root_client_path: root,
            jail: None,
            body_chunks: Vec::new(),
        }
    }

    /// The backing transport for this request.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn setup_jail(&mut self) {
        self.jail = Some(Jail::new(vec![self.jail_root.base()]));
    }

    pub(crate) fn teardown_jail(&mut self) {
        self.jail = None;
    }

    /// Translates a client-supplied path into a relpath usable with the
    /// backing transport.
    ///
    /// All paths received from the client must be translated: the client
    /// path root is a virtual root distinct from the real one, and a path
    /// outside it fails with `PathNotChild`.
    pub fn translate_client_path(&self, client_path: &[u8]) -> Result<String> {
        let path = std::str::from_utf8(client_path)
            .map_err(|_| ServerError::Protocol("client path is not valid UTF-8".to_string()))?;
        let mut path = path.to_string();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        if format!("{path}/") == self.root_client_path {
            return Ok(".".to_string());
        }
        match path.strip_prefix(&self.root_client_path) {
            Some(rest) => {
                let relpath = join_client_path(rest).ok_or_else(|| {
                    StoreError::PathNotChild {
                        path: path.clone(),
                        base: self.root_client_path.clone(),
                    }
                })?;
                Ok(format!("./{relpath}"))
            }
            None => Err(ServerError::Store(StoreError::PathNotChild {
                path,
                base: self.root_client_path.clone(),
            })),
        }
    }

    /// Returns a transport for the location a client path refers to.
    pub fn transport_from_client_path(&self, client_path: &[u8]) -> Result<Arc<dyn Transport>> {
        let relpath = self.translate_client_path(client_path)?;
        Ok(self.transport.clone_path(&relpath)?)
    }

    /// Verifies a transport lies inside the installed jail.
    fn check_jail(&self, transport: &dyn Transport) -> Result<()> {
        if let Some(jail) = &self.jail {
            let base = transport.base();
            if !jail.allows(&base) {
                return Err(ServerError::JailBreak { path: base });
            }
        }
        Ok(())
    }

    /// Opens the repository a client path refers to, enforcing the jail.
    pub fn open_repository(&self, client_path: &[u8]) -> Result<Arc<dyn Repository>> {
        let transport = self.transport_from_client_path(client_path)?;
        self.check_jail(&*transport)?;
        Ok(self.backend.open_repository(&*transport)?)
    }

    /// Opens the branch a client path refers to, enforcing the jail.
    pub fn open_branch(&self, client_path: &[u8]) -> Result<Arc<dyn Branch>> {
        let transport = self.transport_from_client_path(client_path)?;
        self.check_jail(&*transport)?;
        Ok(self.backend.open_branch(&*transport)?)
    }

    pub(crate) fn push_chunk(&mut self, chunk: Bytes) {
        self.body_chunks.push(chunk);
    }

    pub(crate) fn take_body(&mut self) -> Bytes {
        let mut chunks = std::mem::take(&mut self.body_chunks);
        if chunks.len() == 1 {
            return chunks.pop().unwrap_or_default();
        }
        let total: usize = chunks.iter().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(total);
        for chunk in chunks {
            buf.put_slice(&chunk);
        }
        buf.freeze()
    }
}

/// Fetches a required positional argument.
pub(crate) fn required_arg<'a>(args: &'a [Bytes], index: usize) -> Result<&'a Bytes> {
    args.get(index)
        .ok_or_else(|| ServerError::Protocol(format!("missing request argument {index}")))
}

/// An optional lock token argument: absent or empty means "no token".
pub(crate) fn token_arg(args: &[Bytes], index: usize) -> Result<Option<String>> {
    match args.get(index) {
        None => Ok(None),
        Some(bytes) if bytes.is_empty() => Ok(None),
        Some(bytes) => {
            let token = std::str::from_utf8(bytes)
                .map_err(|_| ServerError::Protocol("lock token is not valid UTF-8".to_string()))?;
            Ok(Some(token.to_string()))
        }
    }
}

/// Normalizes a root-relative client path, refusing `..` escapes.
fn join_client_path(path: &str) -> Option<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    Some(segments.join("/"))
}

/// One request handler: the extension point for verbs.
///
/// `call` runs once with the request args and either returns the final
/// response or `None`, meaning a body follows: `chunk` per body chunk,
/// then `finish` for the final response. The defaults accumulate chunks
/// on the context and hand the concatenated body to `body`, which
/// refuses it - verbs that take no body get that behavior for free.
pub trait Verb: Send {
    /// Rejects the call before any work if the verb is unavailable.
    fn check_enabled(&self, _ctx: &RequestContext) -> Result<()> {
        Ok(())
    }

    /// Handles the request args; `None` means a body is expected.
    fn call(&mut self, ctx: &mut RequestContext, args: &[Bytes]) -> Result<Option<Response>>;

    /// Accepts one chunk of the request body.
    fn chunk(&mut self, ctx: &mut RequestContext, bytes: Bytes) -> Result<()> {
        ctx.push_chunk(bytes);
        Ok(())
    }

    /// Ends the body; must produce the final response.
    fn finish(&mut self, ctx: &mut RequestContext) -> Result<Response> {
        let body = ctx.take_body();
        self.body(ctx, body)
    }

    /// Handles a complete request body.
    fn body(&mut self, _ctx: &mut RequestContext, _body: Bytes) -> Result<Response> {
        Err(ServerError::Protocol(
            "request does not expect a body".to_string(),
        ))
    }
}

/// Protocol logic for one inbound request.
///
/// Does no wire encoding or decoding: it receives decoded args and body
/// chunks and produces a [`Response`], keeping the wire protocol free to
/// vary independently of the handlers.
pub struct RequestHandler {
    registry: Arc<Registry>,
    ctx: RequestContext,
    command: Option<Box<dyn Verb>>,
    response: Option<Response>,
    finished_reading: bool,
}

impl RequestHandler {
    /// Creates a handler bound to a backing transport and client root.
    pub fn new(
        registry: Arc<Registry>,
        backend: Arc<dyn Backend>,
        transport: Arc<dyn Transport>,
        root_client_path: &str,
    ) -> Self {
        Self {
            registry,
            ctx: RequestContext::new(backend, transport, root_client_path, None),
            command: None,
            response: None,
            finished_reading: true,
        }
    }

    /// The response, once one exists.
    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    /// Takes the response for delivery.
    pub fn take_response(&mut self) -> Option<Response> {
        self.response.take()
    }

    /// False while the request still expects body chunks.
    pub fn finished_reading(&self) -> bool {
        self.finished_reading
    }

    /// Dispatches the request args: `args[0]` is the verb name.
    pub fn args_received(&mut self, args: &[Bytes]) {
        let Some((verb, rest)) = args.split_first() else {
            self.fail(&ServerError::Protocol("empty request".to_string()));
            return;
        };
        let verb_name = String::from_utf8_lossy(verb).into_owned();
        let Some(entry) = self.registry.get(verb) else {
            debug!(verb = %verb_name, "unknown smart verb");
            self.fail(&ServerError::UnknownVerb(verb_name));
            return;
        };
        debug!(verb = %verb_name, args = rest.len(), "smart request");
        self.command = Some(entry.make());
        self.finished_reading = false;
        let is_vfs = entry.is_vfs();
        let rest: Vec<Bytes> = rest.to_vec();
        self.run_step(move |command, ctx| {
            if is_vfs && !vfs_enabled() {
                return Err(ServerError::DisabledVerb(verb_name));
            }
            command.check_enabled(ctx)?;
            command.call(ctx, &rest)
        });
    }

    /// Accepts one body chunk for the active command.
    pub fn accept_body(&mut self, bytes: Bytes) {
        if self.command.is_none() {
            // No active command; nothing to feed.
            return;
        }
        trace!(len = bytes.len(), "accept body chunk");
        self.run_step(|command, ctx| command.chunk(ctx, bytes).map(|()| None));
    }

    /// Signals the end of the request body.
    pub fn end_received(&mut self) {
        if self.command.is_none() {
            return;
        }
        trace!("end of body");
        self.run_step(|command, ctx| command.finish(ctx).map(Some));
    }

    /// Runs one handler step inside the jail, converting errors into a
    /// `Failed` response. The jail is torn down on every exit path.
    fn run_step<F>(&mut self, step: F)
    where
        F: FnOnce(&mut dyn Verb, &mut RequestContext) -> Result<Option<Response>>,
    {
        let Some(command) = self.command.as_mut() else {
            return;
        };
        self.ctx.setup_jail();
        let result = step(command.as_mut(), &mut self.ctx);
        self.ctx.teardown_jail();
        match result {
            Ok(None) => {}
            Ok(Some(response)) => {
                self.response = Some(response);
                self.finished_reading = true;
            }
            Err(err) => self.fail(&err),
        }
    }

    fn fail(&mut self, err: &ServerError) {
        debug!(error = %err, "request failed");
        self.response = Some(Response::failed(translate_error(err)));
        self.finished_reading = true;
    }
}

/// Answers a version probe with the highest protocol version supported.
#[derive(Debug, Default)]
pub(crate) struct Hello;

impl Verb for Hello {
    fn call(&mut self, _ctx: &mut RequestContext, _args: &[Bytes]) -> Result<Option<Response>> {
        Ok(Some(Response::success(vec![
            Bytes::from_static(b"ok"),
            Bytes::from_static(b"2"),
        ])))
    }
}

/// Reports whether the backing transport refuses writes.
#[derive(Debug, Default)]
pub(crate) struct IsReadonly;

impl Verb for IsReadonly {
    fn call(&mut self, ctx: &mut RequestContext, _args: &[Bytes]) -> Result<Option<Response>> {
        let answer: &'static [u8] = if ctx.transport().is_readonly() {
            b"yes"
        } else {
            b"no"
        };
        Ok(Some(Response::success(vec![Bytes::from_static(answer)])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_store::MemoryBackend;
    use pretty_assertions::assert_eq;

    fn context(root_client_path: &str) -> RequestContext {
        let backend = MemoryBackend::new();
        let transport = backend.root_transport();
        RequestContext::new(backend, transport, root_client_path, None)
    }

    #[test]
    fn translate_root_path() {
        let ctx = context("/");
        assert_eq!(ctx.translate_client_path(b"/").unwrap(), "./");
        // A path equal to the root (without the trailing slash) maps to
        // the transport's own location.
        let ctx = context("/exported");
        assert_eq!(ctx.translate_client_path(b"/exported").unwrap(), ".");
    }

    #[test]
    fn translate_child_path() {
        let ctx = context("/");
        assert_eq!(ctx.translate_client_path(b"/stable").unwrap(), "./stable");
        assert_eq!(ctx.translate_client_path(b"stable/sub").unwrap(), "./stable/sub");
    }

    #[test]
    fn translate_normalizes_dot_segments() {
        let ctx = context("/");
        assert_eq!(
            ctx.translate_client_path(b"/a/./b/../c").unwrap(),
            "./a/c"
        );
    }

    #[test]
    fn translate_rejects_escape() {
        let ctx = context("/");
        let err = ctx.translate_client_path(b"/..").unwrap_err();
        assert!(matches!(
            err,
            ServerError::Store(StoreError::PathNotChild { .. })
        ));
    }

    #[test]
    fn translate_rejects_path_outside_root() {
        let ctx = context("/exported/");
        let err = ctx.translate_client_path(b"/elsewhere/branch").unwrap_err();
        assert!(matches!(
            err,
            ServerError::Store(StoreError::PathNotChild { .. })
        ));
        assert_eq!(
            ctx.translate_client_path(b"/exported/branch").unwrap(),
            "./branch"
        );
    }

    #[test]
    fn jail_allows_descendants_only() {
        let jail = Jail::new(vec!["memory:///".to_string()]);
        assert!(jail.allows("memory:///branch"));
        assert!(jail.allows("memory:///"));

        let narrow = Jail::new(vec!["memory:///a".to_string()]);
        assert!(narrow.allows("memory:///a/b"));
        assert!(!narrow.allows("memory:///ab"));
        assert!(!narrow.allows("memory:///b"));
    }

    #[test]
    fn take_body_concatenates_chunks() {
        let mut ctx = context("/");
        ctx.push_chunk(Bytes::from_static(b"one"));
        ctx.push_chunk(Bytes::from_static(b"two"));
        assert_eq!(ctx.take_body().as_ref(), b"onetwo");
        assert!(ctx.take_body().is_empty());
    }
}
