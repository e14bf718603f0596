//! The verb registry.
//!
//! Maps verb names to handler constructors, each carrying a declared
//! replay-safety class. The class is a contract for callers deciding
//! whether a request is safe to retry after a dropped connection; the
//! engine itself never enforces it.

use crate::branch::{
    BranchBreakLock, BranchLastRevisionInfo, BranchLockWrite, BranchPhysicalLockStatus,
    BranchRevisionHistory, BranchSetLastRevision, BranchSetLastRevisionEx,
    BranchSetLastRevisionInfo, BranchUnlock,
};
use crate::repository::{
    RepositoryAbortWriteGroup, RepositoryAllRevisionIds, RepositoryBreakLock,
    RepositoryCheckWriteGroup, RepositoryCommitWriteGroup, RepositoryGetParentMap,
    RepositoryGetStream, RepositoryGetStreamForMissingKeys, RepositoryHasRevision,
    RepositoryInsertStream, RepositoryInsertStreamLocked, RepositoryLockWrite,
    RepositoryPhysicalLockStatus, RepositoryStartWriteGroup, RepositoryUnlock,
};
use crate::request::{Hello, IsReadonly, Verb};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// How safe a verb is to retry if the connection drops mid-response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaySafety {
    /// Purely a read; always safe to retry.
    Read,
    /// An idempotent write: repeating it reproduces the same state.
    Idem,
    /// Not idempotent, but a blind retry does no harm (locking verbs:
    /// a retried lock either succeeds or fails with contention).
    Semi,
    /// Like `Semi`, for the virtual-filesystem verb family.
    SemiVfs,
    /// Takes a body stream that cannot be restarted once consumed.
    Stream,
    /// Replaying changes meaning (appends and the like); never retry.
    Mutate,
}

type VerbFactory = fn() -> Box<dyn Verb>;

/// One registered verb.
pub struct VerbEntry {
    safety: ReplaySafety,
    vfs: bool,
    factory: VerbFactory,
}

impl VerbEntry {
    /// The verb's declared replay-safety class.
    pub fn safety(&self) -> ReplaySafety {
        self.safety
    }

    /// True if the verb belongs to the VFS family.
    pub fn is_vfs(&self) -> bool {
        self.vfs
    }

    /// Instantiates a fresh handler for one request.
    pub fn make(&self) -> Box<dyn Verb> {
        (self.factory)()
    }
}

/// Registry of verb names to handler constructors.
#[derive(Default)]
pub struct Registry {
    verbs: HashMap<&'static str, VerbEntry>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a verb.
    pub fn register(&mut self, name: &'static str, safety: ReplaySafety, factory: VerbFactory) {
        self.verbs.insert(
            name,
            VerbEntry {
                safety,
                vfs: false,
                factory,
            },
        );
    }

    /// Registers a verb belonging to the VFS family, subject to the
    /// process-wide [`set_vfs_enabled`] toggle.
    pub fn register_vfs(&mut self, name: &'static str, safety: ReplaySafety, factory: VerbFactory) {
        self.verbs.insert(
            name,
            VerbEntry {
                safety,
                vfs: true,
                factory,
            },
        );
    }

    /// Looks up a verb by its wire name.
    pub fn get(&self, name: &[u8]) -> Option<&VerbEntry> {
        std::str::from_utf8(name)
            .ok()
            .and_then(|name| self.verbs.get(name))
    }

    /// Number of registered verbs.
    pub fn len(&self) -> usize {
        self.verbs.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.verbs.is_empty()
    }
}

static VFS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Enables or disables the whole VFS verb family. Disabled verbs fail
/// closed with a `DisabledMethod` error.
pub fn set_vfs_enabled(enabled: bool) {
    VFS_ENABLED.store(enabled, Ordering::SeqCst);
}

/// True while the VFS verb family is enabled.
pub fn vfs_enabled() -> bool {
    VFS_ENABLED.load(Ordering::SeqCst)
}

/// Builds the registry of every verb this server answers.
pub fn default_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register("hello", ReplaySafety::Read, || Box::new(Hello));
    registry.register("Transport.is_readonly", ReplaySafety::Read, || {
        Box::new(IsReadonly)
    });

    registry.register("Branch.break_lock", ReplaySafety::Idem, || {
        Box::new(BranchBreakLock)
    });
    registry.register("Branch.get_physical_lock_status", ReplaySafety::Read, || {
        Box::new(BranchPhysicalLockStatus)
    });
    registry.register("Branch.last_revision_info", ReplaySafety::Read, || {
        Box::new(BranchLastRevisionInfo)
    });
    registry.register("Branch.lock_write", ReplaySafety::Semi, || {
        Box::new(BranchLockWrite)
    });
    registry.register("Branch.revision_history", ReplaySafety::Read, || {
        Box::new(BranchRevisionHistory)
    });
    registry.register("Branch.set_last_revision", ReplaySafety::Idem, || {
        Box::new(BranchSetLastRevision)
    });
    registry.register("Branch.set_last_revision_info", ReplaySafety::Idem, || {
        Box::new(BranchSetLastRevisionInfo)
    });
    registry.register("Branch.set_last_revision_ex", ReplaySafety::Idem, || {
        Box::new(BranchSetLastRevisionEx)
    });
    registry.register("Branch.unlock", ReplaySafety::Semi, || Box::new(BranchUnlock));

    registry.register("Repository.abort_write_group", ReplaySafety::Semi, || {
        Box::new(RepositoryAbortWriteGroup)
    });
    registry.register("Repository.all_revision_ids", ReplaySafety::Read, || {
        Box::new(RepositoryAllRevisionIds)
    });
    registry.register("Repository.break_lock", ReplaySafety::Idem, || {
        Box::new(RepositoryBreakLock)
    });
    registry.register("Repository.check_write_group", ReplaySafety::Read, || {
        Box::new(RepositoryCheckWriteGroup)
    });
    registry.register("Repository.commit_write_group", ReplaySafety::Semi, || {
        Box::new(RepositoryCommitWriteGroup)
    });
    registry.register("Repository.get_parent_map", ReplaySafety::Read, || {
        Box::new(RepositoryGetParentMap::default())
    });
    registry.register(
        "Repository.get_physical_lock_status",
        ReplaySafety::Read,
        || Box::new(RepositoryPhysicalLockStatus),
    );
    registry.register("Repository.get_stream", ReplaySafety::Read, || {
        Box::new(RepositoryGetStream::default())
    });
    registry.register(
        "Repository.get_stream_for_missing_keys",
        ReplaySafety::Read,
        || Box::new(RepositoryGetStreamForMissingKeys::default()),
    );
    registry.register("Repository.has_revision", ReplaySafety::Read, || {
        Box::new(RepositoryHasRevision)
    });
    registry.register("Repository.insert_stream", ReplaySafety::Stream, || {
        Box::new(RepositoryInsertStream::default())
    });
    registry.register(
        "Repository.insert_stream_locked",
        ReplaySafety::Stream,
        || Box::new(RepositoryInsertStreamLocked::default()),
    );
    registry.register("Repository.lock_write", ReplaySafety::Semi, || {
        Box::new(RepositoryLockWrite)
    });
    registry.register("Repository.start_write_group", ReplaySafety::Semi, || {
        Box::new(RepositoryStartWriteGroup)
    });
    registry.register("Repository.unlock", ReplaySafety::Semi, || {
        Box::new(RepositoryUnlock)
    });
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_knows_core_verbs() {
        let registry = default_registry();
        for verb in [
            "hello",
            "Branch.lock_write",
            "Branch.set_last_revision_ex",
            "Repository.get_parent_map",
            "Repository.get_stream",
            "Repository.insert_stream",
            "Repository.commit_write_group",
        ] {
            assert!(registry.get(verb.as_bytes()).is_some(), "missing {verb}");
        }
        assert!(registry.get(b"Bogus.Verb").is_none());
    }

    #[test]
    fn safety_classes_match_declared_contracts() {
        let registry = default_registry();
        assert_eq!(
            registry.get(b"Repository.get_parent_map").unwrap().safety(),
            ReplaySafety::Read
        );
        assert_eq!(
            registry.get(b"Repository.insert_stream").unwrap().safety(),
            ReplaySafety::Stream
        );
        assert_eq!(
            registry.get(b"Branch.lock_write").unwrap().safety(),
            ReplaySafety::Semi
        );
    }

    #[test]
    fn vfs_flag_defaults_off_for_core_verbs() {
        let registry = default_registry();
        assert!(!registry.get(b"hello").unwrap().is_vfs());
    }
}
