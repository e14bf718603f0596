//! Token-based write locks.
//!
//! A [`TokenLock`] models one lockable resource. The physical lock is
//! identified by an opaque token and can outlive the in-process lock
//! count: a client acquires the lock in one RPC, holds the token across
//! the connection, and presents it again in later RPCs. In-process, the
//! lock is a plain reentrant count.

use crate::{Result, StoreError};
use parking_lot::Mutex;
use uuid::Uuid;

#[derive(Debug, Default)]
struct LockState {
    /// Token of the physical lock, if one is held.
    holder: Option<String>,
    /// In-process acquisition count.
    refs: usize,
    /// Whether the final in-process unlock releases the physical lock.
    owns: bool,
}

/// A write lock identified by an opaque token.
#[derive(Debug)]
pub struct TokenLock {
    name: String,
    state: Mutex<LockState>,
}

impl TokenLock {
    /// Creates an unlocked lock; `name` appears in diagnostics.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(LockState::default()),
        }
    }

    /// Acquires the lock.
    ///
    /// Without a token, a fresh physical lock is taken and its new token
    /// returned; if another client holds the lock this fails with
    /// [`StoreError::LockContention`]. With a token, the token must match
    /// the live physical lock ([`StoreError::TokenMismatch`] otherwise);
    /// the physical lock is then left in place when the matching unlock
    /// happens, since the client owns it durably.
    ///
    /// Nested in-process acquisition is allowed and counted.
    pub fn lock_write(&self, token: Option<&str>) -> Result<String> {
        let mut state = self.state.lock();
        match token {
            Some(given) => match &state.holder {
                Some(holder) if holder == given => {
                    state.refs += 1;
                    Ok(given.to_string())
                }
                Some(holder) => Err(StoreError::TokenMismatch {
                    given: given.to_string(),
                    lock: holder.clone(),
                }),
                None => Err(StoreError::TokenMismatch {
                    given: given.to_string(),
                    lock: String::new(),
                }),
            },
            None => {
                if state.refs > 0 {
                    state.refs += 1;
                    return Ok(state.holder.clone().unwrap_or_default());
                }
                if state.holder.is_some() {
                    return Err(StoreError::LockContention {
                        lock: self.name.clone(),
                    });
                }
                let token = Uuid::new_v4().simple().to_string();
                state.holder = Some(token.clone());
                state.refs = 1;
                state.owns = true;
                Ok(token)
            }
        }
    }

    /// Releases one in-process acquisition. The physical lock is dropped
    /// on the final release only if this process owns it (fresh acquire,
    /// or [`dont_leave_in_place`](Self::dont_leave_in_place)).
    pub fn unlock(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.refs == 0 {
            return Err(StoreError::NotLocked);
        }
        state.refs -= 1;
        if state.refs == 0 && state.owns {
            state.holder = None;
            state.owns = false;
        }
        Ok(())
    }

    /// Keeps the physical lock in place across the final unlock.
    pub fn leave_in_place(&self) {
        self.state.lock().owns = false;
    }

    /// Releases the physical lock on the final unlock.
    pub fn dont_leave_in_place(&self) {
        self.state.lock().owns = true;
    }

    /// Forcibly discards the physical lock and all in-process state.
    pub fn break_lock(&self) {
        let mut state = self.state.lock();
        state.holder = None;
        state.refs = 0;
        state.owns = false;
    }

    /// True while the physical lock is held.
    pub fn is_physically_locked(&self) -> bool {
        self.state.lock().holder.is_some()
    }

    /// True while any in-process acquisition is outstanding.
    pub fn is_locked(&self) -> bool {
        self.state.lock().refs > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_acquire_returns_token() {
        let lock = TokenLock::new("test lock");
        let token = lock.lock_write(None).unwrap();
        assert!(!token.is_empty());
        assert!(lock.is_locked());
        lock.unlock().unwrap();
        assert!(!lock.is_physically_locked());
    }

    #[test]
    fn contention_when_physically_held() {
        let lock = TokenLock::new("test lock");
        lock.lock_write(None).unwrap();
        lock.leave_in_place();
        lock.unlock().unwrap();
        // Physical lock remains; a tokenless acquire must contend.
        let err = lock.lock_write(None).unwrap_err();
        assert!(matches!(err, StoreError::LockContention { .. }));
    }

    #[test]
    fn token_mismatch_leaves_state_unchanged() {
        let lock = TokenLock::new("test lock");
        let token = lock.lock_write(None).unwrap();
        let err = lock.lock_write(Some("bogus")).unwrap_err();
        assert!(matches!(err, StoreError::TokenMismatch { .. }));
        // Still locked with the original token.
        lock.lock_write(Some(&token)).unwrap();
        lock.unlock().unwrap();
        lock.unlock().unwrap();
    }

    #[test]
    fn token_mismatch_when_unlocked() {
        let lock = TokenLock::new("test lock");
        let err = lock.lock_write(Some("anything")).unwrap_err();
        assert!(matches!(err, StoreError::TokenMismatch { .. }));
    }

    #[test]
    fn relock_with_token_leaves_physical_lock() {
        let lock = TokenLock::new("test lock");
        let token = lock.lock_write(None).unwrap();
        lock.leave_in_place();
        lock.unlock().unwrap();

        // A later request validates the token and unlocks again; the
        // physical lock stays because the client owns it.
        lock.lock_write(Some(&token)).unwrap();
        lock.unlock().unwrap();
        assert!(lock.is_physically_locked());

        // Until it is explicitly released.
        lock.lock_write(Some(&token)).unwrap();
        lock.dont_leave_in_place();
        lock.unlock().unwrap();
        assert!(!lock.is_physically_locked());
    }

    #[test]
    fn nested_acquire_is_counted() {
        let lock = TokenLock::new("test lock");
        let token = lock.lock_write(None).unwrap();
        let again = lock.lock_write(None).unwrap();
        assert_eq!(token, again);
        lock.unlock().unwrap();
        assert!(lock.is_physically_locked());
        lock.unlock().unwrap();
        assert!(!lock.is_physically_locked());
    }

    #[test]
    fn unlock_without_lock_is_an_error() {
        let lock = TokenLock::new("test lock");
        assert!(matches!(lock.unlock(), Err(StoreError::NotLocked)));
    }

    #[test]
    fn break_lock_discards_everything() {
        let lock = TokenLock::new("test lock");
        lock.lock_write(None).unwrap();
        lock.break_lock();
        assert!(!lock.is_physically_locked());
        assert!(!lock.is_locked());
        // Breaking an unlocked lock is fine.
        lock.break_lock();
    }
}
