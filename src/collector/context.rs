//! Execution-context registry of the active session.
//!
//! Each thread holds at most one active session id. The registry is
//! thread-local, so concurrent units of work never see each other's entry
//! and no lock is involved.

use crate::utils::error::CollectorError;
use log::warn;
use std::cell::RefCell;

thread_local! {
    static CURRENT_SESSION: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Register `id` as the active session of this thread
///
/// # Errors
/// `DuplicateSession` if `id` is already the active session here. A stale
/// entry for a different id (a unit of work that never cleaned up) is
/// replaced.
pub fn register(id: &str) -> Result<(), CollectorError> {
    CURRENT_SESSION.with(|current| {
        let mut current = current.borrow_mut();
        match current.as_deref() {
            Some(active) if active == id => {
                return Err(CollectorError::DuplicateSession(id.to_string()));
            }
            Some(stale) => {
                warn!(
                    "[profiler] Replacing stale session {} with {} on this thread",
                    stale, id
                );
            }
            None => {}
        }
        *current = Some(id.to_string());
        Ok(())
    })
}

/// Clear the registry if `id` is still the active session
pub fn release(id: &str) {
    CURRENT_SESSION.with(|current| {
        let mut current = current.borrow_mut();
        if current.as_deref() == Some(id) {
            *current = None;
        }
    });
}

/// Id of the session active on this thread, if any
pub fn current() -> Option<String> {
    CURRENT_SESSION.with(|current| current.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_register_and_release() {
        register("ctx-a").unwrap();
        assert_eq!(current().as_deref(), Some("ctx-a"));
        assert_eq!(
            register("ctx-a"),
            Err(CollectorError::DuplicateSession("ctx-a".to_string()))
        );

        release("ctx-a");
        assert!(current().is_none());
    }

    #[test]
    fn test_stale_entry_is_replaced() {
        register("old").unwrap();
        register("new").unwrap();
        assert_eq!(current().as_deref(), Some("new"));

        // Releasing the stale id leaves the newer entry alone
        release("old");
        assert_eq!(current().as_deref(), Some("new"));
        release("new");
    }

    #[test]
    fn test_threads_are_isolated() {
        register("main-thread").unwrap();
        let other = thread::spawn(|| {
            let seen = current();
            register("main-thread").map(|_| seen)
        })
        .join()
        .unwrap();

        assert_eq!(other, Ok(None));
        release("main-thread");
    }
}
