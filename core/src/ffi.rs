//! Support types for the external FFI bridge.
//!
//! The bridge itself (handle allocation, JSON marshalling, callback
//! registration) lives outside the core. What the core owns is the stable
//! error-code mapping and the thread-local last-error slot that synchronous
//! calls use to report a failure without stringly-typed return values.

use std::cell::RefCell;

use crate::error::Error;

/// Success code for the FFI boundary.
pub const CODE_OK: i32 = 0;

thread_local! {
    static LAST_ERROR: RefCell<Option<Error>> = const { RefCell::new(None) };
}

/// Record `err` as the calling thread's last error and return its code.
pub fn set_last_error(err: Error) -> i32 {
    let code = err.code();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(err));
    code
}

/// Take (and clear) the calling thread's last error.
pub fn take_last_error() -> Option<Error> {
    LAST_ERROR.with(|slot| slot.borrow_mut().take())
}

/// Message of the last error without clearing it, for read-only probes.
pub fn last_error_message() -> Option<String> {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map(|e| e.to_string()))
}

/// Fold a core result into an FFI status code, stashing the error on failure.
pub fn status_of<T>(result: crate::error::Result<T>) -> i32 {
    match result {
        Ok(_) => CODE_OK,
        Err(err) => set_last_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_error_is_thread_local_and_cleared_on_take() {
        assert!(take_last_error().is_none());
        let code = set_last_error(Error::Busy("database still referenced".into()));
        assert_eq!(code, 8);
        assert_eq!(
            last_error_message().as_deref(),
            Some("busy: database still referenced")
        );
        assert!(take_last_error().is_some());
        assert!(take_last_error().is_none());
    }

    #[test]
    fn status_of_folds_results() {
        assert_eq!(status_of(Ok(())), CODE_OK);
        assert_eq!(status_of::<()>(Err(Error::NotFound("f".into()))), 4);
        take_last_error();
    }
}
