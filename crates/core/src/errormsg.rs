//! Per-thread last-error message
//!
//! Every failing public operation stores its rendered error here so callers
//! that only see a status can still report a human-readable reason.

use std::cell::RefCell;

use crate::error::Result;

thread_local! {
    static LAST_ERROR: RefCell<String> = RefCell::new(String::new());
}

/// Returns the message of the last error raised on this thread
///
/// Empty if no operation has failed on this thread yet.
pub fn errormsg() -> String {
    LAST_ERROR.with(|m| m.borrow().clone())
}

/// Overwrites this thread's last-error message
pub fn set_errormsg(msg: impl Into<String>) {
    let msg = msg.into();
    LAST_ERROR.with(|m| *m.borrow_mut() = msg);
}

/// Records the error of a failed result as the last-error message
pub fn record_error<T>(result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        set_errormsg(e.to_string());
    }
    result
}
