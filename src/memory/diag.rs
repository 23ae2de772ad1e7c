//! Per-thread record of the most recent VM failure.
//!
//! Every fallible public operation also returns the error; the buffer exists
//! so callers that only keep a boolean outcome can still fetch the message.

use std::cell::RefCell;

use crate::memory::vm::VmError;

crate::sync::thread_local! {
    static LAST_ERROR: RefCell<String> = RefCell::new(String::new());
}

/// Overwrite this thread's last-error message with `err`.
pub(crate) fn record(err: &VmError) {
    LAST_ERROR.with(|buf| {
        *buf.borrow_mut() = err.to_string();
    });
}

/// Message of the most recent failure on the calling thread, or an empty
/// string if nothing failed since the last [`clear_last_error`].
#[must_use]
pub fn last_error_message() -> String {
    LAST_ERROR.with(|buf| buf.borrow().clone())
}

pub fn clear_last_error() {
    LAST_ERROR.with(|buf| buf.borrow_mut().clear());
}
