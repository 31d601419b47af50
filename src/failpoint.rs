//! Named fault-injection points used by tests.
//!
//! A failpoint is enabled per thread with [`enable`], or process-wide through
//! the `LSTORE_FAILPOINTS` environment variable (comma separated names).

use std::cell::RefCell;
use std::collections::HashSet;
use std::io;

/// Fails every log append on the current thread.
pub const WAL_APPEND: &str = "wal.append";
/// Fails a merge after its copy phase, before the directory swap.
pub const MERGE_SWAP: &str = "merge.swap";

thread_local! {
    static FAILPOINTS: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

pub fn enable(name: &str) {
    FAILPOINTS.with(|set| {
        set.borrow_mut().insert(name.to_string());
    });
}

pub fn disable(name: &str) {
    FAILPOINTS.with(|set| {
        set.borrow_mut().remove(name);
    });
}

pub fn clear() {
    FAILPOINTS.with(|set| set.borrow_mut().clear());
}

pub fn is_enabled(name: &str) -> bool {
    if FAILPOINTS.with(|set| set.borrow().contains(name)) {
        return true;
    }

    std::env::var("LSTORE_FAILPOINTS")
        .ok()
        .map(|raw| raw.split(',').any(|v| v.trim() == name))
        .unwrap_or(false)
}

/// Returns an I/O error if `name` is enabled.
pub fn maybe_fail(name: &str) -> io::Result<()> {
    if is_enabled(name) {
        Err(io::Error::other(format!("failpoint triggered: {name}")))
    } else {
        Ok(())
    }
}
