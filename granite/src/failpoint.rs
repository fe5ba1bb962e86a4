//! Fault injection for tests.
//!
//! A failpoint is armed per thread through [`scoped`], or process-wide
//! through the `GRANITE_FAILPOINTS` environment variable (a comma-separated
//! list of names). An armed failpoint turns the matching `maybe_fail` call
//! site into an injected I/O error.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io;

thread_local! {
    static FAILPOINTS: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

/// Arms `name` on the current thread until the returned guard drops.
pub fn scoped(name: &str) -> FailpointGuard {
    FAILPOINTS.with(|set| {
        set.borrow_mut().insert(name.to_string());
    });
    FailpointGuard {
        name: name.to_string(),
    }
}

pub struct FailpointGuard {
    name: String,
}

impl Drop for FailpointGuard {
    fn drop(&mut self) {
        FAILPOINTS.with(|set| {
            set.borrow_mut().remove(&self.name);
        });
    }
}

pub fn is_enabled(name: &str) -> bool {
    let thread_enabled = FAILPOINTS.with(|set| set.borrow().contains(name));
    if thread_enabled {
        return true;
    }

    std::env::var("GRANITE_FAILPOINTS")
        .ok()
        .map(|raw| raw.split(',').any(|v| v.trim() == name))
        .unwrap_or(false)
}

/// Returns an injected error when the named failpoint is armed.
pub fn maybe_fail(name: &str) -> io::Result<()> {
    if is_enabled(name) {
        Err(io::Error::other(format!("failpoint triggered: {name}")))
    } else {
        Ok(())
    }
}
