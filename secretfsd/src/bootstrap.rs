//! Process hardening applied at daemon startup, before any secret is
//! fetched.
//!
//! Both operations are best-effort: a failure is logged and the daemon
//! continues.
//!
//! 1. `PR_SET_DUMPABLE 0` — disables core dumps and `/proc/<pid>/mem` reads
//!    by non-root processes, so secret bodies cannot land on disk via a
//!    crash dump.
//! 2. `mlockall(MCL_CURRENT | MCL_FUTURE)` — pins memory so pages holding
//!    secrets are never swapped out. Requires `CAP_IPC_LOCK`; skipped with
//!    `--disable-mlock`.

#[cfg(unix)]
pub fn harden(disable_mlock: bool) {
    set_not_dumpable();
    if disable_mlock {
        tracing::warn!("memory locking disabled; secret pages may be swapped to disk");
    } else {
        lock_memory();
    }
}

#[cfg(not(unix))]
pub fn harden(_disable_mlock: bool) {}

#[cfg(unix)]
fn set_not_dumpable() {
    // SAFETY: prctl with PR_SET_DUMPABLE and integer arguments is safe.
    let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0i64, 0i64, 0i64, 0i64) };
    if ret == 0 {
        tracing::debug!("PR_SET_DUMPABLE=0: core dumps disabled");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("PR_SET_DUMPABLE=0 failed (non-fatal): {err}");
    }
}

#[cfg(unix)]
fn lock_memory() {
    // SAFETY: mlockall takes no pointers; failure is reported via errno.
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if ret == 0 {
        tracing::debug!("mlockall: memory pages locked in RAM");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("mlockall failed (daemon continues without memory locking): {err}");
    }
}
