//! System user/group resolution for socket and mount ownership flags.

use std::ffi::CString;

use anyhow::{bail, Context as _};

/// Resolve a user name or numeric id. An empty spec means the current user.
pub fn resolve_user(spec: &str) -> anyhow::Result<u32> {
    if spec.is_empty() {
        // SAFETY: getuid never fails.
        return Ok(unsafe { libc::getuid() });
    }
    if let Ok(id) = spec.parse::<u32>() {
        return Ok(id);
    }
    let cname = CString::new(spec).context("user name contains NUL")?;
    // SAFETY: cname is a valid NUL-terminated string; the returned passwd
    // record is only read before any other libc user-database call.
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        bail!("unable to find user {spec}");
    }
    Ok(unsafe { (*pw).pw_uid })
}

/// Resolve a group name or numeric id. An empty spec means the current
/// group.
pub fn resolve_group(spec: &str) -> anyhow::Result<u32> {
    if spec.is_empty() {
        // SAFETY: getgid never fails.
        return Ok(unsafe { libc::getgid() });
    }
    if let Ok(id) = spec.parse::<u32>() {
        return Ok(id);
    }
    let cname = CString::new(spec).context("group name contains NUL")?;
    // SAFETY: cname is a valid NUL-terminated string; the returned group
    // record is only read before any other libc group-database call.
    let gr = unsafe { libc::getgrnam(cname.as_ptr()) };
    if gr.is_null() {
        bail!("unable to find group {spec}");
    }
    Ok(unsafe { (*gr).gr_gid })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ids_pass_through() {
        assert_eq!(resolve_user("1000").unwrap(), 1000);
        assert_eq!(resolve_group("984").unwrap(), 984);
    }

    #[test]
    fn empty_spec_is_current_identity() {
        assert_eq!(resolve_user("").unwrap(), unsafe { libc::getuid() });
        assert_eq!(resolve_group("").unwrap(), unsafe { libc::getgid() });
    }

    #[test]
    fn root_resolves_by_name() {
        assert_eq!(resolve_user("root").unwrap(), 0);
    }

    #[test]
    fn unknown_name_fails() {
        assert!(resolve_user("no-such-user-secretfs").is_err());
        assert!(resolve_group("no-such-group-secretfs").is_err());
    }
}
