//! POSIX-style errno codes used on the wire (hello failures, synthetic
//! responses for lost peers, ENOSYS for unreachable rank 0, ...).
//!
//! These mirror `libc`'s values directly rather than inventing a parallel
//! numbering scheme, since the overlay's errors ultimately surface to the
//! same callers that see real system errno values elsewhere in the broker.

/// No such function (used when a request addressed to rank 0 / NODEID_ANY
/// has no local handler and there is no parent to forward it to).
pub const ENOSYS: i32 = libc::ENOSYS;
/// Destination unreachable (peer lost, or request routed toward an
/// offline/unknown child).
pub const EHOSTUNREACH: i32 = libc::EHOSTUNREACH;
/// Invalid argument (bad cert, bad topology construction, ...).
pub const EINVAL: i32 = libc::EINVAL;
/// Protocol error (malformed hello, version mismatch, hostname mismatch).
pub const EPROTO: i32 = libc::EPROTO;
/// Permission denied (cert file readable by group/other).
pub const EPERM: i32 = libc::EPERM;

/// Render an errno as `"<name> (<errno>): <message>"`, the way the overlay's
/// hello-error and EHOSTUNREACH payload strings read on the wire.
pub fn describe(errno: i32, message: &str) -> String {
    let name = match errno {
        x if x == ENOSYS => "ENOSYS",
        x if x == EHOSTUNREACH => "EHOSTUNREACH",
        x if x == EINVAL => "EINVAL",
        x if x == EPROTO => "EPROTO",
        x if x == EPERM => "EPERM",
        _ => "EUNKNOWN",
    };
    format!("{name} ({errno}): {message}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_known_errno() {
        let s = describe(EHOSTUNREACH, "lost connection");
        assert!(s.starts_with("EHOSTUNREACH"));
        assert!(s.contains("lost connection"));
    }
}
