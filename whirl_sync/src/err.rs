//! Error sink
//!
//! Two severities. Configuration errors (bad arguments to an allocation or
//! setup call) are reported here and surfaced to the caller as an `Err`;
//! nothing is mutated. Usage errors (a release that does not match an
//! acquire) mean the caller's locking discipline is broken and continuing
//! would hide the bug, so they abort the process after naming the primitive
//! on stderr.

/// Report a configuration error. The caller is expected to also return a
/// failure to its own caller.
pub fn report_error(domain: &'static str, msg: &str, ctx: u64) {
    tracing::error!(domain, ctx = format_args!("{ctx:#x}"), "{msg}");
}

/// Report a usage error and abort.
pub fn usage_abort(domain: &'static str, msg: &str, addr: usize) -> ! {
    eprintln!("{domain}: {msg} ({addr:#x})");
    std::process::abort();
}
