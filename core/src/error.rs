use thiserror::Error;

/// The error taxonomy this crate surfaces. One variant per failure kind;
/// lower-level errors are wrapped rather than flattened so callers can
/// still match on `#[from]`'s source via [`std::error::Error::source`].
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("missing network-admin capability: {0}")]
    KernelPermission(std::io::Error),

    #[error("kernel resource conflict: {0}")]
    KernelConflict(std::io::Error),

    #[error("kernel resource absent: {0}")]
    KernelAbsent(std::io::Error),

    #[error("kernel error: {0}")]
    KernelUnknown(std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("address space exhausted")]
    Exhausted,

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        classify_io_error(err)
    }
}

/// Classifies a kernel-facing I/O error into the taxonomy's kernel-* kinds
/// by pattern-matching on the underlying OS error, the same way the
/// wire-protocol errors from netlink round-trips surface as plain
/// `std::io::Error`s with the kernel's `errno` attached.
pub fn classify_io_error(err: std::io::Error) -> CoreError {
    use std::io::ErrorKind;

    match err.raw_os_error() {
        Some(libc::EPERM) | Some(libc::EACCES) => CoreError::KernelPermission(err),
        Some(libc::EEXIST) | Some(libc::EBUSY) | Some(libc::EADDRINUSE) => {
            CoreError::KernelConflict(err)
        },
        Some(libc::ENODEV) | Some(libc::ENOENT) => CoreError::KernelAbsent(err),
        _ => match err.kind() {
            ErrorKind::AlreadyExists => CoreError::KernelConflict(err),
            ErrorKind::NotFound => CoreError::KernelAbsent(err),
            ErrorKind::PermissionDenied => CoreError::KernelPermission(err),
            _ => CoreError::KernelUnknown(err),
        },
    }
}

/// A short, human-facing hint appended to kernel errors, derived from the
/// underlying message rather than a structured error code, since that's
/// all the kernel gives us back over netlink.
pub fn actionable_hint(err: &CoreError) -> Option<&'static str> {
    let message = err.to_string();
    if message.contains("not permitted") || matches!(err, CoreError::KernelPermission(_)) {
        Some("missing network-admin capability — check service unit")
    } else if message.contains("already exists") || matches!(err, CoreError::KernelConflict(_)) {
        Some("resource already present — a previous reconcile pass may not have converged")
    } else if matches!(err, CoreError::KernelAbsent(_)) {
        Some("interface or module absent — is the WireGuard kernel module loaded?")
    } else {
        None
    }
}
