//! Host support check for userfaultfd.
//!
//! Postcopy needs the destination to trap faults on not-yet-migrated pages,
//! which QEMU does through userfaultfd. Hosts without it cannot run the test
//! at all, so the run is skipped rather than failed.

use std::fmt;

const UFFDIO_REGISTER_NR: u64 = 0x00;
const UFFDIO_UNREGISTER_NR: u64 = 0x01;

/// ioctls that must be advertised after the API handshake.
pub const REQUIRED_IOCTLS: u64 = (1 << UFFDIO_REGISTER_NR) | (1 << UFFDIO_UNREGISTER_NR);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Support {
    Supported,
    /// The userfaultfd syscall failed (errno).
    Unavailable(i32),
    /// `UFFDIO_API` was rejected (errno).
    ApiHandshakeFailed(i32),
    MissingIoctls { ioctls: u64 },
    UnsupportedPlatform,
}

impl Support {
    pub fn is_supported(&self) -> bool {
        matches!(self, Support::Supported)
    }
}

impl fmt::Display for Support {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Support::Supported => write!(f, "userfaultfd available"),
            Support::Unavailable(errno) => write!(
                f,
                "userfaultfd not available: {}",
                std::io::Error::from_raw_os_error(*errno)
            ),
            Support::ApiHandshakeFailed(errno) => write!(
                f,
                "UFFDIO_API failed: {}",
                std::io::Error::from_raw_os_error(*errno)
            ),
            Support::MissingIoctls { ioctls } => write!(
                f,
                "missing userfault register/unregister support (ioctls 0x{:x})",
                ioctls
            ),
            Support::UnsupportedPlatform => {
                write!(f, "userfaultfd is not available on this platform")
            }
        }
    }
}

/// Classify the `ioctls` mask returned by the API handshake.
pub fn check_ioctls(ioctls: u64) -> Support {
    if ioctls & REQUIRED_IOCTLS == REQUIRED_IOCTLS {
        Support::Supported
    } else {
        Support::MissingIoctls { ioctls }
    }
}

pub fn is_supported() -> bool {
    probe().is_supported()
}

#[cfg(target_os = "linux")]
pub fn probe() -> Support {
    linux::probe()
}

#[cfg(not(target_os = "linux"))]
pub fn probe() -> Support {
    Support::UnsupportedPlatform
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{Support, check_ioctls};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    const UFFD_API: u64 = 0xAA;
    // _IOWR(0xAA, 0x3F, struct uffdio_api)
    const UFFDIO_API: u64 = 0xc018_aa3f;

    #[repr(C)]
    #[derive(Default)]
    struct UffdioApi {
        api: u64,
        features: u64,
        ioctls: u64,
    }

    fn last_errno() -> i32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }

    pub(super) fn probe() -> Support {
        let raw = unsafe { libc::syscall(libc::SYS_userfaultfd, libc::O_CLOEXEC) };
        if raw < 0 {
            return Support::Unavailable(last_errno());
        }
        // SAFETY: the syscall just returned this descriptor and nothing else owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(raw as RawFd) };

        let mut api = UffdioApi {
            api: UFFD_API,
            ..Default::default()
        };
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), UFFDIO_API as _, &mut api as *mut UffdioApi) };
        if ret != 0 {
            return Support::ApiHandshakeFailed(last_errno());
        }

        check_ioctls(api.ioctls)
    }
}
