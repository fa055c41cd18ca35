//! Portable socket layer.
//!
//! `NetSocket` wraps a single OS socket in client, server or listener role
//! over either the Unix or the Internet domain. The option helpers in `opts`
//! work on any descriptor, not just ones owned by a `NetSocket`.

mod opts;
mod socket;

use std::io;
use std::ops::{BitOr, BitOrAssign};

use tracing::error;

pub use opts::{get_window, set_opts, set_window};
pub use socket::{numeric_name, NetSocket, SocketDomain};

/// Destination for socket diagnostics.
///
/// A socket without a sink reports failures through return values only.
pub trait ErrorSink: Send + Sync {
    fn report(&self, context: &str, error: &io::Error);
}

/// Sink that forwards diagnostics to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, context: &str, err: &io::Error) {
        error!(context, error = %err, errno = err.raw_os_error().unwrap_or(0), "Socket error");
    }
}

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $bit:expr;)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(u32);

        #[allow(dead_code)]
        impl $name {
            pub const NONE: $name = $name(0);
            $($(#[$fmeta])* pub const $flag: $name = $name($bit);)*

            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn is_empty(self) -> bool {
                self.0 == 0
            }
        }

        impl BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0;
            }
        }
    };
}

flag_set! {
    /// Low-level tuning options applied by [`set_opts`]. Unset flags keep the
    /// OS default.
    SockOpts {
        REUSEADDR = 0x01;
        KEEPALIVE = 0x02;
        /// TCP only; skipped on Unix-domain descriptors.
        NODELAY = 0x04;
        /// Close immediately instead of lingering on unsent data.
        NOLINGER = 0x08;
        NONBLOCK = 0x10;
    }
}

flag_set! {
    /// Role and transport selection for [`NetSocket::open`].
    OpenFlags {
        SERVER = 0x0100;
        UDP = 0x0200;
        KEEPALIVE = 0x0400;
        NODELAY = 0x0800;
        NOLINGER = 0x1000;
    }
}

impl OpenFlags {
    /// The tuning subset of these flags, expressed as socket options.
    pub fn sock_opts(self) -> SockOpts {
        let mut opts = SockOpts::NONE;
        if self.contains(OpenFlags::KEEPALIVE) {
            opts |= SockOpts::KEEPALIVE;
        }
        if self.contains(OpenFlags::NODELAY) {
            opts |= SockOpts::NODELAY;
        }
        if self.contains(OpenFlags::NOLINGER) {
            opts |= SockOpts::NOLINGER;
        }
        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_set_operations() {
        let opts = SockOpts::KEEPALIVE | SockOpts::NODELAY;
        assert!(opts.contains(SockOpts::KEEPALIVE));
        assert!(opts.contains(SockOpts::NODELAY));
        assert!(!opts.contains(SockOpts::NOLINGER));
        assert!(SockOpts::NONE.is_empty());
    }

    #[test]
    fn test_open_flags_map_to_sock_opts() {
        let flags = OpenFlags::SERVER | OpenFlags::NODELAY | OpenFlags::NOLINGER;
        assert_eq!(flags.sock_opts(), SockOpts::NODELAY | SockOpts::NOLINGER);
        assert!(OpenFlags::SERVER.sock_opts().is_empty());
    }
}
