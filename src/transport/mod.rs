//! Byte transports underneath the proxy protocol.
//!
//! A transport is a blocking, full-duplex byte pipe with an adjustable read
//! timeout. The proxy client never touches the device directly; it only sees
//! this trait, which is what lets the simulated link stand in for hardware.

use std::io::{self, Read, Write};
use std::time::Duration;

#[cfg(unix)]
pub mod serial;

#[cfg(unix)]
pub use serial::SerialPort;

/// A byte link to the target.
pub trait Transport: Read + Write + Send {
    /// Current read timeout.
    fn timeout(&self) -> Duration;

    /// Change the read timeout. A read that sees no data for this long fails
    /// with [`io::ErrorKind::TimedOut`].
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Open a second handle onto the same link, used by the console
    /// passthrough to read and write from different threads.
    fn try_clone(&self) -> io::Result<Box<dyn Transport>>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        (**self).set_timeout(timeout)
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        (**self).try_clone()
    }
}

