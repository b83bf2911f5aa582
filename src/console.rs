//! Interactive console passthrough after the handoff.
//!
//! Once the kernel owns the target, the serial link stops carrying proxy
//! frames and becomes a plain console. Output from the link is copied to the
//! local terminal on a background thread; keystrokes are copied to the link on
//! the calling thread. `Ctrl-]` or end of input closes the console.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Byte that ends the passthrough (`Ctrl-]`).
pub const ESCAPE: u8 = 0x1d;

/// Copy bytes between the link and a local terminal until `input` ends or the
/// escape byte is typed.
pub fn passthrough<T, R, W>(link: &mut T, mut input: R, mut output: W) -> Result<()>
where
    T: Transport + ?Sized,
    R: Read,
    W: Write + Send + 'static,
{
    let mut rx = link.try_clone()?;
    let stop = Arc::new(AtomicBool::new(false));
    let stop_rx = stop.clone();

    let pump = thread::spawn(move || -> io::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            match rx.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    output.write_all(&buf[..n])?;
                    output.flush()?;
                }
                // A quiet link only ends the console once input is done.
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    if stop_rx.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    });

    let mut buf = [0u8; 256];
    let forwarded: io::Result<()> = loop {
        let n = match input.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(e),
        };

        let (chunk, escaped) = match buf[..n].iter().position(|&b| b == ESCAPE) {
            Some(pos) => (&buf[..pos], true),
            None => (&buf[..n], false),
        };

        if let Err(e) = link.write_all(chunk).and_then(|_| link.flush()) {
            break Err(e);
        }
        if escaped {
            break Ok(());
        }
    };

    stop.store(true, Ordering::SeqCst);
    let pumped = pump
        .join()
        .map_err(|_| Error::Protocol("console reader thread panicked".into()))?;

    forwarded?;
    pumped?;
    Ok(())
}

/// Puts stdin into non-canonical, no-echo mode for the lifetime of the guard.
///
/// Does nothing when stdin is not a terminal.
pub struct RawTerminal {
    #[cfg(unix)]
    saved: Option<libc::termios>,
}

impl RawTerminal {
    #[cfg(unix)]
    pub fn enable() -> Self {
        use std::os::unix::io::AsRawFd;

        let fd = io::stdin().as_raw_fd();

        // SAFETY: termios is plain data and fd is stdin for the whole block.
        let saved = unsafe {
            if libc::isatty(fd) == 0 {
                log::debug!("stdin is not a TTY, leaving terminal mode alone");
                None
            } else {
                let mut termios: libc::termios = std::mem::zeroed();
                if libc::tcgetattr(fd, &mut termios) != 0 {
                    log::warn!("failed to get terminal attributes, console stays cooked");
                    None
                } else {
                    let original = termios;
                    termios.c_lflag &= !(libc::ICANON | libc::ECHO);
                    termios.c_cc[libc::VMIN] = 1;
                    termios.c_cc[libc::VTIME] = 0;
                    if libc::tcsetattr(fd, libc::TCSANOW, &termios) != 0 {
                        log::warn!("failed to set terminal attributes, console stays cooked");
                        None
                    } else {
                        Some(original)
                    }
                }
            }
        };

        Self { saved }
    }

    #[cfg(not(unix))]
    pub fn enable() -> Self {
        Self {}
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(termios) = self.saved.take() {
            use std::os::unix::io::AsRawFd;
            // SAFETY: restoring attributes captured from the same fd.
            unsafe {
                libc::tcsetattr(io::stdin().as_raw_fd(), libc::TCSANOW, &termios);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimLink, SimTarget};
    use std::io::Cursor;
    use std::sync::Mutex;

    /// Output sink shared with the test body.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn booted_link() -> SimLink {
        let mut target = SimTarget::new();
        target.set_console_output(b"Booting Linux on physical CPU 0x0\n".to_vec());
        let mut link = SimLink::new(target);
        link.target().force_booted(0x0820_0000);
        link
    }

    #[test]
    fn test_output_reaches_terminal() {
        let mut link = booted_link();
        let captured = Captured::default();

        passthrough(&mut link, Cursor::new(Vec::new()), captured.clone()).unwrap();

        let out = captured.0.lock().unwrap().clone();
        assert_eq!(out, b"Booting Linux on physical CPU 0x0\n");
    }

    #[test]
    fn test_input_stops_at_escape() {
        let mut link = booted_link();
        let input = Cursor::new(b"ls\r\x1dnot sent".to_vec());

        passthrough(&mut link, input, Captured::default()).unwrap();

        assert_eq!(link.target().console_input(), b"ls\r");
    }
}
