//! Socket stream and readiness wait.
//!
//! - Unix: Unix Domain Socket (local displays)
//! - TCP: `6000 + display` on a remote host
//!
//! All I/O goes through `&Stream`, so the connection can share one stream
//! between the thread blocked in [`Stream::poll_ready`] and threads reading
//! non-blockingly under the connection lock.
//!
//! # Example
//!
//! ```no_run
//! use xwire_client::transport::Stream;
//!
//! let stream = Stream::connect_unix("/tmp/.X11-unix/X0")?;
//! stream.set_nonblocking(true)?;
//! # Ok::<(), xwire_client::XwireError>(())
//! ```

use std::io::{self, IoSlice, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::error::Result;

/// Which directions a readiness wait reported as ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Data (or end of stream) can be read.
    pub readable: bool,
    /// The socket accepts more output.
    pub writable: bool,
}

/// A connected byte stream to the server.
#[derive(Debug)]
pub enum Stream {
    /// Unix domain socket.
    Unix(UnixStream),
    /// TCP socket.
    Tcp(TcpStream),
}

impl Stream {
    /// Connect to a Unix domain socket path.
    pub fn connect_unix(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Stream::Unix(UnixStream::connect(path)?))
    }

    /// Connect to a TCP host and port.
    pub fn connect_tcp(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        Ok(Stream::Tcp(stream))
    }

    /// Adopt an already connected socket.
    ///
    /// The descriptor is marked close-on-exec.
    pub fn from_owned_fd(fd: OwnedFd) -> Result<Self> {
        set_cloexec(fd.as_raw_fd())?;
        Ok(Stream::Unix(UnixStream::from(fd)))
    }

    /// Switch the socket between blocking and non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.set_nonblocking(nonblocking),
            Stream::Tcp(s) => s.set_nonblocking(nonblocking),
        }
    }

    /// Read into `buf`.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => (&*s).read(buf),
            Stream::Tcp(s) => (&*s).read(buf),
        }
    }

    /// Read exactly `buf.len()` bytes (blocking mode only).
    pub fn read_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        match self {
            Stream::Unix(s) => (&*s).read_exact(buf),
            Stream::Tcp(s) => (&*s).read_exact(buf),
        }
    }

    /// Gathered write of `bufs`.
    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => (&*s).write_vectored(bufs),
            Stream::Tcp(s) => (&*s).write_vectored(bufs),
        }
    }

    /// Write all of `buf` (blocking mode only).
    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        match self {
            Stream::Unix(s) => (&*s).write_all(buf),
            Stream::Tcp(s) => (&*s).write_all(buf),
        }
    }

    /// Block until the socket is readable, or writable when `want_write`.
    ///
    /// Retries on `EINTR`. Error conditions reported by the kernel fail the
    /// wait; a hangup counts as readable so the next read observes the end
    /// of stream.
    pub fn poll_ready(&self, want_read: bool, want_write: bool) -> io::Result<Readiness> {
        let mut events: libc::c_short = 0;
        if want_read {
            events |= libc::POLLIN;
        }
        if want_write {
            events |= libc::POLLOUT;
        }
        let mut poll_fd = libc::pollfd {
            fd: self.as_raw_fd(),
            events,
            revents: 0,
        };

        loop {
            // Safety: pointer references a valid pollfd for exactly one entry.
            let rc = unsafe { libc::poll(&mut poll_fd as *mut libc::pollfd, 1, -1) };
            if rc >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }

        let revents = poll_fd.revents;
        if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("poll reported revents {:#x}", revents),
            ));
        }
        Ok(Readiness {
            readable: revents & (libc::POLLIN | libc::POLLHUP) != 0,
            writable: revents & libc::POLLOUT != 0,
        })
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Unix(s) => s.as_raw_fd(),
            Stream::Tcp(s) => s.as_raw_fd(),
        }
    }
}

impl From<UnixStream> for Stream {
    fn from(stream: UnixStream) -> Self {
        Stream::Unix(stream)
    }
}

impl From<TcpStream> for Stream {
    fn from(stream: TcpStream) -> Self {
        Stream::Tcp(stream)
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // Safety: `fcntl` is called with valid command constants and a live fd.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: `fcntl` is called with valid command constants and bitflags.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
