//! Byte-stream socket to the broker.
//!
//! [`BusStream`] wraps a UNIX or TCP stream and is shared by the reader and
//! writer tasks through `&self` readiness-based I/O. On UNIX sockets it
//! carries `SCM_RIGHTS` ancillary data so passed fds travel in the same
//! `sendmsg` as the first bytes of their frame.

use crate::error::{DbusError, Result};
use crate::transport::address::{parse_address, AddressEntry};
use crate::utils::timeout::with_timeout_error;
use bytes::BytesMut;
use nix::sys::socket::{
    recvmsg, sendmsg, shutdown, ControlMessage, ControlMessageOwned, MsgFlags, Shutdown,
};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use tokio::io::Interest;
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, instrument, warn};

/// Bytes read per receive call
pub const READ_CHUNK: usize = 64 * 1024;

/// Fds accepted per receive call
pub const MAX_FDS_PER_READ: usize = 32;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

#[derive(Debug)]
pub enum BusStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl From<UnixStream> for BusStream {
    fn from(stream: UnixStream) -> Self {
        BusStream::Unix(stream)
    }
}

impl From<TcpStream> for BusStream {
    fn from(stream: TcpStream) -> Self {
        BusStream::Tcp(stream)
    }
}

impl BusStream {
    /// Connect to the first reachable entry of `address`.
    #[instrument(skip_all, fields(address = %address))]
    pub async fn connect(address: &str, connect_timeout: Duration) -> Result<(Self, AddressEntry)> {
        let mut last_error = None;
        for entry in parse_address(address)? {
            match with_timeout_error(Self::connect_entry(&entry), connect_timeout).await {
                Ok(stream) => {
                    debug!(entry = %entry, "Connected to bus");
                    return Ok((stream, entry));
                }
                Err(e) => {
                    warn!(entry = %entry, error = %e, "Bus address entry failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| DbusError::InvalidAddress(address.to_owned())))
    }

    pub async fn connect_entry(entry: &AddressEntry) -> Result<Self> {
        match entry.transport() {
            "unix" => {
                if let Some(path) = entry.get("path") {
                    Ok(BusStream::Unix(UnixStream::connect(path).await?))
                } else if let Some(name) = entry.get("abstract") {
                    connect_abstract(name)
                } else {
                    Err(DbusError::InvalidAddress(entry.to_string()))
                }
            }
            "tcp" => {
                let host = entry.get("host").unwrap_or("localhost");
                let port = entry
                    .get("port")
                    .and_then(|p| p.parse::<u16>().ok())
                    .ok_or_else(|| DbusError::InvalidAddress(entry.to_string()))?;
                let stream = TcpStream::connect((host, port)).await?;
                stream.set_nodelay(true)?;
                Ok(BusStream::Tcp(stream))
            }
            other => Err(DbusError::InvalidAddress(format!(
                "unsupported transport '{other}'"
            ))),
        }
    }

    pub fn supports_fd_passing(&self) -> bool {
        matches!(self, BusStream::Unix(_))
    }

    fn raw_fd(&self) -> RawFd {
        match self {
            BusStream::Unix(s) => s.as_raw_fd(),
            BusStream::Tcp(s) => s.as_raw_fd(),
        }
    }

    /// Read at least one byte into `buf`, collecting any passed fds.
    ///
    /// Receives directly into the spare capacity of `buf`, growing it by at
    /// most [`READ_CHUNK`]. Returns 0 at end of stream.
    pub async fn read_with_fds(&self, buf: &mut BytesMut, fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
        let start = buf.len();
        buf.reserve(READ_CHUNK);
        buf.resize(start + READ_CHUNK, 0);
        let result = self.recv_into(&mut buf[start..], fds).await;
        buf.truncate(start + *result.as_ref().unwrap_or(&0));
        result
    }

    async fn recv_into(&self, chunk: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
        match self {
            BusStream::Unix(stream) => loop {
                stream.readable().await?;
                match stream.try_io(Interest::READABLE, || {
                    recv_with_fds(stream.as_raw_fd(), chunk, fds)
                }) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            },
            BusStream::Tcp(stream) => loop {
                stream.readable().await?;
                match stream.try_read(chunk) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            },
        }
    }

    /// Write `data` completely; `fds` go with the first chunk.
    pub async fn write_with_fds(&self, data: &[u8], fds: &[RawFd]) -> io::Result<()> {
        if !fds.is_empty() && !self.supports_fd_passing() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "fd passing requires a unix socket",
            ));
        }

        let mut written = 0;
        let mut pending_fds = fds;
        while written < data.len() {
            let remaining = &data[written..];
            let n = match self {
                BusStream::Unix(stream) => loop {
                    stream.writable().await?;
                    match stream.try_io(Interest::WRITABLE, || {
                        send_with_fds(stream.as_raw_fd(), remaining, pending_fds)
                    }) {
                        Ok(n) => break n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                        Err(e) => return Err(e),
                    }
                },
                BusStream::Tcp(stream) => loop {
                    stream.writable().await?;
                    match stream.try_write(remaining) {
                        Ok(n) => break n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                        Err(e) => return Err(e),
                    }
                },
            };
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            written += n;
            pending_fds = &[];
        }
        Ok(())
    }

    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        self.write_with_fds(data, &[]).await
    }

    /// Shut down both directions; wakes a reader blocked on this socket.
    pub fn shutdown(&self) -> io::Result<()> {
        match shutdown(self.raw_fd(), Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::ENOTCONN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn recv_with_fds(fd: RawFd, chunk: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
    let mut iov = [IoSliceMut::new(chunk)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_FDS_PER_READ]);
    let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_buffer), RECV_FLAGS)?;
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            for raw in received {
                // SAFETY: the kernel installed `raw` in our fd table for this message
                // and nothing else owns it.
                fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }
    Ok(msg.bytes)
}

fn send_with_fds(fd: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let iov = [IoSlice::new(data)];
    let rights = [ControlMessage::ScmRights(fds)];
    let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &rights };
    Ok(sendmsg::<()>(fd, &iov, cmsgs, SEND_FLAGS, None)?)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn connect_abstract(name: &str) -> Result<BusStream> {
    #[cfg(target_os = "android")]
    use std::os::android::net::SocketAddrExt;
    #[cfg(target_os = "linux")]
    use std::os::linux::net::SocketAddrExt;

    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
    stream.set_nonblocking(true)?;
    Ok(BusStream::Unix(UnixStream::from_std(stream)?))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn connect_abstract(name: &str) -> Result<BusStream> {
    Err(DbusError::InvalidAddress(format!(
        "abstract socket '{name}' is only supported on Linux"
    )))
}
