//! The out-of-band control channel (§4.4): a `UnixDatagram` socketpair
//! carrying bincode-encoded [ControlMessage]s between the process manager
//! and a module, for the lifecycle commands that are not per-frame
//! (`stage`, `reset`, `terminate`). Per-frame stepping goes through the
//! frame barrier, never through this channel.
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::os::unix::net::UnixDatagram;
use std::os::unix::prelude::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;

use anyhow::anyhow;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use polling::{Event, Poller};
use serde::{Deserialize, Serialize};

use crate::error::{HermesErrorKind, HermesResult, ResultExt};

/// A lifecycle command sent from the manager to a module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlCommand {
    Stage,
    Reset,
    Terminate,
}

/// A module's reply to a [ControlCommand].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlReply {
    Ack,
    Error(String),
}

pub struct IpcSender<T> {
    socket: UnixDatagram,
    _p: PhantomData<T>,
}

pub struct IpcReceiver<T> {
    socket: UnixDatagram,
    _p: PhantomData<T>,
}

impl<T> IpcSender<T>
where
    T: Serialize,
{
    pub fn send(&self, value: &T) -> HermesResult<()> {
        let bytes = bincode::serialize(value).typ(HermesErrorKind::Protocol)?;
        self.socket.send(&bytes).typ(HermesErrorKind::Protocol)?;
        Ok(())
    }
}

impl<T> IpcReceiver<T>
where
    T: for<'de> Deserialize<'de>,
{
    /// Reads a single message, blocking until one arrives.
    pub fn recv(&self) -> HermesResult<T> {
        self.recv_timeout(None)?
            .ok_or_else(|| anyhow!("control channel closed"))
            .typ(HermesErrorKind::Protocol)
    }

    /// Reads a single message, or returns `None` if `timeout` elapses first.
    /// `None` waits forever.
    pub fn recv_timeout(&self, timeout: Option<Duration>) -> HermesResult<Option<T>> {
        let poller = Poller::new().typ(HermesErrorKind::Protocol)?;
        unsafe {
            poller
                .add(self.socket.as_raw_fd(), Event::readable(0))
                .typ(HermesErrorKind::Protocol)?;
        }

        let mut events = Vec::new();
        let n = poller.wait(&mut events, timeout).typ(HermesErrorKind::Protocol)?;
        poller.delete(&self.socket).typ(HermesErrorKind::Protocol)?;
        if n == 0 {
            return Ok(None);
        }

        let mut buffer = vec![0u8; 65507];
        let len = match self.socket.recv(&mut buffer) {
            Ok(len) => len,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(anyhow!(e)).typ(HermesErrorKind::Protocol),
        };
        bincode::deserialize(&buffer[..len])
            .map(Some)
            .typ(HermesErrorKind::Protocol)
    }
}

impl<T> AsRawFd for IpcSender<T> {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl<T> AsRawFd for IpcReceiver<T> {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl<T> IpcSender<T> {
    /// Wraps an already-open, connected datagram socket fd as a sender. Used
    /// by a spawned module process to reconstruct its end of a channel
    /// created by the parent before fork/exec and passed down as an
    /// inherited fd number.
    ///
    /// # Safety
    /// `fd` must be a valid, open `UnixDatagram` fd not owned elsewhere.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            socket: UnixDatagram::from_raw_fd(fd),
            _p: PhantomData,
        }
    }
}

impl<T> IpcReceiver<T> {
    /// # Safety
    /// `fd` must be a valid, open `UnixDatagram` fd not owned elsewhere.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            socket: UnixDatagram::from_raw_fd(fd),
            _p: PhantomData,
        }
    }
}

/// Creates a connected pair of control-channel endpoints.
pub fn channel_pair<T>() -> HermesResult<(IpcSender<T>, IpcReceiver<T>)>
where
    T: for<'de> Deserialize<'de> + Serialize,
{
    let (a, b) = socketpair(
        AddressFamily::Unix,
        SockType::Datagram,
        None,
        SockFlag::SOCK_NONBLOCK,
    )
    .map_err(|e| anyhow!(e))
    .typ(HermesErrorKind::Protocol)?;

    unsafe {
        Ok((
            IpcSender {
                socket: UnixDatagram::from_raw_fd(a),
                _p: PhantomData,
            },
            IpcReceiver {
                socket: UnixDatagram::from_raw_fd(b),
                _p: PhantomData,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_control_command() {
        let (tx, rx) = channel_pair::<ControlCommand>().unwrap();
        tx.send(&ControlCommand::Stage).unwrap();
        let received = rx.recv_timeout(Some(Duration::from_secs(1))).unwrap();
        assert!(matches!(received, Some(ControlCommand::Stage)));
    }

    #[test]
    fn recv_timeout_returns_none_when_nothing_arrives() {
        let (_tx, rx) = channel_pair::<ControlCommand>().unwrap();
        let received = rx.recv_timeout(Some(Duration::from_millis(20))).unwrap();
        assert!(received.is_none());
    }
}
