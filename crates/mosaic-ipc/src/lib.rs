//! Mosaic IPC Protocol
//!
//! The privileged channel between the `mosaic` compositor and its remote
//! clients. It hands GPU buffer descriptors across process boundaries,
//! keyed by a numeric surface id, without copying pixel data.

pub mod exchange_proto;

use exchange_proto::{Direction, ExchangeHeader, MAX_DESCRIPTORS};
use nix::sys::socket::{
    self, AddressFamily, Backlog, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag,
    SockType, UnixAddr,
};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Socket path for the privileged channel
pub fn socket_path(name: &str) -> PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/run/user/{}", unsafe { libc::getuid() }));
    PathBuf::from(runtime_dir).join(name)
}

/// Errors raised by the wire layer
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),
    #[error("unknown direction {0}")]
    UnknownDirection(u32),
    #[error("truncated message ({0} bytes)")]
    Truncated(usize),
    #[error("{0} descriptors exceed the per-message limit")]
    TooManyDescriptors(usize),
    #[error("offer without descriptors")]
    EmptyOffer,
    #[error("header announces {announced} descriptors, {received} received")]
    DescriptorMismatch { announced: usize, received: usize },
    #[error("unexpected reply {direction:?} for id {id}")]
    UnexpectedReply { direction: Direction, id: u32 },
    #[error("connection closed by peer")]
    Closed,
    #[error(transparent)]
    Os(#[from] nix::errno::Errno),
}

// ============================================================================
// Messages
// ============================================================================

/// A decoded message with the descriptors it carried
#[derive(Debug)]
pub struct Message {
    pub direction: Direction,
    pub id: u32,
    pub fds: Vec<OwnedFd>,
}

/// Send one message, attaching `fds` as SCM_RIGHTS ancillary data
pub fn send(
    socket: BorrowedFd<'_>,
    direction: Direction,
    id: u32,
    fds: &[BorrowedFd<'_>],
) -> Result<(), ProtocolError> {
    if fds.len() > MAX_DESCRIPTORS {
        return Err(ProtocolError::TooManyDescriptors(fds.len()));
    }

    let header = ExchangeHeader::new(direction, id, fds.len() as u32);
    let iov = [IoSlice::new(bytemuck::bytes_of(&header))];

    let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let cmsgs = if raw.is_empty() {
        vec![]
    } else {
        vec![ControlMessage::ScmRights(&raw)]
    };

    socket::sendmsg::<UnixAddr>(
        socket.as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::MSG_NOSIGNAL,
        None,
    )?;

    trace!("Sent {:?} for id {} with {} fds", direction, id, raw.len());
    Ok(())
}

/// Receive one message. Returns `Ok(None)` when the peer closed the channel.
pub fn receive(socket: BorrowedFd<'_>) -> Result<Option<Message>, ProtocolError> {
    let mut header = ExchangeHeader::default();
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_DESCRIPTORS]);

    let (bytes, truncated, fds) = {
        let mut iov = [IoSliceMut::new(bytemuck::bytes_of_mut(&mut header))];
        let msg = socket::recvmsg::<UnixAddr>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )?;

        // Whatever the kernel installed is ours to close, even when the
        // control data was cut short.
        let truncated = msg.flags.contains(MsgFlags::MSG_CTRUNC);
        let mut fds = Vec::new();
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                // Safety: the kernel installed these descriptors for us.
                fds.extend(
                    received
                        .into_iter()
                        .map(|raw| unsafe { OwnedFd::from_raw_fd(raw) }),
                );
            }
        }
        (msg.bytes, truncated, fds)
    };

    if bytes == 0 {
        return Ok(None);
    }
    if truncated {
        return Err(ProtocolError::TooManyDescriptors(
            (header.num_fds as usize).max(fds.len() + 1),
        ));
    }
    if bytes < ExchangeHeader::size() {
        return Err(ProtocolError::Truncated(bytes));
    }
    if header.magic != ExchangeHeader::MAGIC {
        return Err(ProtocolError::BadMagic(header.magic));
    }
    let direction =
        Direction::try_from(header.direction).map_err(ProtocolError::UnknownDirection)?;

    let announced = header.num_fds as usize;
    if announced > MAX_DESCRIPTORS || fds.len() > MAX_DESCRIPTORS {
        return Err(ProtocolError::TooManyDescriptors(announced.max(fds.len())));
    }
    if announced != fds.len() {
        return Err(ProtocolError::DescriptorMismatch {
            announced,
            received: fds.len(),
        });
    }

    Ok(Some(Message {
        direction,
        id: header.id,
        fds,
    }))
}

// ============================================================================
// Sockets
// ============================================================================

/// Bind a listening SOCK_SEQPACKET socket at `path`, replacing a stale one
pub fn listen(path: &Path) -> Result<OwnedFd, ProtocolError> {
    if path.exists() {
        debug!("Removing stale socket {:?}", path);
        let _ = std::fs::remove_file(path);
    }

    let listener = socket::socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let addr = UnixAddr::new(path)?;
    socket::bind(listener.as_raw_fd(), &addr)?;
    socket::listen(&listener, Backlog::new(16)?)?;

    Ok(listener)
}

/// Accept one pending connection on a listener created by [`listen`]
pub fn accept(listener: BorrowedFd<'_>) -> Result<OwnedFd, ProtocolError> {
    let raw = socket::accept4(listener.as_raw_fd(), SockFlag::SOCK_CLOEXEC)?;
    // Safety: accept4 returned a fresh descriptor that nobody else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

// ============================================================================
// Client side
// ============================================================================

/// Remote-process end of the privileged channel
#[derive(Debug)]
pub struct DescriptorClient {
    socket: OwnedFd,
}

impl DescriptorClient {
    /// Connect to the compositor's channel at `path`
    pub fn connect(path: &Path) -> Result<Self, ProtocolError> {
        let socket = socket::socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let addr = UnixAddr::new(path)?;
        socket::connect(socket.as_raw_fd(), &addr)?;

        debug!("Connected to descriptor channel at {:?}", path);
        Ok(Self { socket })
    }

    /// Wrap an already connected socket (e.g. one end of a socketpair)
    pub fn from_socket(socket: OwnedFd) -> Self {
        Self { socket }
    }

    /// Ask for the descriptors of surface `id`; empty means "not ready yet"
    pub fn request(&self, id: u32) -> Result<Vec<OwnedFd>, ProtocolError> {
        send(self.socket.as_fd(), Direction::Request, id, &[])?;
        let reply = self.reply(id)?;
        Ok(reply.fds)
    }

    /// Hand client-allocated buffer planes to the compositor for surface `id`
    pub fn offer(&self, id: u32, fds: &[BorrowedFd<'_>]) -> Result<(), ProtocolError> {
        send(self.socket.as_fd(), Direction::Offer, id, fds)?;
        self.reply(id).map(|_| ())
    }

    fn reply(&self, id: u32) -> Result<Message, ProtocolError> {
        let msg = receive(self.socket.as_fd())?.ok_or(ProtocolError::Closed)?;
        if msg.direction != Direction::Reply || msg.id != id {
            return Err(ProtocolError::UnexpectedReply {
                direction: msg.direction,
                id: msg.id,
            });
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
    use nix::sys::socket::socketpair;
    use std::fs::File;

    fn pair() -> (OwnedFd, OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap()
    }

    #[test]
    fn test_request_without_descriptors() {
        let (a, b) = pair();
        send(a.as_fd(), Direction::Request, 7, &[]).unwrap();

        let msg = receive(b.as_fd()).unwrap().unwrap();
        assert_eq!(msg.direction, Direction::Request);
        assert_eq!(msg.id, 7);
        assert!(msg.fds.is_empty());
    }

    #[test]
    fn test_reply_carries_descriptors() {
        let (a, b) = pair();
        let first = File::open("/dev/null").unwrap();
        let second = File::open("/dev/null").unwrap();

        send(
            a.as_fd(),
            Direction::Reply,
            3,
            &[first.as_fd(), second.as_fd()],
        )
        .unwrap();

        let msg = receive(b.as_fd()).unwrap().unwrap();
        assert_eq!(msg.direction, Direction::Reply);
        assert_eq!(msg.fds.len(), 2);
        assert_ne!(msg.fds[0].as_raw_fd(), first.as_raw_fd());
    }

    #[test]
    fn test_oversized_send_is_rejected() {
        let (a, _b) = pair();
        let files: Vec<File> = (0..MAX_DESCRIPTORS + 1)
            .map(|_| File::open("/dev/null").unwrap())
            .collect();
        let fds: Vec<BorrowedFd<'_>> = files.iter().map(|f| f.as_fd()).collect();

        match send(a.as_fd(), Direction::Offer, 1, &fds) {
            Err(ProtocolError::TooManyDescriptors(n)) => assert_eq!(n, MAX_DESCRIPTORS + 1),
            other => panic!("Expected TooManyDescriptors, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let (a, b) = pair();
        let mut header = ExchangeHeader::new(Direction::Request, 1, 0);
        header.magic = 0xdeadbeef;
        socket::send(a.as_raw_fd(), bytemuck::bytes_of(&header), MsgFlags::empty()).unwrap();

        assert!(matches!(
            receive(b.as_fd()),
            Err(ProtocolError::BadMagic(0xdeadbeef))
        ));
    }

    #[test]
    fn test_oversized_receive_closes_descriptors() {
        let (a, b) = pair();
        let (reader, writer) = nix::unistd::pipe().unwrap();

        // Bypass the send-side limit: eight copies of the pipe's write end.
        let header = ExchangeHeader::new(Direction::Offer, 1, 8);
        let raw = [writer.as_raw_fd(); 8];
        socket::sendmsg::<UnixAddr>(
            a.as_raw_fd(),
            &[IoSlice::new(bytemuck::bytes_of(&header))],
            &[ControlMessage::ScmRights(&raw)],
            MsgFlags::empty(),
            None,
        )
        .unwrap();
        drop(writer);

        assert!(matches!(
            receive(b.as_fd()),
            Err(ProtocolError::TooManyDescriptors(8))
        ));

        // Every write end is gone, so the reader sees a hang-up.
        let mut fds = [PollFd::new(reader.as_fd(), PollFlags::POLLIN)];
        assert_eq!(poll(&mut fds, PollTimeout::from(1000u16)).unwrap(), 1);
        assert!(fds[0].revents().unwrap().contains(PollFlags::POLLHUP));
    }

    #[test]
    fn test_short_header_is_rejected() {
        let (a, b) = pair();
        socket::send(a.as_raw_fd(), &[0u8; 4], MsgFlags::empty()).unwrap();

        assert!(matches!(receive(b.as_fd()), Err(ProtocolError::Truncated(4))));
    }

    #[test]
    fn test_closed_peer() {
        let (a, b) = pair();
        drop(a);
        assert!(receive(b.as_fd()).unwrap().is_none());
    }

    #[test]
    fn test_client_rejects_mismatched_reply() {
        let (a, b) = pair();
        let client = DescriptorClient::from_socket(a);

        let server = std::thread::spawn(move || {
            let msg = receive(b.as_fd()).unwrap().unwrap();
            send(b.as_fd(), Direction::Reply, msg.id + 1, &[]).unwrap();
        });

        assert!(matches!(
            client.request(5),
            Err(ProtocolError::UnexpectedReply { id: 6, .. })
        ));
        server.join().unwrap();
    }
}
