//! Descriptor exchange
//!
//! Hands GPU buffer handles between the compositor and remote clients over
//! the privileged channel. Every exchange is synchronous and keyed by surface
//! id: a `Request` is answered with the surface's plane descriptors (or the
//! render device for [`DISPLAY_ID`]), an `Offer` imports client-allocated
//! planes. Unknown ids are a benign race with surface teardown and yield an
//! empty answer. A peer that breaks the protocol loses its connection.

use crate::error::{CompositorError, Result};
use mosaic_ipc::exchange_proto::{DISPLAY_ID, Direction, MAX_DESCRIPTORS};
use mosaic_ipc::{Message, ProtocolError};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::collections::HashSet;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// How long blocking socket waits last before re-checking for shutdown
const POLL_INTERVAL_MS: u16 = 100;

/// What the exchange looks descriptors up in
pub trait DescriptorSource: Send + Sync {
    /// Handle identifying the render device
    fn display_descriptor(&self) -> io::Result<OwnedFd>;

    /// Plane handles of surface `id`; `None` when no such surface exists
    fn surface_descriptors(&self, id: u32, max: usize) -> Option<io::Result<Vec<OwnedFd>>>;

    /// Attach offered planes to surface `id`; false when no such surface exists
    fn import(&self, id: u32, fds: Vec<OwnedFd>) -> bool;
}

pub struct DescriptorExchange {
    source: Arc<dyn DescriptorSource>,
    sessions: Mutex<HashSet<u32>>,
}

/// An exchange in flight for one id
struct Session<'a> {
    sessions: &'a Mutex<HashSet<u32>>,
    id: u32,
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

impl DescriptorExchange {
    pub fn new(source: Arc<dyn DescriptorSource>) -> Self {
        Self {
            source,
            sessions: Mutex::new(HashSet::new()),
        }
    }

    fn open_session(&self, id: u32) -> Option<Session<'_>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if !sessions.insert(id) {
            return None;
        }
        Some(Session {
            sessions: &self.sessions,
            id,
        })
    }

    /// Descriptors for `id`. Empty when the id is unknown, busy or not ready.
    pub fn request(&self, id: u32) -> Vec<OwnedFd> {
        let Some(_session) = self.open_session(id) else {
            warn!("Exchange for id {} already in flight, answering empty", id);
            return Vec::new();
        };

        let result = if id == DISPLAY_ID {
            Some(self.source.display_descriptor().map(|fd| vec![fd]))
        } else {
            self.source.surface_descriptors(id, MAX_DESCRIPTORS)
        };

        match result {
            Some(Ok(fds)) => {
                debug!("Serving {} descriptors for id {}", fds.len(), id);
                fds
            }
            Some(Err(e)) => {
                warn!("Failed to duplicate descriptors of id {}: {}", id, e);
                Vec::new()
            }
            None => {
                debug!("Descriptor request for unknown id {}", id);
                Vec::new()
            }
        }
    }

    /// Import client planes for `id`. No planes or more than
    /// [`MAX_DESCRIPTORS`] is a protocol violation; an unknown id is dropped.
    pub fn offer(&self, id: u32, fds: Vec<OwnedFd>) -> Result<()> {
        if fds.len() > MAX_DESCRIPTORS {
            return Err(ProtocolError::TooManyDescriptors(fds.len()).into());
        }
        if fds.is_empty() {
            return Err(ProtocolError::EmptyOffer.into());
        }

        let Some(_session) = self.open_session(id) else {
            warn!("Exchange for id {} already in flight, dropping offer", id);
            return Ok(());
        };

        if self.source.import(id, fds) {
            debug!("Imported offered planes for id {}", id);
        } else {
            warn!("Offer for unknown id {} dropped", id);
        }
        Ok(())
    }

    /// Answer one decoded message; the reply goes back on `socket`
    fn handle(&self, socket: BorrowedFd<'_>, msg: Message) -> Result<()> {
        match msg.direction {
            Direction::Request => {
                let fds = self.request(msg.id);
                let borrowed: Vec<BorrowedFd<'_>> = fds.iter().map(|fd| fd.as_fd()).collect();
                mosaic_ipc::send(socket, Direction::Reply, msg.id, &borrowed)?;
            }
            Direction::Offer => {
                self.offer(msg.id, msg.fds)?;
                mosaic_ipc::send(socket, Direction::Reply, msg.id, &[])?;
            }
            Direction::Reply => {
                return Err(ProtocolError::UnexpectedReply {
                    direction: msg.direction,
                    id: msg.id,
                }
                .into());
            }
        }
        Ok(())
    }
}

// ============================================================================
// Server
// ============================================================================

/// Wait until `fd` is readable or the poll interval passed
fn readable(fd: BorrowedFd<'_>) -> std::result::Result<bool, Errno> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
        Ok(n) => Ok(n > 0),
        Err(Errno::EINTR) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Listens on the privileged channel; one thread per connected peer
pub struct ExchangeServer {
    path: PathBuf,
    running: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ExchangeServer {
    pub fn bind(path: &Path, exchange: Arc<DescriptorExchange>) -> Result<Self> {
        let listener = mosaic_ipc::listen(path)?;
        info!("Descriptor exchange listening on {:?}", path);

        let running = Arc::new(AtomicBool::new(true));
        let connections: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let acceptor = {
            let running = Arc::clone(&running);
            let connections = Arc::clone(&connections);
            thread::Builder::new()
                .name("exchange-accept".to_string())
                .spawn(move || accept_loop(listener, exchange, running, connections))
                .map_err(|source| CompositorError::Thread {
                    name: "exchange-accept",
                    source,
                })?
        };

        Ok(Self {
            path: path.to_path_buf(),
            running,
            acceptor: Some(acceptor),
            connections,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting, close every peer and join all threads
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        let connections: Vec<_> = self
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for connection in connections {
            let _ = connection.join();
        }

        let _ = std::fs::remove_file(&self.path);
        info!("Descriptor exchange on {:?} closed", self.path);
    }
}

impl Drop for ExchangeServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Pause after the first failed accept; doubles up to [`MAX_ACCEPT_BACKOFF`]
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

fn next_backoff(current: Option<Duration>) -> Duration {
    current.map_or(ACCEPT_BACKOFF, |current| (current * 2).min(MAX_ACCEPT_BACKOFF))
}

fn accept_loop(
    listener: OwnedFd,
    exchange: Arc<DescriptorExchange>,
    running: Arc<AtomicBool>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    let mut peers = 0u32;
    let mut backoff = None;

    while running.load(Ordering::Acquire) {
        match readable(listener.as_fd()) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                error!("Polling the exchange listener failed: {}", e);
                break;
            }
        }

        let socket = match mosaic_ipc::accept(listener.as_fd()) {
            Ok(socket) => {
                backoff = None;
                socket
            }
            Err(e) => {
                // The listener stays readable while the peer is pending, e.g. on EMFILE.
                let pause = next_backoff(backoff);
                warn!("Failed to accept exchange peer: {}, retrying in {:?}", e, pause);
                backoff = Some(pause);
                thread::sleep(pause);
                continue;
            }
        };

        peers += 1;
        debug!("Exchange peer {} connected", peers);

        let exchange = Arc::clone(&exchange);
        let running = Arc::clone(&running);
        let spawned = thread::Builder::new()
            .name(format!("exchange-peer-{}", peers))
            .spawn(move || serve_peer(socket, exchange, running));

        match spawned {
            Ok(handle) => {
                let mut connections = connections.lock().unwrap_or_else(|e| e.into_inner());
                connections.retain(|handle| !handle.is_finished());
                connections.push(handle);
            }
            Err(e) => error!("Failed to spawn exchange peer thread: {}", e),
        }
    }
}

fn serve_peer(socket: OwnedFd, exchange: Arc<DescriptorExchange>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) {
        match readable(socket.as_fd()) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                warn!("Polling exchange peer failed: {}", e);
                break;
            }
        }

        let msg = match mosaic_ipc::receive(socket.as_fd()) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!("Exchange peer disconnected");
                break;
            }
            Err(e) => {
                error!("Protocol violation from exchange peer, closing: {}", e);
                break;
            }
        };

        trace!("Exchange {:?} for id {}", msg.direction, msg.id);
        if let Err(e) = exchange.handle(socket.as_fd(), msg) {
            error!("Closing exchange peer: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mosaic_ipc::DescriptorClient;
    use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
    use std::fs::File;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Source {
        imported: AtomicUsize,
    }

    fn null() -> OwnedFd {
        OwnedFd::from(File::open("/dev/null").unwrap())
    }

    impl DescriptorSource for Source {
        fn display_descriptor(&self) -> io::Result<OwnedFd> {
            Ok(null())
        }

        fn surface_descriptors(&self, id: u32, max: usize) -> Option<io::Result<Vec<OwnedFd>>> {
            (id == 1).then(|| Ok((0..2.min(max)).map(|_| null()).collect()))
        }

        fn import(&self, id: u32, fds: Vec<OwnedFd>) -> bool {
            if id != 1 {
                return false;
            }
            self.imported.fetch_add(fds.len(), Ordering::SeqCst);
            true
        }
    }

    fn exchange() -> (Arc<Source>, Arc<DescriptorExchange>) {
        let source = Arc::new(Source::default());
        let exchange = Arc::new(DescriptorExchange::new(source.clone()));
        (source, exchange)
    }

    #[test]
    fn test_request_known_and_unknown() {
        let (_, exchange) = exchange();

        assert_eq!(exchange.request(1).len(), 2);
        assert_eq!(exchange.request(DISPLAY_ID).len(), 1);
        assert!(exchange.request(42).is_empty());
    }

    #[test]
    fn test_busy_id_answers_empty() {
        let (_, exchange) = exchange();

        let session = exchange.open_session(1).unwrap();
        assert!(exchange.request(1).is_empty());
        drop(session);
        assert_eq!(exchange.request(1).len(), 2);
    }

    #[test]
    fn test_offer() {
        let (source, exchange) = exchange();

        exchange.offer(1, vec![null()]).unwrap();
        assert_eq!(source.imported.load(Ordering::SeqCst), 1);

        // Unknown ids are not an error.
        exchange.offer(9, vec![null()]).unwrap();
        assert_eq!(source.imported.load(Ordering::SeqCst), 1);

        let oversized = (0..MAX_DESCRIPTORS + 1).map(|_| null()).collect();
        assert!(matches!(
            exchange.offer(1, oversized),
            Err(CompositorError::Protocol(ProtocolError::TooManyDescriptors(_)))
        ));
        assert_eq!(source.imported.load(Ordering::SeqCst), 1);

        assert!(matches!(
            exchange.offer(1, Vec::new()),
            Err(CompositorError::Protocol(ProtocolError::EmptyOffer))
        ));
        assert_eq!(source.imported.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_peer_over_socketpair() {
        let (_, exchange) = exchange();
        let (client, server) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        let running = Arc::new(AtomicBool::new(true));

        let peer = {
            let running = Arc::clone(&running);
            thread::spawn(move || serve_peer(server, exchange, running))
        };

        let client = DescriptorClient::from_socket(client);
        assert_eq!(client.request(1).unwrap().len(), 2);
        assert!(client.request(7).unwrap().is_empty());
        let offered = null();
        client.offer(1, &[offered.as_fd()]).unwrap();

        drop(client);
        peer.join().unwrap();
    }

    #[test]
    fn test_server_on_path() {
        let (source, exchange) = exchange();
        let path = std::env::temp_dir().join(format!("mosaic-exchange-{}.sock", std::process::id()));

        let mut server = ExchangeServer::bind(&path, exchange).unwrap();
        let client = DescriptorClient::connect(server.path()).unwrap();

        assert_eq!(client.request(DISPLAY_ID).unwrap().len(), 1);
        let offered = null();
        client.offer(1, &[offered.as_fd()]).unwrap();
        assert_eq!(source.imported.load(Ordering::SeqCst), 1);

        drop(client);
        server.shutdown();
        assert!(!path.exists());
    }

    #[test]
    fn test_failed_accepts_back_off() {
        let mut pause = next_backoff(None);
        assert_eq!(pause, ACCEPT_BACKOFF);

        let mut pauses = vec![pause];
        for _ in 0..10 {
            pause = next_backoff(Some(pause));
            pauses.push(pause);
        }

        assert!(pauses.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(pauses[1], ACCEPT_BACKOFF * 2);
        assert_eq!(pause, MAX_ACCEPT_BACKOFF);
    }
}
