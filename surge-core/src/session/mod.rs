//! Simulated session engine.
//!
//! A [`Session`] owns the torrents and peer connections of one simulated
//! host. It listens on its settings' port, speaks the peer wire protocol
//! over datagrams and reports everything through alerts.
//!
//! The alert notify hook is invoked while the session is in the middle of
//! updating its own state. Calling back into the session from the hook
//! panics; the hook should only schedule work for later.

mod peer;
mod torrent;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::Bytes;
use surge_sim::{Binding, Datagram, DeadlineTimer, IoContext};

pub use peer::PeerInfo;
use peer::PeerConnection;
use torrent::Torrent;
pub use torrent::{TorrentState, TorrentStatus};

use crate::alert::{Alert, AlertKind, CloseReason};
use crate::ip_filter::IpFilter;
use crate::params::AddTorrentParams;
use crate::protocol::messages::{pack_bitfield, unpack_bitfield};
use crate::protocol::{Frame, PeerHandshake, PeerMessage, Transport, handshake};
use crate::settings::SettingsPack;
use crate::torrent::{BLOCK_SIZE, BlockRequest, InfoHash, PieceIndex, PiecePicker, TorrentError};

/// Interval of the session's housekeeping timer
const TICK_INTERVAL: Duration = Duration::from_secs(1);

type NotifyHook = Rc<dyn Fn()>;

struct SessionState {
    torrents: Vec<Torrent>,
    peers: BTreeMap<SocketAddr, PeerConnection>,
    ip_filter: IpFilter,
    /// Housekeeping timer armed
    ticking: bool,
}

pub(crate) struct SessionInner {
    weak_self: Weak<SessionInner>,
    io: IoContext,
    settings: SettingsPack,
    state: RefCell<SessionState>,
    alerts: RefCell<VecDeque<Alert>>,
    notify: RefCell<Option<NotifyHook>>,
    in_notify: Cell<bool>,
    binding: RefCell<Option<Binding>>,
    timer: DeadlineTimer,
    aborted: Cell<bool>,
    torn_down: Cell<bool>,
}

/// Protocol engine for one simulated host.
///
/// Dropping a session tears it down immediately. Use [`Session::abort`] to
/// tear it down asynchronously on its I/O context instead.
pub struct Session {
    inner: Rc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.inner.listen_endpoint())
            .field("aborted", &self.inner.aborted.get())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates a session on `io` and starts listening.
    ///
    /// Failing to bind the listen port is reported as a `listen_failed`
    /// alert; the session still works for outgoing connections.
    pub fn new(settings: SettingsPack, io: &IoContext) -> Self {
        let inner = Rc::new_cyclic(|weak_self| SessionInner {
            weak_self: weak_self.clone(),
            io: io.clone(),
            settings,
            state: RefCell::new(SessionState {
                torrents: Vec::new(),
                peers: BTreeMap::new(),
                ip_filter: IpFilter::new(),
                ticking: false,
            }),
            alerts: RefCell::new(VecDeque::new()),
            notify: RefCell::new(None),
            in_notify: Cell::new(false),
            binding: RefCell::new(None),
            timer: DeadlineTimer::new(io),
            aborted: Cell::new(false),
            torn_down: Cell::new(false),
        });
        inner.listen();
        Self { inner }
    }

    /// Settings the session was built with.
    pub fn settings(&self) -> &SettingsPack {
        &self.inner.settings
    }

    /// Endpoint peers connect to.
    pub fn listen_endpoint(&self) -> SocketAddr {
        self.inner.listen_endpoint()
    }

    /// Queues a torrent add; completion is reported by an `add_torrent`
    /// alert.
    ///
    /// # Panics
    /// Panics if called from inside the alert notify hook.
    pub fn async_add_torrent(&self, params: AddTorrentParams) {
        self.inner.enter();
        let weak = self.inner.weak_self.clone();
        self.inner.io.post(move || {
            if let Some(inner) = weak.upgrade() {
                inner.add_torrent(params);
            }
        });
    }

    /// Installs the hook called when the alert queue becomes non-empty.
    ///
    /// Fires immediately if alerts are already waiting.
    ///
    /// # Panics
    /// Panics if called from inside the alert notify hook.
    pub fn set_alert_notify(&self, notify: impl Fn() + 'static) {
        self.inner.enter();
        *self.inner.notify.borrow_mut() = Some(Rc::new(notify));
        if !self.inner.alerts.borrow().is_empty() {
            self.inner.fire_notify();
        }
    }

    /// Takes every queued alert, oldest first.
    ///
    /// # Panics
    /// Panics if called from inside the alert notify hook.
    pub fn pop_alerts(&self) -> Vec<Alert> {
        self.inner.enter();
        self.inner.alerts.borrow_mut().drain(..).collect()
    }

    /// Handles to every torrent in the session.
    ///
    /// # Panics
    /// Panics if called from inside the alert notify hook.
    pub fn get_torrents(&self) -> Vec<TorrentHandle> {
        self.inner.enter();
        let count = self.inner.state.borrow().torrents.len();
        (0..count)
            .map(|index| TorrentHandle {
                session: self.inner.weak_self.clone(),
                index,
            })
            .collect()
    }

    /// Handle to the torrent with `info_hash`, if present.
    ///
    /// # Panics
    /// Panics if called from inside the alert notify hook.
    pub fn find_torrent(&self, info_hash: InfoHash) -> Option<TorrentHandle> {
        self.inner.enter();
        let index = self
            .inner
            .state
            .borrow()
            .torrents
            .iter()
            .position(|t| t.info_hash() == info_hash)?;
        Some(TorrentHandle {
            session: self.inner.weak_self.clone(),
            index,
        })
    }

    /// Replaces the IP filter applied to new connections.
    ///
    /// # Panics
    /// Panics if called from inside the alert notify hook.
    pub fn set_ip_filter(&self, filter: IpFilter) {
        self.inner.enter();
        self.inner.state.borrow_mut().ip_filter = filter;
    }

    /// Current IP filter.
    ///
    /// # Panics
    /// Panics if called from inside the alert notify hook.
    pub fn ip_filter(&self) -> IpFilter {
        self.inner.enter();
        self.inner.state.borrow().ip_filter.clone()
    }

    /// Starts asynchronous shutdown.
    ///
    /// Teardown (closing peers, stopping timers, unbinding) runs as a task on
    /// the session's I/O context. The returned proxy keeps the session's
    /// state alive until then; dropping it early is harmless but the proxy
    /// is the only way to observe completion.
    ///
    /// # Panics
    /// Panics if called from inside the alert notify hook.
    pub fn abort(self) -> SessionProxy {
        self.inner.enter();
        self.inner.aborted.set(true);
        tracing::info!("Aborting session at {}", self.inner.listen_endpoint());

        let task = Rc::clone(&self.inner);
        self.inner.io.post(move || task.teardown());

        SessionProxy {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.inner.aborted.replace(true) {
            self.inner.teardown();
        }
    }
}

/// Detached teardown token returned by [`Session::abort`].
pub struct SessionProxy {
    inner: Rc<SessionInner>,
}

impl SessionProxy {
    /// Whether asynchronous teardown has completed.
    pub fn is_shut_down(&self) -> bool {
        self.inner.torn_down.get()
    }
}

impl fmt::Debug for SessionProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionProxy")
            .field("endpoint", &self.inner.listen_endpoint())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Handle to one torrent in a session.
///
/// Handles do not keep the session alive. Once the session is gone every
/// query returns an invalid default and every command is ignored.
#[derive(Clone)]
pub struct TorrentHandle {
    session: Weak<SessionInner>,
    index: usize,
}

impl fmt::Debug for TorrentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TorrentHandle")
            .field("index", &self.index)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl PartialEq for TorrentHandle {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.session, &other.session) && self.index == other.index
    }
}

impl TorrentHandle {
    /// Whether the owning session is alive and not shutting down.
    pub fn is_valid(&self) -> bool {
        self.session
            .upgrade()
            .is_some_and(|session| !session.aborted.get())
    }

    /// Info hash of the torrent.
    pub fn info_hash(&self) -> Option<InfoHash> {
        let session = self.session.upgrade()?;
        let state = session.state.borrow();
        state.torrents.get(self.index).map(Torrent::info_hash)
    }

    /// Progress snapshot.
    ///
    /// # Panics
    /// Panics if called from inside the alert notify hook.
    pub fn status(&self) -> TorrentStatus {
        let Some(session) = self.session.upgrade() else {
            return TorrentStatus::default();
        };
        session.enter();
        let state = session.state.borrow();
        let Some(torrent) = state.torrents.get(self.index) else {
            return TorrentStatus::default();
        };
        let num_peers = state
            .peers
            .values()
            .filter(|p| p.torrent == self.index && p.is_connected())
            .count();
        torrent.status(num_peers)
    }

    /// Opens a connection to `endpoint` for this torrent.
    ///
    /// Ignored for paused torrents, our own endpoint and endpoints already
    /// connected. Refusals by the IP filter are reported as `peer_blocked`.
    ///
    /// # Panics
    /// Panics if called from inside the alert notify hook.
    pub fn connect_peer(&self, endpoint: SocketAddr) {
        if let Some(session) = self.session.upgrade() {
            session.enter();
            session.connect_peer(self.index, endpoint);
        }
    }

    /// Snapshot of this torrent's peer connections.
    ///
    /// # Panics
    /// Panics if called from inside the alert notify hook.
    pub fn peer_info(&self) -> Vec<PeerInfo> {
        let Some(session) = self.session.upgrade() else {
            return Vec::new();
        };
        session.enter();
        let state = session.state.borrow();
        state
            .peers
            .values()
            .filter(|p| p.torrent == self.index)
            .map(PeerConnection::info)
            .collect()
    }

    /// Stops the torrent and closes its connections.
    ///
    /// # Panics
    /// Panics if called from inside the alert notify hook.
    pub fn pause(&self) {
        if let Some(session) = self.session.upgrade() {
            session.enter();
            session.set_paused(self.index, true);
        }
    }

    /// Lets a paused torrent make and accept connections again.
    ///
    /// # Panics
    /// Panics if called from inside the alert notify hook.
    pub fn resume(&self) {
        if let Some(session) = self.session.upgrade() {
            session.enter();
            session.set_paused(self.index, false);
        }
    }
}

impl SessionInner {
    fn listen_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.io.address(), self.settings.listen_port)
    }

    fn enter(&self) {
        if self.in_notify.get() {
            panic!("session called from inside its alert notify hook");
        }
    }

    fn listen(&self) {
        let endpoint = self.listen_endpoint();
        let weak = self.weak_self.clone();
        let bound = self.io.bind(self.settings.listen_port, move |datagram| {
            if let Some(inner) = weak.upgrade() {
                inner.on_datagram(datagram);
            }
        });

        match bound {
            Ok(binding) => {
                *self.binding.borrow_mut() = Some(binding);
                tracing::debug!("Session listening on {}", endpoint);
                self.post_alert(AlertKind::ListenSucceeded { endpoint });
            }
            Err(e) => {
                tracing::warn!("Session failed to listen on {}: {}", endpoint, e);
                self.post_alert(AlertKind::ListenFailed {
                    endpoint,
                    error: e.to_string(),
                });
            }
        }
    }

    fn post_alert(&self, kind: AlertKind) {
        let was_empty = {
            let mut alerts = self.alerts.borrow_mut();
            if alerts.len() >= self.settings.alert_queue_size {
                tracing::trace!("Alert queue full, dropping {:?}", kind);
                return;
            }
            let was_empty = alerts.is_empty();
            alerts.push_back(Alert::new(self.io.now(), kind));
            was_empty
        };

        if was_empty {
            self.fire_notify();
        }
    }

    fn fire_notify(&self) {
        let notify = self.notify.borrow().clone();
        if let Some(notify) = notify {
            self.in_notify.set(true);
            notify();
            self.in_notify.set(false);
        }
    }

    fn send(&self, to: SocketAddr, frame: &Frame, key: Option<&InfoHash>) {
        self.io
            .send_to(self.settings.listen_port, to, frame.encode(key));
    }

    fn send_message(&self, peer: &PeerConnection, message: PeerMessage) {
        self.send(peer.endpoint, &Frame::Message(message), peer.key());
    }

    /// Refuses an incoming handshake with an unencrypted close.
    fn refuse(&self, to: SocketAddr, reason: CloseReason) {
        tracing::debug!("Refusing connection from {}: {}", to, reason);
        self.send(
            to,
            &Frame::Message(PeerMessage::Close {
                reason: reason.code(),
            }),
            None,
        );
    }

    fn add_torrent(&self, params: AddTorrentParams) {
        if self.aborted.get() {
            return;
        }
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;

        let Some(info) = params.ti.clone() else {
            self.post_alert(AlertKind::AddTorrent {
                info_hash: None,
                name: String::new(),
                error: Some(TorrentError::MissingTorrentInfo.to_string()),
            });
            return;
        };

        let info_hash = info.info_hash();
        if state.torrents.iter().any(|t| t.info_hash() == info_hash) {
            self.post_alert(AlertKind::AddTorrent {
                info_hash: Some(info_hash),
                name: info.name().to_string(),
                error: Some(TorrentError::DuplicateTorrent { info_hash }.to_string()),
            });
            return;
        }

        let mut torrent = Torrent::new(Rc::clone(&info), params.save_path.clone(), params.paused);
        self.post_alert(AlertKind::AddTorrent {
            info_hash: Some(info_hash),
            name: info.name().to_string(),
            error: None,
        });

        let have = if params.seed_mode {
            vec![true; info.num_pieces() as usize]
        } else {
            match torrent.storage.check_pieces(&info) {
                Ok(have) => have,
                Err(e) => {
                    tracing::warn!(
                        "Checking {} failed: {}",
                        torrent.storage.path().display(),
                        e
                    );
                    self.post_alert(AlertKind::FileError {
                        info_hash,
                        path: torrent.storage.path().to_path_buf(),
                        error: e.to_string(),
                    });
                    Vec::new()
                }
            }
        };
        torrent.picker = PiecePicker::new(&info, have);

        self.post_alert(AlertKind::TorrentChecked {
            info_hash,
            num_have: torrent.picker.num_have(),
        });

        torrent.state = if torrent.picker.is_complete() {
            TorrentState::Seeding
        } else {
            TorrentState::Downloading
        };
        self.post_alert(AlertKind::StateChanged {
            info_hash,
            prev_state: TorrentState::CheckingFiles,
            state: torrent.state,
        });

        tracing::info!(
            "Added torrent {} at {} ({}/{} pieces)",
            info.name(),
            params.save_path.display(),
            torrent.picker.num_have(),
            info.num_pieces()
        );
        state.torrents.push(torrent);
    }

    fn set_paused(&self, index: usize, paused: bool) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let Some(torrent) = state.torrents.get_mut(index) else {
            return;
        };
        torrent.paused = paused;

        if paused {
            let endpoints: Vec<SocketAddr> = state
                .peers
                .values()
                .filter(|p| p.torrent == index)
                .map(|p| p.endpoint)
                .collect();
            for endpoint in endpoints {
                self.disconnect(state, endpoint, CloseReason::Paused, true);
            }
        }
    }

    fn connect_peer(&self, index: usize, endpoint: SocketAddr) {
        if self.aborted.get() {
            return;
        }
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;

        let Some(torrent) = state.torrents.get(index) else {
            return;
        };
        if torrent.paused {
            tracing::debug!("Not connecting paused torrent to {}", endpoint);
            return;
        }
        if endpoint == self.listen_endpoint() || state.peers.contains_key(&endpoint) {
            return;
        }
        if state.ip_filter.is_blocked(endpoint.ip()) {
            tracing::debug!("Outgoing connection to {} blocked by ip filter", endpoint);
            self.post_alert(AlertKind::PeerBlocked { endpoint });
            return;
        }
        if state.peers.len() >= self.settings.connections_limit {
            self.post_alert(AlertKind::PeerError {
                endpoint,
                error: CloseReason::TooManyConnections.to_string(),
            });
            return;
        }
        if self.settings.outgoing_transports().is_empty() {
            self.post_alert(AlertKind::PeerError {
                endpoint,
                error: "no outgoing transport enabled".to_string(),
            });
            return;
        }

        let info_hash = torrent.info_hash();
        let peer = PeerConnection::new(
            endpoint,
            index,
            info_hash,
            torrent.info.num_pieces(),
            true,
            self.io.now(),
        );
        state.peers.insert(endpoint, peer);

        tracing::debug!("Connecting to {}", endpoint);
        self.send(
            endpoint,
            &Frame::Handshake(handshake::offer(info_hash, &self.settings)),
            None,
        );
        self.ensure_ticking(state);
    }

    fn on_datagram(&self, datagram: Datagram) {
        if self.aborted.get() {
            return;
        }
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let from = datagram.from;

        let key = state.peers.get(&from).and_then(|p| p.key().copied());
        let frame = match Frame::decode(&datagram.payload, key.as_ref()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Malformed frame from {}: {}", from, e);
                if state.peers.contains_key(&from) {
                    self.post_alert(AlertKind::PeerError {
                        endpoint: from,
                        error: e.to_string(),
                    });
                    self.disconnect(state, from, CloseReason::ProtocolError, true);
                }
                return;
            }
        };

        match frame {
            Frame::Handshake(offer) => self.on_handshake(state, from, offer),
            Frame::Accept(reply) => self.on_accept(state, from, reply),
            Frame::Message(message) => self.on_message(state, from, message),
        }
    }

    fn on_handshake(&self, state: &mut SessionState, from: SocketAddr, offer: PeerHandshake) {
        if state.peers.contains_key(&from) {
            self.refuse(from, CloseReason::Duplicate);
            return;
        }
        if state.ip_filter.is_blocked(from.ip()) {
            self.post_alert(AlertKind::PeerBlocked { endpoint: from });
            self.refuse(from, CloseReason::Blocked);
            return;
        }

        let transport = if offer.supports_transport(Transport::Utp) {
            Transport::Utp
        } else {
            Transport::Tcp
        };
        self.post_alert(AlertKind::IncomingConnection {
            endpoint: from,
            transport,
        });

        let reject = |reason: CloseReason| {
            self.post_alert(AlertKind::PeerError {
                endpoint: from,
                error: reason.to_string(),
            });
            self.refuse(from, reason);
        };

        let Some(index) = state
            .torrents
            .iter()
            .position(|t| t.info_hash() == offer.info_hash)
        else {
            reject(CloseReason::UnknownTorrent);
            return;
        };
        if state.torrents[index].paused {
            reject(CloseReason::Paused);
            return;
        }
        if state.peers.len() >= self.settings.connections_limit {
            reject(CloseReason::TooManyConnections);
            return;
        }
        let negotiated = match handshake::negotiate(&offer, &self.settings) {
            Ok(negotiated) => negotiated,
            Err(reason) => {
                reject(reason);
                return;
            }
        };

        let torrent = &state.torrents[index];
        let mut peer = PeerConnection::new(
            from,
            index,
            torrent.info_hash(),
            torrent.info.num_pieces(),
            false,
            self.io.now(),
        );
        peer.peer_id = Some(offer.peer_id);
        peer.negotiated = Some(negotiated);

        self.send(
            from,
            &Frame::Accept(handshake::accept(
                torrent.info_hash(),
                &self.settings,
                negotiated,
            )),
            None,
        );
        state.peers.insert(from, peer);
        self.on_connected(state, from);
    }

    fn on_accept(&self, state: &mut SessionState, from: SocketAddr, reply: PeerHandshake) {
        let Some(peer) = state.peers.get_mut(&from) else {
            return;
        };
        if !peer.outgoing || peer.is_connected() || peer.info_hash != reply.info_hash {
            return;
        }
        peer.peer_id = Some(reply.peer_id);
        peer.negotiated = Some(handshake::accepted(&reply));
        self.on_connected(state, from);
    }

    fn on_connected(&self, state: &mut SessionState, endpoint: SocketAddr) {
        let Some(peer) = state.peers.get(&endpoint) else {
            return;
        };
        let Some(negotiated) = peer.negotiated else {
            return;
        };
        let torrent = &state.torrents[peer.torrent];

        tracing::debug!(
            "Connected to {} over {}{}",
            endpoint,
            negotiated.transport,
            if negotiated.encrypted { " (rc4)" } else { "" }
        );
        self.post_alert(AlertKind::PeerConnect {
            info_hash: peer.info_hash,
            endpoint,
            transport: negotiated.transport,
            encrypted: negotiated.encrypted,
        });

        if torrent.picker.num_have() > 0 {
            self.send_message(
                peer,
                PeerMessage::Bitfield {
                    bitfield: pack_bitfield(torrent.picker.bitfield()),
                },
            );
        }
    }

    fn on_message(&self, state: &mut SessionState, from: SocketAddr, message: PeerMessage) {
        let Some(peer) = state.peers.get_mut(&from) else {
            return;
        };
        if let PeerMessage::Close { reason } = message {
            self.disconnect(state, from, CloseReason::from_code(reason), false);
            return;
        }
        if !peer.is_connected() {
            return;
        }
        let index = peer.torrent;
        let torrent = &mut state.torrents[index];

        match message {
            PeerMessage::Choke => {
                peer.peer_choking = true;
                for (block, _) in peer.requests.drain(..) {
                    torrent.picker.abort_request(&block);
                }
            }
            PeerMessage::Unchoke => {
                peer.peer_choking = false;
                self.request_blocks(state, from);
            }
            PeerMessage::Interested => {
                peer.peer_interested = true;
                self.run_choker(state, index);
            }
            PeerMessage::NotInterested => {
                peer.peer_interested = false;
                self.run_choker(state, index);
            }
            PeerMessage::Have { piece_index } => {
                if let Some(has) = peer.peer_has.get_mut(piece_index.as_usize()) {
                    if !*has {
                        *has = true;
                        torrent.picker.peer_has_piece(piece_index);
                    }
                }
                self.update_interest(state, from);
            }
            PeerMessage::Bitfield { bitfield } => {
                let has = unpack_bitfield(&bitfield, torrent.info.num_pieces());
                torrent.picker.remove_peer(&peer.peer_has);
                torrent.picker.add_peer(&has);
                peer.peer_has = has;
                self.update_interest(state, from);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => self.on_request(state, from, piece_index, offset, length),
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => self.on_piece(state, from, piece_index, offset, data),
            PeerMessage::Cancel { .. } | PeerMessage::Close { .. } => {}
        }
    }

    fn on_request(
        &self,
        state: &mut SessionState,
        from: SocketAddr,
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    ) {
        let Some(peer) = state.peers.get_mut(&from) else {
            return;
        };
        if peer.am_choking {
            return;
        }
        let torrent = &mut state.torrents[peer.torrent];
        if !torrent.picker.has_piece(piece_index) {
            return;
        }

        let piece_size = torrent.info.piece_size(piece_index);
        let end = match offset.checked_add(length) {
            Some(end) if length > 0 && length <= BLOCK_SIZE && end <= piece_size => end,
            _ => {
                tracing::debug!(
                    "Ignoring bad request from {}: piece {} {}+{}",
                    from,
                    piece_index,
                    offset,
                    length
                );
                return;
            }
        };

        match torrent.storage.read_piece(&torrent.info, piece_index) {
            Ok(piece) => {
                let data = Bytes::copy_from_slice(&piece[offset as usize..end as usize]);
                peer.uploaded += u64::from(length);
                torrent.total_upload += u64::from(length);
                self.send_message(
                    peer,
                    PeerMessage::Piece {
                        piece_index,
                        offset,
                        data,
                    },
                );
            }
            Err(e) => {
                tracing::warn!("Reading piece {} failed: {}", piece_index, e);
                self.post_alert(AlertKind::FileError {
                    info_hash: torrent.info_hash(),
                    path: torrent.storage.path().to_path_buf(),
                    error: e.to_string(),
                });
            }
        }
    }

    fn on_piece(
        &self,
        state: &mut SessionState,
        from: SocketAddr,
        piece_index: PieceIndex,
        offset: u32,
        data: Bytes,
    ) {
        let Some(peer) = state.peers.get_mut(&from) else {
            return;
        };
        peer.requests
            .retain(|(r, _)| !(r.piece == piece_index && r.offset == offset));
        peer.downloaded += data.len() as u64;

        let index = peer.torrent;
        let torrent = &mut state.torrents[index];
        torrent.total_download += data.len() as u64;

        let block = BlockRequest {
            piece: piece_index,
            offset,
            length: data.len() as u32,
        };
        if let Some((piece, buf)) = torrent.picker.received_block(&block, &data) {
            self.on_piece_complete(state, index, piece, &buf);
        }
        self.request_blocks(state, from);
    }

    fn on_piece_complete(
        &self,
        state: &mut SessionState,
        index: usize,
        piece: PieceIndex,
        data: &[u8],
    ) {
        let torrent = &mut state.torrents[index];
        let info_hash = torrent.info_hash();

        if !torrent.info.verify_piece(piece, data) {
            tracing::warn!("Piece {} of {} failed hash check", piece, info_hash);
            torrent.picker.piece_failed(piece);
            self.post_alert(AlertKind::HashFailed { info_hash, piece });
            return;
        }
        if let Err(e) = torrent.storage.write_piece(&torrent.info, piece, data) {
            tracing::warn!("Writing piece {} failed: {}", piece, e);
            torrent.picker.piece_failed(piece);
            self.post_alert(AlertKind::FileError {
                info_hash,
                path: torrent.storage.path().to_path_buf(),
                error: e.to_string(),
            });
            return;
        }

        torrent.picker.mark_have(piece);
        self.post_alert(AlertKind::PieceFinished { info_hash, piece });

        if torrent.picker.is_complete() && torrent.state == TorrentState::Downloading {
            torrent.state = TorrentState::Seeding;
            tracing::info!("Torrent {} finished", torrent.info.name());
            self.post_alert(AlertKind::TorrentFinished { info_hash });
            self.post_alert(AlertKind::StateChanged {
                info_hash,
                prev_state: TorrentState::Downloading,
                state: TorrentState::Seeding,
            });
        }

        let endpoints: Vec<SocketAddr> = state
            .peers
            .values()
            .filter(|p| p.torrent == index && p.is_connected())
            .map(|p| p.endpoint)
            .collect();
        for endpoint in endpoints {
            if let Some(peer) = state.peers.get(&endpoint) {
                self.send_message(peer, PeerMessage::Have { piece_index: piece });
            }
            self.update_interest(state, endpoint);
        }
    }

    fn update_interest(&self, state: &mut SessionState, endpoint: SocketAddr) {
        let interesting = {
            let Some(peer) = state.peers.get_mut(&endpoint) else {
                return;
            };
            let interesting = state.torrents[peer.torrent]
                .picker
                .is_interesting(&peer.peer_has);
            if interesting != peer.am_interested {
                peer.am_interested = interesting;
                let message = if interesting {
                    PeerMessage::Interested
                } else {
                    PeerMessage::NotInterested
                };
                self.send_message(peer, message);
            }
            interesting
        };

        if interesting {
            self.request_blocks(state, endpoint);
        }
    }

    fn request_blocks(&self, state: &mut SessionState, endpoint: SocketAddr) {
        let Some(peer) = state.peers.get_mut(&endpoint) else {
            return;
        };
        if !peer.is_connected() || peer.peer_choking || !peer.am_interested {
            return;
        }

        let room = self
            .settings
            .max_out_request_queue
            .saturating_sub(peer.requests.len());
        let torrent = &mut state.torrents[peer.torrent];
        let blocks = torrent.picker.pick_blocks(&peer.peer_has, room);
        if blocks.is_empty() {
            return;
        }

        let now = self.io.now();
        for block in blocks {
            self.send_message(
                peer,
                PeerMessage::Request {
                    piece_index: block.piece,
                    offset: block.offset,
                    length: block.length,
                },
            );
            peer.requests.push((block, now));
        }
        self.ensure_ticking(state);
    }

    /// Unchokes interested peers up to the slot limit, in endpoint order.
    fn run_choker(&self, state: &mut SessionState, index: usize) {
        let mut slots = self.settings.unchoke_slots_limit;

        for peer in state
            .peers
            .values_mut()
            .filter(|p| p.torrent == index && p.is_connected())
        {
            let unchoke = peer.peer_interested && slots > 0;
            if unchoke {
                slots -= 1;
            }
            if unchoke == peer.am_choking {
                peer.am_choking = !unchoke;
                let message = if unchoke {
                    PeerMessage::Unchoke
                } else {
                    PeerMessage::Choke
                };
                self.send_message(peer, message);
            }
        }
    }

    /// Tops up request pipelines of every peer on torrent `index`.
    fn refill(&self, state: &mut SessionState, index: usize) {
        let endpoints: Vec<SocketAddr> = state
            .peers
            .values()
            .filter(|p| p.torrent == index && p.is_connected())
            .map(|p| p.endpoint)
            .collect();
        for endpoint in endpoints {
            self.request_blocks(state, endpoint);
        }
    }

    fn disconnect(
        &self,
        state: &mut SessionState,
        endpoint: SocketAddr,
        reason: CloseReason,
        send_close: bool,
    ) {
        let Some(mut peer) = state.peers.remove(&endpoint) else {
            return;
        };
        if send_close {
            self.send_message(
                &peer,
                PeerMessage::Close {
                    reason: reason.code(),
                },
            );
        }

        let index = peer.torrent;
        let torrent = &mut state.torrents[index];
        for (block, _) in peer.requests.drain(..) {
            torrent.picker.abort_request(&block);
        }
        torrent.picker.remove_peer(&peer.peer_has);

        tracing::debug!("Disconnected {}: {}", endpoint, reason);
        self.post_alert(AlertKind::PeerDisconnected {
            info_hash: Some(peer.info_hash),
            endpoint,
            reason,
        });

        self.run_choker(state, index);
        self.refill(state, index);
    }

    fn ensure_ticking(&self, state: &mut SessionState) {
        if state.ticking || self.aborted.get() {
            return;
        }
        state.ticking = true;

        self.timer.expires_from_now(TICK_INTERVAL);
        let weak = self.weak_self.clone();
        self.timer.async_wait(move |result| {
            if result.is_err() {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.on_tick();
            }
        });
    }

    /// Expires stale handshakes and re-issues timed out requests.
    fn on_tick(&self) {
        if self.aborted.get() {
            return;
        }
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        state.ticking = false;
        let now = self.io.now();

        let stale: Vec<SocketAddr> = state
            .peers
            .values()
            .filter(|p| {
                !p.is_connected()
                    && now.saturating_duration_since(p.since) >= self.settings.handshake_timeout
            })
            .map(|p| p.endpoint)
            .collect();
        for endpoint in stale {
            self.disconnect(state, endpoint, CloseReason::Timeout, false);
        }

        let timeout = self.settings.request_timeout;
        let mut touched = BTreeSet::new();
        for peer in state.peers.values_mut() {
            let torrent = &mut state.torrents[peer.torrent];
            let before = peer.requests.len();
            peer.requests.retain(|(block, sent)| {
                let expired = now.saturating_duration_since(*sent) >= timeout;
                if expired {
                    torrent.picker.abort_request(block);
                }
                !expired
            });
            if peer.requests.len() != before {
                tracing::debug!(
                    "{} requests to {} timed out",
                    before - peer.requests.len(),
                    peer.endpoint
                );
                touched.insert(peer.torrent);
            }
        }
        for index in touched {
            self.refill(state, index);
        }

        let busy = state
            .peers
            .values()
            .any(|p| !p.is_connected() || !p.requests.is_empty());
        if busy {
            self.ensure_ticking(state);
        }
    }

    fn teardown(&self) {
        if self.torn_down.replace(true) {
            return;
        }

        let peers = std::mem::take(&mut self.state.borrow_mut().peers);
        for peer in peers.values() {
            self.send_message(
                peer,
                PeerMessage::Close {
                    reason: CloseReason::Shutdown.code(),
                },
            );
        }
        self.binding.borrow_mut().take();
        self.timer.cancel();
        self.notify.borrow_mut().take();

        tracing::debug!(
            "Session at {} torn down, closed {} connections",
            self.listen_endpoint(),
            peers.len()
        );
    }
}
