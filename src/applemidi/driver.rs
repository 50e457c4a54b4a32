use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, RtpMidiError};
use crate::message::queue::MessageQueue;
use crate::message::MidiMessage;
use crate::rtp::journal::SendJournal;
use crate::rtp::midi::RtpMidiSession;
use crate::rtp::peer::SequenceNumber;
use crate::rtp::session::RtpSession;
use crate::util::clock::MediaClock;

use super::command::{AppleMidiCommand, FeedbackData, SessionDetails, SyncData, PROTOCOL_VERSION};
use super::config::DriverConfig;
use super::sync::{ClockSync, SyncOutcome};

/// Upstream consumer of inbound MIDI messages. Registered with
/// [`AppleMidiDriver::set_message_handler`]; due messages are handed over
/// during `tick_idle`.
pub trait MessageHandler {
    fn on_message(&mut self, message: MidiMessage) -> Result<()>;
}

/// Decides whether to accept an incoming invitation.
pub trait InvitationPolicy {
    fn accept(&mut self, invitation: &SessionDetails, from: SocketAddr) -> bool;
}

/// The default policy: accept every invitation.
pub struct AcceptAll;

impl InvitationPolicy for AcceptAll {
    fn accept(&mut self, _invitation: &SessionDetails, _from: SocketAddr) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketKind {
    Control,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvitationPhase {
    AwaitingControlAccept,
    AwaitingDataAccept,
}

/// An invitation we initiated that has not completed yet.
struct PendingInvitation {
    token: u32,
    control_addr: SocketAddr,
    data_addr: SocketAddr,
    phase: InvitationPhase,
    sent_at: Instant,
    retries: u32,
}

/// Engine-side state attached to a connected peer.
struct PeerState {
    control_addr: SocketAddr,
    sync: ClockSync,
    last_feedback_at: Option<Instant>,
    feedback_dirty: bool,
}

impl PeerState {
    fn new(control_addr: SocketAddr) -> PeerState {
        PeerState {
            control_addr,
            sync: ClockSync::new(),
            last_feedback_at: None,
            feedback_dirty: false,
        }
    }
}

/// The AppleMIDI session driver.
///
/// Owns the control socket on port `P` and, through its [`RtpSession`],
/// the data socket on `P + 1`. The host drives it:
///
/// * [`tick_receive`](Self::tick_receive) drains ready datagrams from both
///   sockets,
/// * [`tick_send`](Self::tick_send) drains the out-queue towards all
///   connected peers,
/// * [`tick_idle`](Self::tick_idle) delivers due inbound messages, flushes
///   receiver feedback, re-synchronizes clocks and retransmits unanswered
///   invitations.
///
/// Everything is single-threaded and non-blocking; dropping the driver
/// releases both sockets and all peers.
pub struct AppleMidiDriver {
    config: DriverConfig,
    control_socket: UdpSocket,
    token: u32,
    rtp: RtpSession,
    rtp_midi: RtpMidiSession,
    in_queue: MessageQueue,
    out_queue: MessageQueue,
    peer_states: FxHashMap<u32, PeerState>,
    pending_invitations: Vec<PendingInvitation>,
    policy: Box<dyn InvitationPolicy>,
    handler: Option<Box<dyn MessageHandler>>,
}

impl AppleMidiDriver {
    const RECEIVE_BUFFER_LEN: usize = 1500;

    /// Bind the control socket to `config.port` and the data socket to
    /// `config.port + 1` on all IPv4 interfaces.
    pub async fn bind(config: DriverConfig) -> anyhow::Result<AppleMidiDriver> {
        config.validate()?;

        let control_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port)).await?;
        let data_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port + 1)).await?;
        info!(
            "session '{}' listening on control port {}, data port {}",
            config.name,
            config.port,
            config.port + 1
        );

        let clock = MediaClock::new(config.timestamp_rate);
        Ok(AppleMidiDriver {
            token: rand::random(),
            rtp: RtpSession::new(data_socket, clock),
            rtp_midi: RtpMidiSession::new(config.journal_capacity),
            in_queue: MessageQueue::with_capacity(config.in_queue_capacity),
            out_queue: MessageQueue::with_capacity(config.out_queue_capacity),
            peer_states: FxHashMap::default(),
            pending_invitations: Vec::new(),
            policy: Box::new(AcceptAll),
            handler: None,
            control_socket,
            config,
        })
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn local_ssrc(&self) -> u32 {
        self.rtp.ssrc()
    }

    pub fn rtp_session(&self) -> &RtpSession {
        &self.rtp
    }

    pub fn journal(&self, ssrc: u32) -> Option<&SendJournal> {
        self.rtp_midi.journal(ssrc)
    }

    /// Number of invitations we initiated that are still unanswered.
    pub fn pending_invitation_count(&self) -> usize {
        self.pending_invitations.len()
    }

    pub fn set_message_handler(&mut self, handler: Box<dyn MessageHandler>) {
        self.handler = Some(handler);
    }

    pub fn set_invitation_policy(&mut self, policy: Box<dyn InvitationPolicy>) {
        self.policy = policy;
    }

    /// Move the session to a different port pair. Rebinding tears down all
    /// peers: they negotiated their session on the old ports.
    pub async fn set_port(&mut self, port: u16) -> anyhow::Result<()> {
        if port == self.config.port {
            return Ok(());
        }
        let mut config = self.config.clone();
        config.port = port;
        config.validate()?;

        let control_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        let data_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port + 1)).await?;

        self.control_socket = control_socket;
        self.rtp = RtpSession::new(data_socket, MediaClock::new(config.timestamp_rate));
        self.rtp_midi = RtpMidiSession::new(config.journal_capacity);
        self.peer_states.clear();
        self.pending_invitations.clear();
        self.config = config;
        info!("rebound to control port {}, data port {}", port, port + 1);
        Ok(())
    }

    /// Queue an outgoing message; it is sent on the next `tick_send`.
    pub fn send(&mut self, message: MidiMessage) -> Result<()> {
        self.out_queue.push(message, 0)
    }

    /// Pop one inbound message. Only needed when no
    /// [`MessageHandler`] is registered.
    pub fn recv(&mut self) -> Option<MidiMessage> {
        self.in_queue.pop().map(|queued| queued.message)
    }

    /// Invite the peer listening on `port` (control) / `port + 1` (data)
    /// into the session.
    pub fn add_peer(&mut self, host: IpAddr, port: u16) -> Result<()> {
        let data_port = port.checked_add(1).ok_or_else(|| {
            RtpMidiError::invalid_argument("peer control port must be below 65535")
        })?;
        let control_addr = SocketAddr::new(host, port);
        let data_addr = SocketAddr::new(host, data_port);

        let invitation = AppleMidiCommand::Invitation(self.session_details());
        self.send_command(SocketKind::Control, &invitation, control_addr)?;
        debug!("invited {}", control_addr);

        self.pending_invitations.push(PendingInvitation {
            token: self.token,
            control_addr,
            data_addr,
            phase: InvitationPhase::AwaitingControlAccept,
            sent_at: Instant::now(),
            retries: 0,
        });
        Ok(())
    }

    /// End the session with the peer at `port` (control): send `BY` and
    /// drop all state for it.
    pub fn remove_peer(&mut self, host: IpAddr, port: u16) -> Result<()> {
        let data_port = port.checked_add(1).ok_or_else(|| {
            RtpMidiError::invalid_argument("peer control port must be below 65535")
        })?;
        let data_addr = SocketAddr::new(host, data_port);

        let ssrc = self
            .rtp
            .find_peer_by_address(data_addr)
            .map(|peer| peer.ssrc())
            .ok_or_else(|| RtpMidiError::no_peer(format!("at {}", data_addr)))?;

        let control_addr = self
            .peer_states
            .get(&ssrc)
            .map(|state| state.control_addr)
            .unwrap_or_else(|| SocketAddr::new(host, port));

        let bye = AppleMidiCommand::EndSession(self.session_details());
        if let Err(e) = self.send_command(SocketKind::Control, &bye, control_addr) {
            warn!("failed to send BY to {}: {}", control_addr, e);
        }

        self.drop_peer(ssrc);
        info!("ended session with peer {:08x} at {}", ssrc, data_addr);
        Ok(())
    }

    /// Begin a clock synchronization round with a connected peer.
    pub fn start_sync(&mut self, ssrc: u32) -> Result<()> {
        let at = Instant::now();
        let now = self.rtp.now();
        let local_ssrc = self.rtp.ssrc();

        let peer_addr = self
            .rtp
            .find_peer_by_ssrc(ssrc)
            .map(|peer| peer.address())
            .ok_or_else(|| RtpMidiError::no_peer(format!("with ssrc {:08x}", ssrc)))?;
        let state = self
            .peer_states
            .get_mut(&ssrc)
            .ok_or_else(|| RtpMidiError::no_peer(format!("with ssrc {:08x}", ssrc)))?;

        let ck0 = state.sync.begin(local_ssrc, now, at);
        self.send_command(SocketKind::Data, &AppleMidiCommand::Sync(ck0), peer_addr)?;
        Ok(())
    }

    /// Drain ready datagrams from both sockets, at most
    /// `receive_batch` per socket.
    pub fn tick_receive(&mut self) -> Result<()> {
        let mut buf = [0u8; Self::RECEIVE_BUFFER_LEN];

        for _ in 0..self.config.receive_batch {
            let (len, from) = match self.control_socket.try_recv_from(&mut buf) {
                Ok(x) => x,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("control socket receive error: {}", e);
                    break;
                }
            };
            let datagram = &buf[..len];
            if AppleMidiCommand::matches_signature(datagram) {
                self.handle_command(SocketKind::Control, datagram, from);
            } else {
                // the control socket must never see RTP-MIDI frames
                warn!(
                    "non-AppleMIDI datagram of {} bytes from {} on the control socket, dropping",
                    len, from
                );
            }
        }

        for _ in 0..self.config.receive_batch {
            let (len, from) = match self.rtp.try_recv_raw(&mut buf) {
                Ok(Some(x)) => x,
                Ok(None) => break,
                Err(e) => {
                    warn!("data socket receive error: {}", e);
                    break;
                }
            };
            let datagram = &buf[..len];
            if AppleMidiCommand::matches_signature(datagram) {
                self.handle_command(SocketKind::Data, datagram, from);
            } else {
                self.handle_rtp_datagram(datagram, from);
            }
        }

        Ok(())
    }

    /// Drain the out-queue in batches of `send_batch` messages, one
    /// RTP-MIDI payload per batch, sent to every connected peer.
    pub fn tick_send(&mut self) -> Result<()> {
        while !self.out_queue.is_empty() {
            let mut batch = Vec::with_capacity(self.config.send_batch);
            while batch.len() < self.config.send_batch {
                match self.out_queue.pop() {
                    Some(queued) => batch.push(queued.message),
                    None => break,
                }
            }

            if self.rtp.peers().next().is_none() {
                trace!("no connected peers, dropping a batch of {} messages", batch.len());
                continue;
            }

            match self.rtp_midi.send(&mut self.rtp, &batch) {
                Ok(true) => {}
                Ok(false) => break, // backpressure, continue next tick
                Err(e) => {
                    warn!("failed to send a message batch: {}", e);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Housekeeping: deliver due inbound messages, flush receiver
    /// feedback, keep clocks in sync and retransmit unanswered
    /// invitations.
    pub fn tick_idle(&mut self) -> Result<()> {
        let at = Instant::now();
        let now = self.rtp.now();

        self.deliver_due_messages(now);
        self.flush_receiver_feedback(at);
        self.resync_peers(at, now);
        self.retry_invitations(at);
        Ok(())
    }

    fn session_details(&self) -> SessionDetails {
        SessionDetails {
            version: PROTOCOL_VERSION,
            token: self.token,
            ssrc: self.rtp.ssrc(),
            name: self.config.name.clone(),
        }
    }

    fn send_command(
        &self,
        kind: SocketKind,
        command: &AppleMidiCommand,
        to: SocketAddr,
    ) -> Result<bool> {
        let mut buf = BytesMut::new();
        command.ser(&mut buf);

        let sent = match kind {
            SocketKind::Control => match self.control_socket.try_send_to(&buf, to) {
                Ok(_) => true,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
                Err(e) => return Err(e.into()),
            },
            SocketKind::Data => self.rtp.try_send_raw(&buf, to)?,
        };
        if !sent {
            debug!("{:?} socket not writable, {:?} to {} not sent", kind, command, to);
        }
        Ok(sent)
    }

    fn handle_command(&mut self, kind: SocketKind, datagram: &[u8], from: SocketAddr) {
        let command = match AppleMidiCommand::deser(&mut &datagram[..]) {
            Ok(command) => command,
            Err(e) => {
                warn!("undecodable control packet from {}: {}", from, e);
                return;
            }
        };
        trace!("received {:?} from {} on the {:?} socket", command, from, kind);

        match command {
            AppleMidiCommand::Invitation(details) => self.on_invitation(kind, details, from),
            AppleMidiCommand::InvitationAccepted(details) => {
                self.on_invitation_accepted(details, from)
            }
            AppleMidiCommand::InvitationRejected(details) => {
                self.on_invitation_rejected(details, from)
            }
            AppleMidiCommand::EndSession(details) => self.on_end_session(details),
            AppleMidiCommand::Sync(data) => self.on_sync(kind, data, from),
            AppleMidiCommand::ReceiverFeedback(data) => self.on_receiver_feedback(data),
        }
    }

    fn on_invitation(&mut self, kind: SocketKind, details: SessionDetails, from: SocketAddr) {
        let reply_details = SessionDetails {
            version: PROTOCOL_VERSION,
            token: details.token,
            ssrc: self.rtp.ssrc(),
            name: String::new(),
        };

        if !self.policy.accept(&details, from) {
            info!("rejecting invitation from '{}' ({:08x}) at {}", details.name, details.ssrc, from);
            let reply = AppleMidiCommand::InvitationRejected(reply_details);
            if let Err(e) = self.send_command(kind, &reply, from) {
                warn!("failed to send NO to {}: {}", from, e);
            }
            return;
        }

        if kind == SocketKind::Data {
            // the second, data-port invitation completes the handshake
            self.rtp.add_peer(details.ssrc, from);
            let control_addr = SocketAddr::new(from.ip(), from.port().saturating_sub(1));
            self.peer_states
                .insert(details.ssrc, PeerState::new(control_addr));
            info!("accepted invitation from '{}' ({:08x}) at {}", details.name, details.ssrc, from);
        }

        let reply = AppleMidiCommand::InvitationAccepted(reply_details);
        if let Err(e) = self.send_command(kind, &reply, from) {
            warn!("failed to send OK to {}: {}", from, e);
        }
    }

    fn on_invitation_accepted(&mut self, details: SessionDetails, from: SocketAddr) {
        let index = self.pending_invitations.iter().position(|pending| {
            pending.token == details.token
                && match pending.phase {
                    InvitationPhase::AwaitingControlAccept => pending.control_addr == from,
                    InvitationPhase::AwaitingDataAccept => pending.data_addr == from,
                }
        });
        let Some(index) = index else {
            debug!("OK from {} does not match a pending invitation, ignoring", from);
            return;
        };

        match self.pending_invitations[index].phase {
            InvitationPhase::AwaitingControlAccept => {
                let pending = &mut self.pending_invitations[index];
                pending.phase = InvitationPhase::AwaitingDataAccept;
                pending.sent_at = Instant::now();
                pending.retries = 0;
                let data_addr = pending.data_addr;

                debug!("control invitation to {} accepted by {:08x}, inviting data port", from, details.ssrc);
                let invitation = AppleMidiCommand::Invitation(self.session_details());
                if let Err(e) = self.send_command(SocketKind::Data, &invitation, data_addr) {
                    warn!("failed to invite data port {}: {}", data_addr, e);
                }
            }
            InvitationPhase::AwaitingDataAccept => {
                let pending = self.pending_invitations.remove(index);
                self.rtp.add_peer(details.ssrc, pending.data_addr);
                self.peer_states
                    .insert(details.ssrc, PeerState::new(pending.control_addr));
                info!("peer '{}' ({:08x}) at {} joined the session", details.name, details.ssrc, pending.data_addr);

                // synchronize clocks right away
                if let Err(e) = self.start_sync(details.ssrc) {
                    warn!("failed to start clock sync with {:08x}: {}", details.ssrc, e);
                }
            }
        }
    }

    fn on_invitation_rejected(&mut self, details: SessionDetails, from: SocketAddr) {
        let before = self.pending_invitations.len();
        self.pending_invitations
            .retain(|pending| pending.token != details.token);
        if self.pending_invitations.len() < before {
            info!("invitation rejected by '{}' ({:08x}) at {}", details.name, details.ssrc, from);
        } else {
            debug!("NO from {} does not match a pending invitation, ignoring", from);
        }
    }

    fn on_end_session(&mut self, details: SessionDetails) {
        if self.rtp.find_peer_by_ssrc(details.ssrc).is_none() {
            debug!("BY for unknown peer {:08x}, ignoring", details.ssrc);
            return;
        }
        self.drop_peer(details.ssrc);
        info!("peer {:08x} ended the session", details.ssrc);
    }

    fn on_sync(&mut self, kind: SocketKind, data: SyncData, from: SocketAddr) {
        if data.ssrc == self.rtp.ssrc() {
            warn!("CK carries our own ssrc, dropping an echo");
            return;
        }

        let now = self.rtp.now();
        let at = Instant::now();
        let local_ssrc = self.rtp.ssrc();

        let Some(state) = self.peer_states.get_mut(&data.ssrc) else {
            debug!("CK from unknown peer {:08x}, ignoring", data.ssrc);
            return;
        };

        match state.sync.on_sync(local_ssrc, &data, now, at) {
            SyncOutcome::Reply(reply) => {
                if let Err(e) = self.send_command(kind, &AppleMidiCommand::Sync(reply), from) {
                    warn!("failed to answer CK{} from {}: {}", data.count, from, e);
                }
            }
            SyncOutcome::Complete { offset, reply } => {
                if let Some(peer) = self.rtp.find_peer_by_ssrc_mut(data.ssrc) {
                    peer.set_timestamp_diff(offset);
                }
                debug!("clock sync with {:08x} complete, offset {} timestamp units", data.ssrc, offset);
                if let Some(reply) = reply {
                    if let Err(e) = self.send_command(kind, &AppleMidiCommand::Sync(reply), from) {
                        warn!("failed to close sync round with {}: {}", from, e);
                    }
                }
            }
            SyncOutcome::Ignored => {}
        }
    }

    fn on_receiver_feedback(&mut self, data: FeedbackData) {
        if self.rtp.find_peer_by_ssrc(data.ssrc).is_none() {
            debug!("RS from unknown peer {:08x}, ignoring", data.ssrc);
            return;
        }
        let up_to = SequenceNumber::from_raw(data.sequence as u16);
        self.rtp_midi.truncate_journal(data.ssrc, up_to);
        trace!("peer {:08x} acknowledged everything up to {}", data.ssrc, up_to);
    }

    fn handle_rtp_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let info = match self.rtp.receive_datagram(datagram, from) {
            Ok(info) => info,
            Err(e) => {
                warn!("dropping RTP datagram from {}: {}", from, e);
                return;
            }
        };
        if !info.from_known_peer {
            warn!("RTP-MIDI from unknown source {}, dropping", from);
            return;
        }

        let messages = match self.rtp_midi.receive(&info) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("dropping undecodable RTP-MIDI payload from {}: {}", from, e);
                return;
            }
        };

        let Some((peer_ssrc, diff)) = self
            .rtp
            .find_peer_by_address(from)
            .map(|peer| (peer.ssrc(), peer.timestamp_diff()))
        else {
            return;
        };

        // translate the peer's timestamp into our clock
        let local_timestamp = (info.timestamp as i64 - diff).max(0) as u64;
        for message in messages {
            if let Err(e) = self.in_queue.push(message, local_timestamp) {
                warn!("in-queue full, dropping an inbound message: {}", e);
            }
        }

        if let Some(state) = self.peer_states.get_mut(&peer_ssrc) {
            state.feedback_dirty = true;
        }
    }

    fn deliver_due_messages(&mut self, now: u64) {
        while let Some(timestamp) = self.in_queue.head_timestamp() {
            if timestamp > now + self.config.latency_budget {
                break;
            }
            let Some(handler) = self.handler.as_mut() else {
                // no handler: the host pops via recv()
                break;
            };
            let queued = self.in_queue.pop().expect("head was just observed");
            if let Err(e) = handler.on_message(queued.message) {
                warn!("upstream rejected an inbound message: {}", e);
            }
        }
    }

    fn flush_receiver_feedback(&mut self, at: Instant) {
        let interval = self.config.feedback_interval;
        let due: Vec<(u32, SocketAddr, u16)> = self
            .peer_states
            .iter()
            .filter_map(|(ssrc, state)| {
                if !state.feedback_dirty {
                    return None;
                }
                if let Some(last) = state.last_feedback_at {
                    if at.duration_since(last) < interval {
                        return None;
                    }
                }
                let sequence = self.rtp.find_peer_by_ssrc(*ssrc)?.recv_sequence()?;
                Some((*ssrc, state.control_addr, sequence.to_raw()))
            })
            .collect();

        for (ssrc, control_addr, sequence) in due {
            let feedback = AppleMidiCommand::ReceiverFeedback(FeedbackData {
                ssrc: self.rtp.ssrc(),
                sequence: sequence as u32,
            });
            match self.send_command(SocketKind::Control, &feedback, control_addr) {
                Ok(true) => {
                    let state = self
                        .peer_states
                        .get_mut(&ssrc)
                        .expect("peer state existed a moment ago");
                    state.last_feedback_at = Some(at);
                    state.feedback_dirty = false;
                    trace!("sent receiver feedback {} to {:08x}", sequence, ssrc);
                }
                Ok(false) => {} // not writable, retried next idle tick
                Err(e) => warn!("failed to send receiver feedback to {:08x}: {}", ssrc, e),
            }
        }
    }

    fn resync_peers(&mut self, at: Instant, now: u64) {
        let local_ssrc = self.rtp.ssrc();
        let sync_timeout = self.config.sync_timeout;
        let resync_interval = self.config.resync_interval;

        let mut rounds = Vec::new();
        for (ssrc, state) in self.peer_states.iter_mut() {
            if state.sync.expire(at, sync_timeout) {
                debug!("sync round with {:08x} timed out", ssrc);
            }
            if state.sync.needs_resync(at, resync_interval) {
                rounds.push((*ssrc, state.sync.begin(local_ssrc, now, at)));
            }
        }

        for (ssrc, ck0) in rounds {
            let Some(peer_addr) = self.rtp.find_peer_by_ssrc(ssrc).map(|p| p.address()) else {
                continue;
            };
            if let Err(e) = self.send_command(SocketKind::Data, &AppleMidiCommand::Sync(ck0), peer_addr) {
                warn!("failed to start sync round with {:08x}: {}", ssrc, e);
            }
        }
    }

    fn retry_invitations(&mut self, at: Instant) {
        let timeout = self.config.invitation_timeout;
        let max_retries = self.config.max_invitation_retries;

        let mut expired = Vec::new();
        let mut resend = Vec::new();
        for (index, pending) in self.pending_invitations.iter_mut().enumerate() {
            if at.duration_since(pending.sent_at) < timeout {
                continue;
            }
            if pending.retries >= max_retries {
                expired.push(index);
                continue;
            }
            pending.retries += 1;
            pending.sent_at = at;
            match pending.phase {
                InvitationPhase::AwaitingControlAccept => {
                    resend.push((SocketKind::Control, pending.control_addr))
                }
                InvitationPhase::AwaitingDataAccept => {
                    resend.push((SocketKind::Data, pending.data_addr))
                }
            }
        }

        for index in expired.into_iter().rev() {
            let pending = self.pending_invitations.remove(index);
            warn!(
                "peer at {} never answered the invitation, declaring it dead",
                pending.control_addr
            );
        }

        for (kind, addr) in resend {
            debug!("retransmitting invitation to {}", addr);
            let invitation = AppleMidiCommand::Invitation(self.session_details());
            if let Err(e) = self.send_command(kind, &invitation, addr) {
                warn!("failed to retransmit invitation to {}: {}", addr, e);
            }
        }
    }

    fn drop_peer(&mut self, ssrc: u32) {
        let _ = self.rtp.remove_peer(ssrc);
        self.rtp_midi.remove_peer(ssrc);
        self.peer_states.remove(&ssrc);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::{Rng, SeedableRng};
    use tokio::time::{sleep, timeout};

    use crate::applemidi::command::SyncData;

    use super::*;

    const PEER_SSRC: u32 = 0xdeadbeef;

    /// Bind a driver on a random free even/odd port pair.
    async fn bind_test_driver() -> AppleMidiDriver {
        loop {
            let port = 20_000 + rand::random::<u16>() % 20_000;
            let mut config = DriverConfig::new(port);
            config.name = "test".to_string();
            if let Ok(driver) = AppleMidiDriver::bind(config).await {
                return driver;
            }
        }
    }

    /// The remote end of a session, played by hand in the tests.
    struct FakePeer {
        control: UdpSocket,
        data: UdpSocket,
    }

    impl FakePeer {
        async fn bind() -> FakePeer {
            loop {
                let port = 40_000 + rand::random::<u16>() % 20_000;
                let Ok(control) = UdpSocket::bind(("127.0.0.1", port)).await else {
                    continue;
                };
                let Ok(data) = UdpSocket::bind(("127.0.0.1", port + 1)).await else {
                    continue;
                };
                return FakePeer { control, data };
            }
        }

        fn control_port(&self) -> u16 {
            self.control.local_addr().unwrap().port()
        }

        async fn recv_command(socket: &UdpSocket) -> (AppleMidiCommand, SocketAddr) {
            let mut buf = [0u8; 1500];
            let (len, from) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
                .await
                .expect("timed out waiting for a datagram")
                .unwrap();
            let command = AppleMidiCommand::deser(&mut &buf[..len]).unwrap();
            (command, from)
        }

        async fn recv_control(&self) -> (AppleMidiCommand, SocketAddr) {
            Self::recv_command(&self.control).await
        }

        async fn recv_data(&self) -> (AppleMidiCommand, SocketAddr) {
            Self::recv_command(&self.data).await
        }

        async fn recv_data_raw(&self) -> (Vec<u8>, SocketAddr) {
            let mut buf = [0u8; 1500];
            let (len, from) = timeout(Duration::from_secs(2), self.data.recv_from(&mut buf))
                .await
                .expect("timed out waiting for a datagram")
                .unwrap();
            (buf[..len].to_vec(), from)
        }

        async fn send_control(&self, command: &AppleMidiCommand, to: SocketAddr) {
            let mut buf = BytesMut::new();
            command.ser(&mut buf);
            self.control.send_to(&buf, to).await.unwrap();
        }

        async fn send_data(&self, command: &AppleMidiCommand, to: SocketAddr) {
            let mut buf = BytesMut::new();
            command.ser(&mut buf);
            self.data.send_to(&buf, to).await.unwrap();
        }

        fn accept(&self, token: u32) -> AppleMidiCommand {
            AppleMidiCommand::InvitationAccepted(SessionDetails {
                version: PROTOCOL_VERSION,
                token,
                ssrc: PEER_SSRC,
                name: "fake".to_string(),
            })
        }
    }

    /// Tick the driver until a command shows up on the given fake-peer
    /// socket.
    async fn drive_until_command(
        driver: &mut AppleMidiDriver,
        socket: &UdpSocket,
    ) -> (AppleMidiCommand, SocketAddr) {
        let mut buf = [0u8; 1500];
        for _ in 0..200 {
            driver.tick_receive().unwrap();
            if let Ok(Ok((len, from))) =
                timeout(Duration::from_millis(10), socket.recv_from(&mut buf)).await
            {
                let command = AppleMidiCommand::deser(&mut &buf[..len]).unwrap();
                return (command, from);
            }
        }
        panic!("expected a command that never arrived");
    }

    /// Addresses of the driver's two sockets, as seen by the fake peer.
    struct DriverAddrs {
        control: SocketAddr,
        data: SocketAddr,
    }

    /// Run the full two-step invitation handshake against `peer` and drain
    /// the clock sync round the driver starts on completion.
    async fn establish(driver: &mut AppleMidiDriver, peer: &FakePeer) -> DriverAddrs {
        driver
            .add_peer(IpAddr::V4(Ipv4Addr::LOCALHOST), peer.control_port())
            .unwrap();

        // S1: one IN datagram on the peer's control port
        let (command, driver_control) = peer.recv_control().await;
        let token = match command {
            AppleMidiCommand::Invitation(details) => {
                assert_eq!(details.name, "test");
                assert_eq!(details.version, PROTOCOL_VERSION);
                assert_eq!(details.ssrc, driver.local_ssrc());
                details.token
            }
            other => panic!("expected IN, got {:?}", other),
        };
        peer.send_control(&peer.accept(token), driver_control).await;

        // the driver follows up with the data-port invitation
        let (command, driver_data) = drive_until_command(driver, &peer.data).await;
        match command {
            AppleMidiCommand::Invitation(details) => assert_eq!(details.token, token),
            other => panic!("expected IN on the data port, got {:?}", other),
        }
        peer.send_data(&peer.accept(token), driver_data).await;

        // accepting makes the peer visible and starts clock sync
        let (command, _) = drive_until_command(driver, &peer.data).await;
        match command {
            AppleMidiCommand::Sync(data) => assert_eq!(data.count, 0),
            other => panic!("expected CK0, got {:?}", other),
        }
        assert!(driver.rtp_session().find_peer_by_ssrc(PEER_SSRC).is_some());

        DriverAddrs {
            control: driver_control,
            data: driver_data,
        }
    }

    async fn connected_pair() -> (AppleMidiDriver, FakePeer, DriverAddrs) {
        let mut driver = bind_test_driver().await;
        let peer = FakePeer::bind().await;
        let addrs = establish(&mut driver, &peer).await;
        (driver, peer, addrs)
    }

    fn rtp_datagram(ssrc: u32, sequence: u16, timestamp: u32, payload: &[u8]) -> Vec<u8> {
        let mut datagram = vec![0x80u8, 97];
        datagram.extend_from_slice(&sequence.to_be_bytes());
        datagram.extend_from_slice(&timestamp.to_be_bytes());
        datagram.extend_from_slice(&ssrc.to_be_bytes());
        datagram.extend_from_slice(payload);
        datagram
    }

    #[tokio::test]
    async fn test_invitation() {
        let (driver, _peer, _addrs) = connected_pair().await;

        let peer = driver.rtp_session().find_peer_by_ssrc(PEER_SSRC).unwrap();
        assert_eq!(peer.ssrc(), PEER_SSRC);
    }

    #[tokio::test]
    async fn test_sync_round() {
        let (mut driver, peer, _addrs) = connected_pair().await;

        driver.start_sync(PEER_SSRC).unwrap();
        let (command, driver_data) = peer.recv_data().await;
        let ck0 = match command {
            AppleMidiCommand::Sync(data) => data,
            other => panic!("expected CK0, got {:?}", other),
        };
        assert_eq!(ck0.count, 0);
        assert_eq!(ck0.ssrc, driver.local_ssrc());

        // answer with a wildly different peer clock
        let t2 = 999_999u64;
        peer.send_data(
            &AppleMidiCommand::Sync(SyncData {
                ssrc: PEER_SSRC,
                count: 1,
                timestamp1: ck0.timestamp1,
                timestamp2: t2,
                timestamp3: 0,
            }),
            driver_data,
        )
        .await;

        let (command, _) = drive_until_command(&mut driver, &peer.data).await;
        let ck2 = match command {
            AppleMidiCommand::Sync(data) => data,
            other => panic!("expected CK2, got {:?}", other),
        };
        assert_eq!(ck2.count, 2);
        assert_eq!(ck2.timestamp1, ck0.timestamp1);
        assert_eq!(ck2.timestamp2, t2);

        let (t1, t2, t3) = (ck2.timestamp1 as i64, ck2.timestamp2 as i64, ck2.timestamp3 as i64);
        let expected_offset = (t3 - t1) / 2 + (t2 - t3);
        assert_eq!(
            driver
                .rtp_session()
                .find_peer_by_ssrc(PEER_SSRC)
                .unwrap()
                .timestamp_diff(),
            expected_offset
        );
    }

    #[tokio::test]
    async fn test_send_midi() {
        let (mut driver, peer, _addrs) = connected_pair().await;

        driver.send(MidiMessage::note_on(3, 60, 100).unwrap()).unwrap();
        driver.tick_send().unwrap();

        let (datagram, _) = peer.recv_data_raw().await;
        assert_eq!(datagram.len(), 12 + 3);
        // V=2, no padding, no extension, no csrc
        assert_eq!(datagram[0], 0x80);
        assert_eq!(datagram[1], 97);
        assert_eq!(&datagram[12..], &[0x93, 0x3c, 0x64]);
    }

    #[tokio::test]
    async fn test_receive_midi() {
        let (mut driver, peer, addrs) = connected_pair().await;

        let datagram = rtp_datagram(PEER_SSRC, 1, 0, &[0x83, 0x3c, 0x40]);
        peer.data.send_to(&datagram, addrs.data).await.unwrap();

        let mut received = None;
        for _ in 0..200 {
            driver.tick_receive().unwrap();
            if let Some(message) = driver.recv() {
                received = Some(message);
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }

        let message = received.expect("the note-off never made it to the in-queue");
        assert_eq!(message.encoded().unwrap(), vec![0x83, 0x3c, 0x40]);
    }

    #[tokio::test]
    async fn test_teardown() {
        let (mut driver, peer, addrs) = connected_pair().await;

        peer.send_control(
            &AppleMidiCommand::EndSession(SessionDetails {
                version: PROTOCOL_VERSION,
                token: 0,
                ssrc: PEER_SSRC,
                name: String::new(),
            }),
            addrs.control,
        )
        .await;

        for _ in 0..200 {
            driver.tick_receive().unwrap();
            if driver.rtp_session().find_peer_by_ssrc(PEER_SSRC).is_none() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("peer survived the BY command");
    }

    #[tokio::test]
    async fn test_receiver_feedback_truncates_journal() {
        let (mut driver, peer, addrs) = connected_pair().await;

        for key in 0..5 {
            driver.send(MidiMessage::note_on(0, 60 + key, 100).unwrap()).unwrap();
            driver.tick_send().unwrap();
        }
        assert_eq!(
            driver.journal(PEER_SSRC).unwrap().sequences(),
            (0u16..5).map(SequenceNumber::from_raw).collect::<Vec<_>>()
        );

        peer.send_control(
            &AppleMidiCommand::ReceiverFeedback(FeedbackData {
                ssrc: PEER_SSRC,
                sequence: 2,
            }),
            addrs.control,
        )
        .await;

        for _ in 0..200 {
            driver.tick_receive().unwrap();
            if driver.journal(PEER_SSRC).unwrap().len() == 2 {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            driver.journal(PEER_SSRC).unwrap().sequences(),
            vec![SequenceNumber::from_raw(3), SequenceNumber::from_raw(4)]
        );
    }

    #[tokio::test]
    async fn test_feedback_is_emitted_for_received_packets() {
        let (mut driver, peer, addrs) = connected_pair().await;

        let datagram = rtp_datagram(PEER_SSRC, 7, 0, &[0xf8]);
        peer.data.send_to(&datagram, addrs.data).await.unwrap();

        let mut buf = [0u8; 1500];
        for _ in 0..200 {
            driver.tick_receive().unwrap();
            driver.tick_idle().unwrap();
            if let Ok(Ok((len, _))) =
                timeout(Duration::from_millis(10), peer.control.recv_from(&mut buf)).await
            {
                let command = AppleMidiCommand::deser(&mut &buf[..len]).unwrap();
                match command {
                    AppleMidiCommand::ReceiverFeedback(data) => {
                        assert_eq!(data.ssrc, driver.local_ssrc());
                        assert_eq!(data.sequence, 7);
                        return;
                    }
                    other => panic!("expected RS, got {:?}", other),
                }
            }
        }
        panic!("no receiver feedback was sent");
    }

    #[tokio::test]
    async fn test_responder_accepts_invitations() {
        let mut driver = bind_test_driver().await;
        let peer = FakePeer::bind().await;
        let driver_control: SocketAddr =
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), driver.port());
        let driver_data: SocketAddr =
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), driver.port() + 1);

        let invitation = |token| {
            AppleMidiCommand::Invitation(SessionDetails {
                version: PROTOCOL_VERSION,
                token,
                ssrc: PEER_SSRC,
                name: "remote".to_string(),
            })
        };

        peer.send_control(&invitation(77), driver_control).await;
        let (reply, _) = drive_until_command(&mut driver, &peer.control).await;
        match reply {
            AppleMidiCommand::InvitationAccepted(details) => {
                assert_eq!(details.token, 77);
                assert_eq!(details.ssrc, driver.local_ssrc());
                assert_eq!(details.name, "");
            }
            other => panic!("expected OK, got {:?}", other),
        }

        peer.send_data(&invitation(77), driver_data).await;
        let (reply, _) = drive_until_command(&mut driver, &peer.data).await;
        assert!(matches!(reply, AppleMidiCommand::InvitationAccepted(_)));

        let registered = driver.rtp_session().find_peer_by_ssrc(PEER_SSRC).unwrap();
        assert_eq!(registered.address(), peer.data.local_addr().unwrap());
    }

    struct RejectAll;

    impl InvitationPolicy for RejectAll {
        fn accept(&mut self, _invitation: &SessionDetails, _from: SocketAddr) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_responder_honors_rejection_policy() {
        let mut driver = bind_test_driver().await;
        driver.set_invitation_policy(Box::new(RejectAll));

        let peer = FakePeer::bind().await;
        let driver_control: SocketAddr =
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), driver.port());

        peer.send_control(
            &AppleMidiCommand::Invitation(SessionDetails {
                version: PROTOCOL_VERSION,
                token: 5,
                ssrc: PEER_SSRC,
                name: "remote".to_string(),
            }),
            driver_control,
        )
        .await;

        let (reply, _) = drive_until_command(&mut driver, &peer.control).await;
        assert!(matches!(reply, AppleMidiCommand::InvitationRejected(_)));
        assert!(driver.rtp_session().find_peer_by_ssrc(PEER_SSRC).is_none());
    }

    #[tokio::test]
    async fn test_invitation_retransmit_and_expiry() {
        let mut driver = loop {
            let port = 20_000 + rand::random::<u16>() % 20_000;
            let mut config = DriverConfig::new(port);
            config.name = "test".to_string();
            config.invitation_timeout = Duration::from_millis(40);
            config.max_invitation_retries = 2;
            if let Ok(driver) = AppleMidiDriver::bind(config).await {
                break driver;
            }
        };
        let peer = FakePeer::bind().await;

        driver
            .add_peer(IpAddr::V4(Ipv4Addr::LOCALHOST), peer.control_port())
            .unwrap();
        let _ = peer.recv_control().await;
        assert_eq!(driver.pending_invitation_count(), 1);

        // the silent peer triggers two retransmits, then is declared dead
        for _ in 0..2 {
            sleep(Duration::from_millis(50)).await;
            driver.tick_idle().unwrap();
            let (command, _) = peer.recv_control().await;
            assert!(matches!(command, AppleMidiCommand::Invitation(_)));
        }

        sleep(Duration::from_millis(50)).await;
        driver.tick_idle().unwrap();
        assert_eq!(driver.pending_invitation_count(), 0);
    }

    struct Collector(std::sync::mpsc::Sender<MidiMessage>);

    impl MessageHandler for Collector {
        fn on_message(&mut self, message: MidiMessage) -> Result<()> {
            self.0.send(message).expect("the test is still listening");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handler_gets_due_messages() {
        let (mut driver, peer, addrs) = connected_pair().await;
        let (tx, rx) = std::sync::mpsc::channel();
        driver.set_message_handler(Box::new(Collector(tx)));

        let datagram = rtp_datagram(PEER_SSRC, 1, 0, &[0x90, 0x40, 0x7f]);
        peer.data.send_to(&datagram, addrs.data).await.unwrap();

        for _ in 0..200 {
            driver.tick_receive().unwrap();
            driver.tick_idle().unwrap();
            if let Ok(message) = rx.try_recv() {
                assert_eq!(message.encoded().unwrap(), vec![0x90, 0x40, 0x7f]);
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("the handler never saw the message");
    }

    #[tokio::test]
    async fn test_malformed_datagrams_never_break_the_driver() {
        let mut driver = bind_test_driver().await;
        let driver_control: SocketAddr =
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), driver.port());
        let driver_data: SocketAddr =
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), driver.port() + 1);

        let chaos = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);

        for i in 0..200 {
            let len = rng.gen_range(0..64);
            let mut datagram = vec![0u8; len];
            rng.fill(&mut datagram[..]);
            // make a fair share look like control traffic
            if len >= 4 && i % 3 == 0 {
                datagram[0] = 0xff;
                datagram[1] = 0xff;
            }
            let target = if i % 2 == 0 { driver_control } else { driver_data };
            chaos.send_to(&datagram, target).await.unwrap();

            driver.tick_receive().unwrap();
            driver.tick_send().unwrap();
            driver.tick_idle().unwrap();
        }

        // the driver is still fully functional: a handshake succeeds
        let peer = FakePeer::bind().await;
        establish(&mut driver, &peer).await;
    }

    #[tokio::test]
    async fn test_set_port_rebinds_and_drops_peers() {
        let (mut driver, _peer, _addrs) = connected_pair().await;
        assert!(driver.rtp_session().find_peer_by_ssrc(PEER_SSRC).is_some());

        let new_port = loop {
            let port = 20_000 + rand::random::<u16>() % 20_000;
            if port != driver.port() && driver.set_port(port).await.is_ok() {
                break port;
            }
        };

        assert_eq!(driver.port(), new_port);
        // peers negotiated on the old port pair are gone
        assert!(driver.rtp_session().find_peer_by_ssrc(PEER_SSRC).is_none());
        assert_eq!(driver.pending_invitation_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_peer_sends_bye() {
        let (mut driver, peer, _addrs) = connected_pair().await;

        driver
            .remove_peer(IpAddr::V4(Ipv4Addr::LOCALHOST), peer.control_port())
            .unwrap();

        let (command, _) = peer.recv_control().await;
        match command {
            AppleMidiCommand::EndSession(details) => {
                assert_eq!(details.ssrc, driver.local_ssrc())
            }
            other => panic!("expected BY, got {:?}", other),
        }
        assert!(driver.rtp_session().find_peer_by_ssrc(PEER_SSRC).is_none());
        assert!(driver
            .remove_peer(IpAddr::V4(Ipv4Addr::LOCALHOST), peer.control_port())
            .is_err());
    }
}
