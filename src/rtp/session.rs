use std::net::SocketAddr;

use bytes::{BufMut, BytesMut};
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::error::{Result, RtpMidiError};
use crate::util::clock::MediaClock;

use super::packet::{RtpHeader, RtpPacketInfo};
use super::peer::{RtpPeer, SequenceCheck, SequenceNumber};

/// An RTP session: one UDP endpoint, a local ssrc, a media clock and a
/// table of peers indexed by ssrc and by network address.
///
/// All I/O goes through zero-timeout readiness probes (`try_send_to` /
/// `try_recv_from`); the session never blocks and is driven entirely by
/// its owner.
pub struct RtpSession {
    socket: UdpSocket,
    ssrc: u32,
    clock: MediaClock,
    peers: FxHashMap<u32, RtpPeer>,
    peers_by_addr: FxHashMap<SocketAddr, u32>,
}

impl RtpSession {
    /// Datagrams larger than this are truncated by the receive buffer;
    /// an RTP-MIDI payload never comes close to a full Ethernet frame.
    const RECEIVE_BUFFER_LEN: usize = 1500;

    pub fn new(socket: UdpSocket, clock: MediaClock) -> RtpSession {
        RtpSession {
            socket,
            ssrc: rand::random(),
            clock,
            peers: FxHashMap::default(),
            peers_by_addr: FxHashMap::default(),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn clock(&self) -> &MediaClock {
        &self.clock
    }

    /// Current local time in timestamp units.
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Register a peer. A colliding local ssrc is re-rolled, the local
    /// ssrc must differ from every peer's. Re-adding a known ssrc updates
    /// the peer's address and keeps its sequence state.
    pub fn add_peer(&mut self, ssrc: u32, address: SocketAddr) {
        while self.ssrc == ssrc {
            self.ssrc = rand::random();
            debug!("local ssrc collided with peer {:08x}, re-rolled to {:08x}", ssrc, self.ssrc);
        }

        if let Some(existing) = self.peers.get_mut(&ssrc) {
            let old_address = existing.address();
            if old_address != address {
                debug!("peer {:08x} moved from {} to {}", ssrc, old_address, address);
                self.peers_by_addr.remove(&old_address);
                self.peers_by_addr.insert(address, ssrc);
                *existing = RtpPeer::new(ssrc, address);
            }
            return;
        }

        debug!("adding peer {:08x} at {}", ssrc, address);
        self.peers.insert(ssrc, RtpPeer::new(ssrc, address));
        self.peers_by_addr.insert(address, ssrc);
    }

    pub fn remove_peer(&mut self, ssrc: u32) -> Result<RtpPeer> {
        let peer = self.peers.remove(&ssrc).ok_or_else(|| {
            RtpMidiError::no_peer(format!("with ssrc {:08x}", ssrc))
        })?;
        self.peers_by_addr.remove(&peer.address());
        debug!("removed peer {:08x} at {}", ssrc, peer.address());
        Ok(peer)
    }

    pub fn find_peer_by_ssrc(&self, ssrc: u32) -> Option<&RtpPeer> {
        self.peers.get(&ssrc)
    }

    pub fn find_peer_by_ssrc_mut(&mut self, ssrc: u32) -> Option<&mut RtpPeer> {
        self.peers.get_mut(&ssrc)
    }

    pub fn find_peer_by_address(&self, address: SocketAddr) -> Option<&RtpPeer> {
        self.peers_by_addr
            .get(&address)
            .and_then(|ssrc| self.peers.get(ssrc))
    }

    pub fn peers(&self) -> impl Iterator<Item = &RtpPeer> {
        self.peers.values()
    }

    pub fn peer_ssrcs(&self) -> Vec<u32> {
        self.peers.keys().copied().collect()
    }

    /// Wrap `payload` in an RTP header and transmit it to the peer.
    ///
    /// Returns the sequence number the packet was sent with, or `None`
    /// when the socket is not writable right now (the peer's sequence is
    /// not consumed in that case).
    pub fn send_payload(&mut self, ssrc: u32, payload: &[u8]) -> Result<Option<SequenceNumber>> {
        let timestamp = self.clock.now() as u32;
        let local_ssrc = self.ssrc;

        let peer = self.peers.get_mut(&ssrc).ok_or_else(|| {
            RtpMidiError::no_peer(format!("with ssrc {:08x}", ssrc))
        })?;

        let sequence = peer.send_sequence();
        let header = RtpHeader::new(local_ssrc, sequence, timestamp);

        let mut buf = BytesMut::with_capacity(header.serialized_len() + payload.len());
        header.ser(&mut buf);
        buf.put_slice(payload);

        match self.socket.try_send_to(&buf, peer.address()) {
            Ok(_) => {
                peer.advance_send_sequence();
                trace!("sent {} payload bytes to peer {:08x} as {:?}", payload.len(), ssrc, header);
                Ok(Some(sequence))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Non-blocking raw datagram send, for the session engine's control
    /// traffic on the data port. Returns false when the socket is not
    /// writable.
    pub fn try_send_raw(&self, payload: &[u8], to: SocketAddr) -> Result<bool> {
        match self.socket.try_send_to(payload, to) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Non-blocking raw datagram receive. Returns `None` when no datagram
    /// is ready.
    pub fn try_recv_raw(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        match self.socket.try_recv_from(buf) {
            Ok((len, from)) => Ok(Some((len, from))),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read and parse one RTP packet if a datagram is ready.
    pub fn try_receive(&mut self) -> Result<Option<RtpPacketInfo>> {
        let mut buf = [0u8; Self::RECEIVE_BUFFER_LEN];
        let (len, from) = match self.try_recv_raw(&mut buf)? {
            Some(x) => x,
            None => return Ok(None),
        };
        self.receive_datagram(&buf[..len], from).map(Some)
    }

    /// Parse a datagram that was already read from the socket.
    ///
    /// Validates the RTP version, strips padding, resolves the peer by
    /// source address and applies the stale/reordering rule. An unknown
    /// source is *not* an error: the packet is handed up with
    /// `from_known_peer == false` and the session engine decides whether
    /// to accept it.
    pub fn receive_datagram(&mut self, datagram: &[u8], from: SocketAddr) -> Result<RtpPacketInfo> {
        let mut parse = datagram;
        let header = RtpHeader::deser(&mut parse)?;

        let mut payload = parse.to_vec();
        let mut pad_count = 0u8;
        if header.padding {
            pad_count = *payload.last().ok_or_else(|| {
                RtpMidiError::protocol_violation("padded packet with empty payload")
            })?;
            if pad_count == 0 || pad_count as usize > payload.len() {
                return Err(RtpMidiError::protocol_violation(format!(
                    "padding count {} exceeds payload of {} bytes",
                    pad_count,
                    payload.len()
                )));
            }
            payload.truncate(payload.len() - pad_count as usize);
        }

        let from_known_peer = match self.peers_by_addr.get(&from) {
            Some(&peer_ssrc) => {
                let peer = self
                    .peers
                    .get_mut(&peer_ssrc)
                    .expect("address index points to a live peer");
                if peer.note_received(header.sequence_number) == SequenceCheck::Stale {
                    return Err(RtpMidiError::protocol_violation(format!(
                        "stale packet {} from peer {:08x}",
                        header.sequence_number, peer_ssrc
                    )));
                }
                true
            }
            None => {
                trace!("RTP packet from unknown source {}", from);
                false
            }
        };

        Ok(RtpPacketInfo {
            ssrc: header.ssrc,
            address: from,
            from_known_peer,
            marker: header.marker,
            payload_type: header.payload_type,
            sequence_number: header.sequence_number,
            timestamp: header.timestamp,
            padding: pad_count,
            csrc: header.csrc,
            payload,
        })
    }
}
