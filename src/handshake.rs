//! Connection setup. Each side contributes the sequence number of its HELLO, and the stream of
//!  sequenced messages in each direction starts right after it.
//!
//! ```ascii
//! dialer                                   listener
//!   | --- HELLO(s0) ------------------------> |
//!   | <-- HELLO(s1, ack s0) ----------------- |   repeated until acknowledged
//!   | --- ACK(s1) --------------------------> |
//! ```
//!
//! A protocol version mismatch fails the handshake on either side. Undecodable datagrams abort
//!  the current attempt, and the next attempt starts right away.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use crate::acks::Ack;
use crate::buffers::buffer_pool::BufferPool;
use crate::config::Profile;
use crate::datagram_socket::DatagramSocket;
use crate::error::HandshakeError;
use crate::sequence::is_ahead;
use crate::wire_message::{Hello, MessageType, WireMessage, PROTOCOL_VERSION};

/// Result of the listener's side of the handshake
#[derive(Debug)]
pub struct Accepted {
    /// sequence number of the dialer's HELLO
    pub peer_seq: i32,
    /// The dialer's first sequenced message, if it arrived instead of the final ACK. This
    ///  happens when the ACK is lost, and it implies that the dialer is established.
    pub first_message: Option<WireMessage>,
}

fn check_hello(peer_addr: SocketAddr, hello: &Hello, profile: &Profile) -> Result<(), HandshakeError> {
    if hello.version != PROTOCOL_VERSION {
        warn!("{:?}: peer speaks protocol version {}, expected {}", peer_addr, hello.version, PROTOCOL_VERSION);
        return Err(HandshakeError::ProtocolVersion { expected: PROTOCOL_VERSION, actual: hello.version });
    }
    if hello.profile_id != profile.profile_id {
        debug!("{:?}: peer uses profile {}, local profile is {}", peer_addr, hello.profile_id, profile.profile_id);
    }
    Ok(())
}

/// Runs the dialer's side of the handshake, returning the sequence number of the listener's HELLO
pub async fn dial(socket: &dyn DatagramSocket, profile: &Profile, pool: &Arc<BufferPool>, hello_seq: i32) -> Result<i32, HandshakeError> {
    let peer_addr = socket.peer_addr();
    let hello = WireMessage::new_hello(hello_seq, &Hello {
        version: PROTOCOL_VERSION,
        profile_id: profile.profile_id,
        ack: None,
    }, pool)?;

    for attempt in 1..=profile.handshake_retries {
        debug!("{:?}: sending HELLO #{} (attempt {})", peer_addr, hello_seq, attempt);
        socket.send(hello.as_bytes()).await?;

        match timeout(profile.connection_timeout, await_hello_reply(socket, profile, pool, hello_seq)).await {
            Ok(Ok(peer_seq)) => {
                trace!("{:?}: HELLO #{} acknowledged by the peer's HELLO #{}", peer_addr, hello_seq, peer_seq);
                let ack = WireMessage::new_ack(&[Ack::single(peer_seq)], 0, None, pool)?;
                socket.send(ack.as_bytes()).await?;
                info!("{:?}: connection established", peer_addr);
                return Ok(peer_seq);
            }
            Ok(Err(HandshakeError::Wire(e))) => {
                debug!("{:?}: handshake attempt {} aborted: {}", peer_addr, attempt, e);
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!("{:?}: no reply to HELLO within {:?}", peer_addr, profile.connection_timeout);
            }
        }
    }

    warn!("{:?}: handshake failed after {} attempts", peer_addr, profile.handshake_retries);
    Err(HandshakeError::Timeout { attempts: profile.handshake_retries })
}

async fn await_hello_reply(socket: &dyn DatagramSocket, profile: &Profile, pool: &Arc<BufferPool>, hello_seq: i32) -> Result<i32, HandshakeError> {
    loop {
        let message = WireMessage::decode(socket.recv(pool).await?)?;
        if message.message_type != MessageType::Hello {
            debug!("{:?}: ignoring {:?} during handshake", socket.peer_addr(), message.message_type);
            continue;
        }

        let hello = message.as_hello()?;
        check_hello(socket.peer_addr(), &hello, profile)?;
        return match hello.ack {
            Some(ack) if ack.contains(hello_seq) => Ok(message.seq),
            other => Err(HandshakeError::Protocol(format!("HELLO #{} acknowledges {:?} rather than #{}", message.seq, other, hello_seq))),
        };
    }
}

/// Waits for the HELLO that opens a connection, skipping anything else
pub async fn await_hello(socket: &dyn DatagramSocket, pool: &Arc<BufferPool>) -> Result<WireMessage, HandshakeError> {
    loop {
        match WireMessage::decode(socket.recv(pool).await?) {
            Ok(message) if message.message_type == MessageType::Hello => return Ok(message),
            Ok(message) => debug!("{:?}: ignoring {:?} #{} before HELLO", socket.peer_addr(), message.message_type, message.seq),
            Err(e) => debug!("{:?}: ignoring undecodable datagram before HELLO: {}", socket.peer_addr(), e),
        }
    }
}

enum ListenerEvent {
    Acked(Option<WireMessage>),
    RepeatedHello,
}

/// Runs the listener's side of the handshake in response to the dialer's `peer_hello`
pub async fn listen(socket: &dyn DatagramSocket, profile: &Profile, pool: &Arc<BufferPool>, hello_seq: i32, peer_hello: &WireMessage) -> Result<Accepted, HandshakeError> {
    let peer_addr = socket.peer_addr();
    check_hello(peer_addr, &peer_hello.as_hello()?, profile)?;
    let peer_seq = peer_hello.seq;
    trace!("{:?}: received HELLO #{}", peer_addr, peer_seq);

    let reply = WireMessage::new_hello(hello_seq, &Hello {
        version: PROTOCOL_VERSION,
        profile_id: profile.profile_id,
        ack: Some(Ack::single(peer_seq)),
    }, pool)?;

    for attempt in 1..=profile.listener_hello_retries {
        debug!("{:?}: sending HELLO #{} acknowledging #{} (attempt {})", peer_addr, hello_seq, peer_seq, attempt);
        socket.send(reply.as_bytes()).await?;

        match timeout(profile.listener_hello_timeout, await_hello_ack(socket, profile, pool, hello_seq, peer_seq)).await {
            Ok(Ok(ListenerEvent::Acked(first_message))) => {
                info!("{:?}: connection established", peer_addr);
                return Ok(Accepted { peer_seq, first_message });
            }
            Ok(Ok(ListenerEvent::RepeatedHello)) => {
                debug!("{:?}: peer repeated its HELLO", peer_addr);
            }
            Ok(Err(HandshakeError::Wire(e))) => {
                debug!("{:?}: handshake attempt {} aborted: {}", peer_addr, attempt, e);
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!("{:?}: HELLO #{} not acknowledged within {:?}", peer_addr, hello_seq, profile.listener_hello_timeout);
            }
        }
    }

    warn!("{:?}: handshake failed after {} attempts", peer_addr, profile.listener_hello_retries);
    Err(HandshakeError::Timeout { attempts: profile.listener_hello_retries })
}

async fn await_hello_ack(socket: &dyn DatagramSocket, profile: &Profile, pool: &Arc<BufferPool>, hello_seq: i32, peer_seq: i32) -> Result<ListenerEvent, HandshakeError> {
    loop {
        let message = WireMessage::decode(socket.recv(pool).await?)?;
        match message.message_type {
            MessageType::Ack => {
                if message.as_ack()?.acks.iter().any(|ack| ack.contains(hello_seq)) {
                    return Ok(ListenerEvent::Acked(None));
                }
                debug!("{:?}: ignoring ACK that does not cover HELLO #{}", socket.peer_addr(), hello_seq);
            }
            MessageType::Hello => {
                check_hello(socket.peer_addr(), &message.as_hello()?, profile)?;
                if message.seq == peer_seq {
                    return Ok(ListenerEvent::RepeatedHello);
                }
                return Err(HandshakeError::Protocol(format!("peer sent HELLO #{} after HELLO #{}", message.seq, peer_seq)));
            }
            MessageType::Data | MessageType::Close if is_ahead(message.seq, peer_seq) => {
                trace!("{:?}: {:?} #{} implies the peer is established", socket.peer_addr(), message.message_type, message.seq);
                return Ok(ListenerEvent::Acked(Some(message)));
            }
            other => {
                debug!("{:?}: ignoring {:?} #{} during handshake", socket.peer_addr(), other, message.seq);
            }
        }
    }
}
