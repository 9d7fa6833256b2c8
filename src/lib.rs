//! A reliable, ordered and congestion controlled byte stream on top of UDP.
//!
//! Every datagram carries a single wire message with a seven byte header: a sequence number, the
//!  message type combined with flags, and the body length. Connections start with a HELLO
//!  exchange that negotiates the protocol version and the initial sequence numbers. After that,
//!  the sending side ([tx_portal]) keeps a window of unacknowledged DATA messages that grows and
//!  shrinks with the observed loss, and the receiving side ([rx_portal]) puts messages back into
//!  order and acknowledges them once they were handed to the application. Closing is a CLOSE
//!  message in both directions, see [closer].
//!
//! Applications use [connection::Connection] for dialing and [listener::Listener] for accepting
//!  connections.

pub mod acks;
pub mod buffers;
pub mod closer;
pub mod config;
pub mod connection;
pub mod datagram_socket;
pub mod error;
pub mod handshake;
pub mod instrument;
pub mod listener;
pub mod read_buffer;
pub mod retx_monitor;
pub mod rx_portal;
pub mod safe_converter;
pub mod sequence;
pub mod test_util;
pub mod tx_portal;
pub mod util;
pub mod waitlist;
pub mod wire_message;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
