use std::time::Duration;
use anyhow::bail;
use crate::wire_message::{HEADER_LEN, MAX_BODY_LEN, RTT_LEN};

/// All tuning knobs of a connection. Both peers should use compatible profiles, but only the wire
///  format and protocol version are negotiated: the profile id sent in the handshake is
///  informational.
#[derive(Debug, Clone)]
pub struct Profile {
    /// sent in the HELLO message so that peers can log profile mismatches
    pub profile_id: u8,

    /// start sequence numbers at a random value rather than 0
    pub randomize_seq: bool,

    /// initial size of the sender's window in bytes
    pub tx_portal_start_size: usize,
    /// the window never shrinks below this number of bytes. It must be able to hold at least one
    ///  full segment, otherwise a sender could block forever.
    pub tx_portal_min_size: usize,
    pub tx_portal_max_size: usize,

    /// number of successful acks after which the window grows
    pub tx_portal_increase_threshold: u32,
    /// the window grows by the acked message's size multiplied by this factor
    pub tx_portal_increase_scale: f64,
    /// number of duplicate acks after which the window shrinks
    pub tx_portal_dup_ack_threshold: u32,
    pub tx_portal_dup_ack_scale: f64,
    /// number of retransmissions after which the window shrinks
    pub tx_portal_retx_threshold: u32,
    pub tx_portal_retx_scale: f64,

    /// retransmission interval before the first RTT sample is available
    pub retx_start: Duration,
    /// retransmission interval is `avg(rtt) * retx_scale + retx_add`
    pub retx_scale: f64,
    pub retx_add: Duration,

    /// minimum time between two RTT probes
    pub rtt_probe_interval: Duration,
    /// number of RTT samples in the moving average
    pub rtt_probe_avg: usize,

    /// A KEEPALIVE is sent when draining the receive side brings the buffered bytes below
    ///  `pool_buffer_size * rx_portal_pacing_threshold`
    pub rx_portal_pacing_threshold: f64,

    /// maximum number of payload bytes per DATA message
    pub max_segment_size: usize,
    /// size of each pooled buffer, which must hold a complete wire message
    pub pool_buffer_size: usize,
    /// buffers returned to the pool in excess of this number are freed
    pub max_pooled_buffers: usize,

    /// OS level receive buffer of the UDP socket
    pub rx_buffer_size: usize,
    /// OS level send buffer of the UDP socket
    pub tx_buffer_size: usize,

    /// expected number of messages in flight above which the retransmission monitor switches from
    ///  a sorted array to a tree
    pub tree_len: usize,

    /// number of received segments queued for the application's reads
    pub reads_queue_len: usize,
    /// number of datagrams queued per peer between the listener's socket and the connection
    pub listener_rx_queue_len: usize,
    /// number of established connections waiting to be accepted
    pub accept_queue_len: usize,

    /// per-attempt timeout for the dialer's handshake, and the time without acknowledgment
    ///  progress after which an established connection is considered dead
    pub connection_timeout: Duration,
    /// number of HELLO attempts by the dialer
    pub handshake_retries: u32,
    /// number of HELLO replies the listener sends while waiting for the dialer's ACK
    pub listener_hello_retries: u32,
    pub listener_hello_timeout: Duration,

    /// a close that sees no progress for this long is forced
    pub close_wait: Duration,
    pub close_check_interval: Duration,
}

impl Default for Profile {
    fn default() -> Self {
        Profile {
            profile_id: 0,
            randomize_seq: false,
            tx_portal_start_size: 96 * 1024,
            tx_portal_min_size: 16 * 1024,
            tx_portal_max_size: 4 * 1024 * 1024,
            tx_portal_increase_threshold: 224,
            tx_portal_increase_scale: 1.0,
            tx_portal_dup_ack_threshold: 64,
            tx_portal_dup_ack_scale: 0.9,
            tx_portal_retx_threshold: 64,
            tx_portal_retx_scale: 0.75,
            retx_start: Duration::from_millis(200),
            retx_scale: 2.0,
            retx_add: Duration::from_millis(100),
            rtt_probe_interval: Duration::from_millis(50),
            rtt_probe_avg: 8,
            rx_portal_pacing_threshold: 0.5,
            max_segment_size: 1420,
            pool_buffer_size: 64 * 1024,
            max_pooled_buffers: 4096,
            rx_buffer_size: 4 * 1024 * 1024,
            tx_buffer_size: 4 * 1024 * 1024,
            tree_len: 64,
            reads_queue_len: 1024,
            listener_rx_queue_len: 1024,
            accept_queue_len: 1024,
            connection_timeout: Duration::from_secs(5),
            handshake_retries: 5,
            listener_hello_retries: 5,
            listener_hello_timeout: Duration::from_secs(5),
            close_wait: Duration::from_secs(5),
            close_check_interval: Duration::from_millis(500),
        }
    }
}

impl Profile {
    /// encoded size of a DATA message carrying a full segment
    pub fn max_data_message_len(&self) -> usize {
        HEADER_LEN + RTT_LEN + self.max_segment_size
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_segment_size == 0 {
            bail!("max segment size must be positive");
        }
        if RTT_LEN + self.max_segment_size > MAX_BODY_LEN {
            bail!("max segment size {} does not fit into a message body", self.max_segment_size);
        }
        if self.max_data_message_len() > self.pool_buffer_size {
            bail!("pool buffer size {} cannot hold a full segment of {} bytes", self.pool_buffer_size, self.max_segment_size);
        }
        if self.tx_portal_min_size < self.max_data_message_len() {
            bail!("minimum window size {} must hold at least one full segment", self.tx_portal_min_size);
        }
        if self.tx_portal_min_size > self.tx_portal_max_size {
            bail!("minimum window size {} exceeds maximum window size {}", self.tx_portal_min_size, self.tx_portal_max_size);
        }
        if self.tx_portal_start_size < self.tx_portal_min_size || self.tx_portal_start_size > self.tx_portal_max_size {
            bail!("start window size {} is outside [{}, {}]", self.tx_portal_start_size, self.tx_portal_min_size, self.tx_portal_max_size);
        }
        if self.tx_portal_increase_threshold == 0 || self.tx_portal_dup_ack_threshold == 0 || self.tx_portal_retx_threshold == 0 {
            bail!("window thresholds must be positive");
        }
        for (name, scale) in [
            ("increase", self.tx_portal_increase_scale),
            ("dup ack", self.tx_portal_dup_ack_scale),
            ("retx", self.tx_portal_retx_scale),
            ("retransmission", self.retx_scale),
        ] {
            if !(scale > 0.0) {
                bail!("{} scale must be positive, was {}", name, scale);
            }
        }
        if self.rtt_probe_avg == 0 {
            bail!("RTT moving average needs at least one sample");
        }
        if !(0.0..=1.0).contains(&self.rx_portal_pacing_threshold) {
            bail!("pacing threshold must be between 0.0 and 1.0");
        }
        if self.reads_queue_len == 0 || self.listener_rx_queue_len == 0 || self.accept_queue_len == 0 {
            bail!("queue lengths must be positive");
        }
        if self.handshake_retries == 0 || self.listener_hello_retries == 0 {
            bail!("handshake retries must be positive");
        }
        if self.close_check_interval.is_zero() {
            bail!("close check interval must be positive");
        }
        Ok(())
    }
}
