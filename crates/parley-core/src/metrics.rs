//! Metric names and recording helpers.
//!
//! Recording goes through the `metrics` facade and costs nothing until the
//! binary installs a recorder.

use metrics::{counter, gauge};
use parley_protocol::EnvelopeKind;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const HANDSHAKES_REJECTED: &str = "parley_handshakes_rejected_total";
    pub const SESSIONS_LIVE: &str = "parley_sessions_live";
    pub const SESSIONS_CLOSED: &str = "parley_sessions_closed_total";
    pub const ENVELOPES_IN: &str = "parley_envelopes_received_total";
    pub const ENVELOPES_OUT: &str = "parley_envelopes_sent_total";
    pub const ENVELOPES_REJECTED: &str = "parley_envelopes_rejected_total";
    pub const DELIVERIES: &str = "parley_deliveries_total";
    pub const DELIVERIES_DROPPED: &str = "parley_deliveries_dropped_total";
    pub const BUS_DECODE_ERRORS: &str = "parley_bus_decode_errors_total";
    pub const PRESENCE_FANOUTS: &str = "parley_presence_fanouts_total";
    pub const HEARTBEATS: &str = "parley_heartbeats_total";
}

/// Path taken by a routed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    /// Handed to the local hub.
    Local,
    /// Published to another node.
    Remote,
    /// Recipient has no home node.
    Offline,
    /// Received from the bus and handed to the local hub.
    Bus,
}

impl DeliveryPath {
    fn as_str(self) -> &'static str {
        match self {
            DeliveryPath::Local => "local",
            DeliveryPath::Remote => "remote",
            DeliveryPath::Offline => "offline",
            DeliveryPath::Bus => "bus",
        }
    }
}

/// Record a new client connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a client disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a refused handshake.
pub fn record_handshake_rejected(reason: &'static str) {
    counter!(names::HANDSHAKES_REJECTED, "reason" => reason).increment(1);
}

/// Update the live session gauge.
pub fn set_live_sessions(count: usize) {
    gauge!(names::SESSIONS_LIVE).set(count as f64);
}

/// Record the end of a session.
pub fn record_session_closed(reason: &'static str) {
    counter!(names::SESSIONS_CLOSED, "reason" => reason).increment(1);
}

/// Record an envelope read from a client.
pub fn record_envelope_in(kind: EnvelopeKind) {
    counter!(names::ENVELOPES_IN, "type" => kind.as_str()).increment(1);
}

/// Record an envelope written to a client.
pub fn record_envelope_out(kind: EnvelopeKind) {
    counter!(names::ENVELOPES_OUT, "type" => kind.as_str()).increment(1);
}

/// Record an envelope answered with an in-band error.
pub fn record_envelope_rejected(kind: EnvelopeKind) {
    counter!(names::ENVELOPES_REJECTED, "type" => kind.as_str()).increment(1);
}

/// Record a routing decision.
pub fn record_delivery(path: DeliveryPath) {
    counter!(names::DELIVERIES, "path" => path.as_str()).increment(1);
}

/// Record an envelope dropped because the recipient's inbox was full.
pub fn record_delivery_dropped() {
    counter!(names::DELIVERIES_DROPPED).increment(1);
}

/// Record a bus payload that failed to decode.
pub fn record_bus_decode_error() {
    counter!(names::BUS_DECODE_ERRORS).increment(1);
}

/// Record a presence fan-out to `contacts` contacts.
pub fn record_presence_fanout(online: bool, contacts: usize) {
    let state = if online { "online" } else { "offline" };
    counter!(names::PRESENCE_FANOUTS, "state" => state).increment(contacts as u64);
}

/// Record a heartbeat answered by a client.
pub fn record_heartbeat() {
    counter!(names::HEARTBEATS).increment(1);
}

/// Guard that records a disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
