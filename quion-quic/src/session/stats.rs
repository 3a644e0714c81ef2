//! Per-session statistics.
//!
//! Timestamps are recorded as monotonic instants; counters saturate. The
//! crypto-ack histogram tracks intervals between handshake acknowledgements
//! so a peer deliberately starving acks (and thereby pinning handshake
//! buffers) shows up as a long tail.

use std::time::{Duration, Instant};

/// Power-of-two bucketed latency histogram over microseconds.
#[derive(Debug, Clone)]
pub struct AckLatencyHistogram {
    buckets: [u64; 32],
    count: u64,
    max_us: u64,
}

impl Default for AckLatencyHistogram {
    fn default() -> Self {
        Self {
            buckets: [0; 32],
            count: 0,
            max_us: 0,
        }
    }
}

impl AckLatencyHistogram {
    pub fn record(&mut self, interval: Duration) {
        let us = interval.as_micros().min(u64::MAX as u128) as u64;
        let idx = (64 - us.leading_zeros() as usize).min(31);
        self.buckets[idx] += 1;
        self.count += 1;
        self.max_us = self.max_us.max(us);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn max_us(&self) -> u64 {
        self.max_us
    }

    /// Samples at or above `threshold`. Used to spot ack-withholding peers.
    pub fn tail_count(&self, threshold: Duration) -> u64 {
        let us = threshold.as_micros().min(u64::MAX as u128) as u64;
        let idx = (64 - us.leading_zeros() as usize).min(31);
        self.buckets[idx..].iter().sum()
    }
}

/// The per-session statistics record.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub created_at: Instant,
    pub handshake_start_at: Option<Instant>,
    pub handshake_send_at: Option<Instant>,
    pub handshake_continue_at: Option<Instant>,
    pub handshake_completed_at: Option<Instant>,
    pub handshake_confirmed_at: Option<Instant>,
    pub handshake_acked_at: Option<Instant>,
    pub sent_at: Option<Instant>,
    pub received_at: Option<Instant>,
    pub closing_at: Option<Instant>,

    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub bidi_stream_count: u64,
    pub uni_stream_count: u64,
    /// Streams initiated by the peer.
    pub streams_in_count: u64,
    /// Streams initiated locally.
    pub streams_out_count: u64,
    /// All streams ever added, regardless of origin.
    pub streams_total: u64,
    pub keyupdate_count: u64,
    pub retry_count: u64,
    pub loss_retransmit_count: u64,
    pub ack_delay_retransmit_count: u64,
    pub path_validation_success_count: u64,
    pub path_validation_failure_count: u64,
    pub block_count: u64,
    pub connection_close_attempts: u64,
    pub max_bytes_in_flight: u64,

    pub min_rtt_us: u64,
    pub latest_rtt_us: u64,
    pub smoothed_rtt_us: u64,

    pub crypto_ack_latency: AckLatencyHistogram,
}

impl SessionStats {
    pub fn new(now: Instant) -> Self {
        Self {
            created_at: now,
            handshake_start_at: None,
            handshake_send_at: None,
            handshake_continue_at: None,
            handshake_completed_at: None,
            handshake_confirmed_at: None,
            handshake_acked_at: None,
            sent_at: None,
            received_at: None,
            closing_at: None,
            bytes_received: 0,
            bytes_sent: 0,
            bidi_stream_count: 0,
            uni_stream_count: 0,
            streams_in_count: 0,
            streams_out_count: 0,
            streams_total: 0,
            keyupdate_count: 0,
            retry_count: 0,
            loss_retransmit_count: 0,
            ack_delay_retransmit_count: 0,
            path_validation_success_count: 0,
            path_validation_failure_count: 0,
            block_count: 0,
            connection_close_attempts: 0,
            max_bytes_in_flight: 0,
            min_rtt_us: 0,
            latest_rtt_us: 0,
            smoothed_rtt_us: 0,
            crypto_ack_latency: AckLatencyHistogram::default(),
        }
    }

    /// Record a crypto-ack arrival, feeding the interval since the previous
    /// ack into the latency histogram.
    pub fn record_crypto_ack(&mut self, now: Instant) {
        if let Some(prev) = self.handshake_acked_at {
            self.crypto_ack_latency.record(now.duration_since(prev));
        }
        self.handshake_acked_at = Some(now);
    }

    pub fn note_bytes_in_flight(&mut self, in_flight: u64) {
        self.max_bytes_in_flight = self.max_bytes_in_flight.max(in_flight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_counts_and_tail() {
        let mut h = AckLatencyHistogram::default();
        h.record(Duration::from_micros(10));
        h.record(Duration::from_micros(100));
        h.record(Duration::from_millis(500));
        assert_eq!(h.count(), 3);
        assert!(h.max_us() >= 500_000);
        assert_eq!(h.tail_count(Duration::from_millis(100)), 1);
        assert_eq!(h.tail_count(Duration::from_micros(1)), 3);
    }

    #[test]
    fn test_crypto_ack_interval_feeds_histogram() {
        let start = Instant::now();
        let mut stats = SessionStats::new(start);
        stats.record_crypto_ack(start + Duration::from_millis(1));
        assert_eq!(stats.crypto_ack_latency.count(), 0);
        stats.record_crypto_ack(start + Duration::from_millis(3));
        assert_eq!(stats.crypto_ack_latency.count(), 1);
        // Timestamps move forward only.
        assert!(stats.handshake_acked_at.unwrap() > start);
    }

    #[test]
    fn test_max_bytes_in_flight_is_high_water_mark() {
        let mut stats = SessionStats::new(Instant::now());
        stats.note_bytes_in_flight(100);
        stats.note_bytes_in_flight(50);
        assert_eq!(stats.max_bytes_in_flight, 100);
    }
}
