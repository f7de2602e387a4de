use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use tracing::debug;

/// How long to wait between unforced liveness pings.
const PING_INTERVAL: Duration = Duration::from_secs(10);

/// How many round-trip samples the rolling estimate keeps.
const RTT_SAMPLES: usize = 3;

struct PingRecord {
    sequence: u32,
    sent_at: Instant,
}

/// Liveness pings and round-trip time estimation.
///
/// Every outgoing ping carries a monotonically increasing sequence number
/// in the low four bytes of the 8-byte payload. Acks are matched against
/// the in-flight queue; the estimate is the mean of the last three
/// samples. Time is passed in explicitly so the bookkeeping stays
/// deterministic under test.
pub(crate) struct PingManager {
    sequence: u32,
    last_ping_sent: Option<Instant>,
    inflight: VecDeque<PingRecord>,
    round_trip_times: VecDeque<Duration>,
}

impl PingManager {
    pub(crate) fn new() -> Self {
        Self {
            sequence: 0,
            last_ping_sent: None,
            inflight: VecDeque::new(),
            round_trip_times: VecDeque::new(),
        }
    }

    /// Returns the payload of a ping to send now, either because `force`
    /// is set or because the last one is older than the ping interval.
    /// The caller is responsible for actually writing the frame.
    pub(crate) fn poll_send(&mut self, now: Instant, force: bool) -> Option<[u8; 8]> {
        let due = match self.last_ping_sent {
            None => true,
            Some(last) => now.duration_since(last) > PING_INTERVAL,
        };
        if !(force || due) {
            return None;
        }

        self.last_ping_sent = Some(now);
        self.sequence = self.sequence.wrapping_add(1) & 0x7fff_ffff;
        self.inflight.push_back(PingRecord {
            sequence: self.sequence,
            sent_at: now,
        });

        let mut payload = [0u8; 8];
        payload[4..8].copy_from_slice(&self.sequence.to_be_bytes());
        Some(payload)
    }

    /// Handles a PING ack from the peer. Returns the new sample, if the
    /// ack matched an in-flight ping; unexpected acks are ignored.
    pub(crate) fn receive_ack(&mut self, payload: &[u8; 8], now: Instant) -> Option<Duration> {
        let received = u32::from_be_bytes(payload[4..8].try_into().unwrap()) & 0x7fff_ffff;

        let mut record = self.inflight.pop_front();
        while let Some(r) = &record {
            if r.sequence >= received {
                break;
            }
            record = self.inflight.pop_front();
        }

        match record {
            None => {
                debug!(%received, "ignoring unexpected ping ack");
                None
            }
            Some(record) => {
                let rtt = now.duration_since(record.sent_at);
                self.round_trip_times.push_back(rtt);
                while self.round_trip_times.len() > RTT_SAMPLES {
                    self.round_trip_times.pop_front();
                }
                debug!(?rtt, "ping round trip");
                Some(rtt)
            }
        }
    }

    /// Mean of the retained round-trip samples, zero if none were taken.
    pub(crate) fn round_trip_time(&self) -> Duration {
        if self.round_trip_times.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.round_trip_times.iter().sum();
        total / self.round_trip_times.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_for(sequence: u32) -> [u8; 8] {
        let mut payload = [0u8; 8];
        payload[4..8].copy_from_slice(&sequence.to_be_bytes());
        payload
    }

    #[test]
    fn rtt_is_mean_of_recent_samples() {
        let mut pm = PingManager::new();
        let t0 = Instant::now();

        assert_eq!(pm.round_trip_time(), Duration::ZERO);

        let p1 = pm.poll_send(t0, true).unwrap();
        let rtt = pm
            .receive_ack(&p1, t0 + Duration::from_millis(20))
            .unwrap();
        assert_eq!(rtt, Duration::from_millis(20));
        assert_eq!(pm.round_trip_time(), Duration::from_millis(20));

        let p2 = pm.poll_send(t0 + Duration::from_secs(11), false).unwrap();
        pm.receive_ack(&p2, t0 + Duration::from_secs(11) + Duration::from_millis(40))
            .unwrap();
        assert_eq!(pm.round_trip_time(), Duration::from_millis(30));
    }

    #[test]
    fn rolling_window_keeps_last_three() {
        let mut pm = PingManager::new();
        let mut now = Instant::now();

        for ms in [10u64, 20, 30, 40] {
            let payload = pm.poll_send(now, true).unwrap();
            pm.receive_ack(&payload, now + Duration::from_millis(ms))
                .unwrap();
            now += Duration::from_secs(60);
        }

        // first sample evicted, mean of 20/30/40
        assert_eq!(pm.round_trip_time(), Duration::from_millis(30));
    }

    #[test]
    fn unexpected_ack_is_ignored() {
        let mut pm = PingManager::new();
        let t0 = Instant::now();

        let p1 = pm.poll_send(t0, true).unwrap();
        pm.receive_ack(&p1, t0 + Duration::from_millis(20)).unwrap();

        // sequence 99 was never sent
        assert!(pm
            .receive_ack(&payload_for(99), t0 + Duration::from_millis(25))
            .is_none());
        assert_eq!(pm.round_trip_time(), Duration::from_millis(20));
    }

    #[test]
    fn acks_skip_lost_pings() {
        let mut pm = PingManager::new();
        let t0 = Instant::now();

        let _p1 = pm.poll_send(t0, true).unwrap();
        let _p2 = pm.poll_send(t0 + Duration::from_secs(11), false).unwrap();
        let p3 = pm.poll_send(t0 + Duration::from_secs(22), false).unwrap();

        // only the third ping is acked; the two older in-flight records
        // are drained without producing samples
        pm.receive_ack(&p3, t0 + Duration::from_secs(22) + Duration::from_millis(15))
            .unwrap();
        assert_eq!(pm.round_trip_time(), Duration::from_millis(15));
        assert!(pm.inflight.is_empty());
    }

    #[test]
    fn unforced_pings_are_rate_limited() {
        let mut pm = PingManager::new();
        let t0 = Instant::now();

        assert!(pm.poll_send(t0, false).is_some());
        assert!(pm.poll_send(t0 + Duration::from_secs(5), false).is_none());
        assert!(pm.poll_send(t0 + Duration::from_secs(5), true).is_some());
        assert!(pm.poll_send(t0 + Duration::from_secs(16), false).is_some());
    }
}
