//! Round-trip-time estimation from ping exchanges.
//!
//! The server measures its own RTT and echoes back the timestamp the client
//! last sent; from those two values the client keeps an exponentially
//! weighted moving average of its RTT and derives the one-way "forward
//! delay" used to dead-reckon playback position between pings.

/// Weight given to history in the RTT moving average.
const MOVING_AVERAGE_WEIGHT: f64 = 0.85;

/// Smooths client RTT samples and derives the forward delay.
///
/// Timestamps are injected by the caller (unix seconds, fractional) so the
/// arithmetic stays deterministic under test.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RttEstimator {
    client_rtt: f64,
    average_rtt: f64,
    server_rtt: f64,
    forward_delay: f64,
}

impl RttEstimator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record one ping exchange. `sent_at` is the client timestamp the server
    /// echoed back, `server_rtt` the server's own measurement, `now` the
    /// current wall clock.
    ///
    /// A negative client or server RTT means clock skew; the raw client value
    /// is recorded but excluded from the moving average so one bad sample
    /// cannot corrupt the blend.
    pub(crate) fn record_sample(&mut self, sent_at: f64, server_rtt: f64, now: f64) {
        let client_rtt = now - sent_at;
        self.server_rtt = server_rtt;

        if client_rtt < 0.0 || server_rtt < 0.0 {
            self.client_rtt = client_rtt;
            return;
        }

        let mut average = self.average_rtt;
        if average == 0.0 {
            average = client_rtt;
        }
        average = average * MOVING_AVERAGE_WEIGHT + client_rtt * (1.0 - MOVING_AVERAGE_WEIGHT);

        self.forward_delay = if server_rtt < client_rtt {
            average / 2.0 + (client_rtt - server_rtt)
        } else {
            average / 2.0
        };

        self.client_rtt = client_rtt;
        self.average_rtt = average;
    }

    /// Most recent raw client RTT sample, in seconds.
    pub(crate) fn client_rtt(&self) -> f64 {
        self.client_rtt
    }

    /// Most recent server-measured RTT, in seconds.
    pub(crate) fn server_rtt(&self) -> f64 {
        self.server_rtt
    }

    /// Estimated one-way latency used for position dead-reckoning.
    pub(crate) fn forward_delay(&self) -> f64 {
        self.forward_delay
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_the_average() {
        let mut rtt = RttEstimator::new();
        rtt.record_sample(100.0, 0.05, 100.2);

        assert!((rtt.client_rtt() - 0.2).abs() < 1e-9);
        // average == first sample, server faster than client
        let expected_forward = 0.2 / 2.0 + (0.2 - 0.05);
        assert!((rtt.forward_delay() - expected_forward).abs() < 1e-9);
    }

    #[test]
    fn average_blends_monotonically_between_history_and_sample() {
        let mut rtt = RttEstimator::new();
        rtt.record_sample(0.0, 0.1, 0.1);

        let mut previous_average = rtt.client_rtt();
        for sample in [0.2_f64, 0.3, 0.4, 0.5] {
            rtt.record_sample(0.0, sample, sample);
            // forward_delay = avg/2 when server_rtt == client_rtt, so the
            // average is observable as 2 * forward_delay.
            let average = rtt.forward_delay() * 2.0;
            assert!(
                average > previous_average && average < sample,
                "average {average} must sit between {previous_average} and {sample}"
            );
            previous_average = average;
        }
    }

    #[test]
    fn slow_server_rtt_uses_plain_half_average() {
        let mut rtt = RttEstimator::new();
        rtt.record_sample(10.0, 0.5, 10.2);

        // server RTT (0.5) >= client RTT (0.2): no skew correction term.
        assert!((rtt.forward_delay() - 0.1).abs() < 1e-9);
        assert!((rtt.server_rtt() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn negative_sample_is_recorded_raw_and_skips_the_blend() {
        let mut rtt = RttEstimator::new();
        rtt.record_sample(0.0, 0.1, 0.1);
        let forward_before = rtt.forward_delay();

        // clock skew: echo timestamp is in the future
        rtt.record_sample(100.0, 0.1, 99.0);

        assert!((rtt.client_rtt() - (-1.0)).abs() < 1e-9);
        assert!((rtt.forward_delay() - forward_before).abs() < 1e-9);

        // a subsequent good sample resumes blending from the old average
        rtt.record_sample(0.0, 0.1, 0.1);
        assert!((rtt.forward_delay() - forward_before).abs() < 1e-9);
    }

    #[test]
    fn negative_server_rtt_also_skips_the_blend() {
        let mut rtt = RttEstimator::new();
        rtt.record_sample(0.0, -0.5, 0.1);

        assert!((rtt.client_rtt() - 0.1).abs() < 1e-9);
        assert!(rtt.forward_delay().abs() < 1e-9);
    }
}
