//! Round-trip time estimation.
//!
//! RFC 6298 smoothing seeded with a nominal 100 ms round trip, so the RTT
//! reported before the first sample matches what a fresh connection
//! advertises.

use std::time::Duration;

/// RTT timing constants.
pub mod constants {
    use std::time::Duration;

    /// Round trip assumed before the first sample.
    pub const INITIAL_RTT: Duration = Duration::from_millis(100);

    /// Retransmission timeout before the first sample.
    pub const INITIAL_RTO: Duration = Duration::from_millis(300);

    /// Minimum retransmission timeout.
    pub const MIN_RTO: Duration = Duration::from_millis(50);

    /// Maximum retransmission timeout.
    pub const MAX_RTO: Duration = Duration::from_secs(5);

    /// Alpha for SRTT smoothing (1/8).
    pub const SRTT_ALPHA: f64 = 0.125;

    /// Beta for RTTVAR smoothing (1/4).
    pub const RTTVAR_BETA: f64 = 0.25;

    /// K multiplier for RTO calculation.
    pub const RTO_K: f64 = 4.0;
}

/// Smoothed RTT, RTT variance and the derived retransmission timeout.
#[derive(Debug, Clone)]
pub(crate) struct RttEstimator {
    /// Smoothed RTT in milliseconds.
    srtt: f64,
    /// RTT variance in milliseconds.
    rttvar: f64,
    rto: Duration,
    sampled: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    pub(crate) fn new() -> Self {
        let initial = constants::INITIAL_RTT.as_millis() as f64;
        Self {
            srtt: initial,
            rttvar: initial / 2.0,
            rto: constants::INITIAL_RTO,
            sampled: false,
        }
    }

    /// Feed one sample taken from a packet that was never retransmitted.
    pub(crate) fn update(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;

        if !self.sampled {
            self.srtt = sample_ms;
            self.rttvar = sample_ms / 2.0;
            self.sampled = true;
        } else {
            self.rttvar = (1.0 - constants::RTTVAR_BETA) * self.rttvar
                + constants::RTTVAR_BETA * (self.srtt - sample_ms).abs();
            self.srtt =
                (1.0 - constants::SRTT_ALPHA) * self.srtt + constants::SRTT_ALPHA * sample_ms;
        }

        self.rto = Self::clamp_rto(self.srtt + constants::RTO_K * self.rttvar);
    }

    /// Smoothed RTT in milliseconds.
    pub(crate) fn srtt_ms(&self) -> f64 {
        self.srtt
    }

    pub(crate) fn rto(&self) -> Duration {
        self.rto
    }

    #[cfg(test)]
    pub(crate) fn is_sampled(&self) -> bool {
        self.sampled
    }

    /// Double the RTO after a retransmission timeout, capped at `MAX_RTO`.
    pub(crate) fn backoff(&mut self) -> Duration {
        self.rto = self.rto.saturating_mul(2).min(constants::MAX_RTO);
        self.rto
    }

    fn clamp_rto(rto_ms: f64) -> Duration {
        let rto_ms = rto_ms.clamp(
            constants::MIN_RTO.as_millis() as f64,
            constants::MAX_RTO.as_millis() as f64,
        );
        Duration::from_micros((rto_ms * 1000.0).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_estimator_initial() {
        let estimator = RttEstimator::new();
        assert!(!estimator.is_sampled());
        assert_eq!(estimator.rto(), constants::INITIAL_RTO);
        assert!((estimator.srtt_ms() - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_rtt_estimator_first_sample() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_millis(40));

        assert!(estimator.is_sampled());
        assert!((estimator.srtt_ms() - 40.0).abs() < 0.01);
        assert!((estimator.rttvar - 20.0).abs() < 0.01);
        // 40 + 4 * 20
        assert_eq!(estimator.rto(), Duration::from_millis(120));
    }

    #[test]
    fn test_rtt_estimator_converges() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_millis(100));
        estimator.update(Duration::from_millis(120));

        assert!(estimator.srtt_ms() > 100.0);
        assert!(estimator.srtt_ms() < 120.0);
    }

    #[test]
    fn test_rtt_estimator_min_rto() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_micros(50));
        assert_eq!(estimator.rto(), constants::MIN_RTO);
    }

    #[test]
    fn test_rtt_estimator_backoff() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_millis(100));

        let before = estimator.rto();
        assert!(estimator.backoff() > before);

        for _ in 0..20 {
            estimator.backoff();
        }
        assert_eq!(estimator.rto(), constants::MAX_RTO);
    }
}
