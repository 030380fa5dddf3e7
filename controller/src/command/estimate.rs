//! Round trip and clock offset estimation from a prepare exchange

/// Link timing measured from one prepare exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockEstimate {
    /// Leader-measured round trip time
    pub rtt_ms: u32,
    /// Peripheral clock minus leader clock; positive when the robot is ahead
    pub offset_ms: i32,
}

impl ClockEstimate {
    /// Estimate from leader send time `t1`, peripheral stamp `t2` and leader
    /// receive time `t4`
    ///
    /// Assumes the peripheral stamped its response halfway through the round trip.
    pub fn from_exchange(t1: u32, t2: u32, t4: u32) -> Self {
        let rtt_ms = t4.wrapping_sub(t1);
        let midpoint = i64::from(t1) + i64::from(rtt_ms / 2);
        let offset = i64::from(t2) - midpoint;
        Self {
            rtt_ms,
            offset_ms: offset.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peripheral_ahead() {
        // Robot clock is 500 ms ahead, one-way latency 20 ms
        let est = ClockEstimate::from_exchange(1000, 1520, 1040);
        assert_eq!(est, ClockEstimate { rtt_ms: 40, offset_ms: 500 });
    }

    #[test]
    fn test_peripheral_behind() {
        // Robot booted later: its clock reads far lower than the leader's
        let est = ClockEstimate::from_exchange(60_000, 1_010, 60_020);
        assert_eq!(est.rtt_ms, 20);
        assert_eq!(est.offset_ms, -59_000);
    }

    #[test]
    fn test_odd_rtt_rounds_down() {
        let est = ClockEstimate::from_exchange(0, 10, 5);
        assert_eq!(est.rtt_ms, 5);
        assert_eq!(est.offset_ms, 8);
    }
}
