use std::time::Duration;

/// Number of chunks the warmup period is divided into.
pub const WARMUP_MAX: i32 = 16;
pub const WARMUP_MIN: i32 = -16;

/// Connection ceiling for each warmup chunk.
pub const WARMUP_CONNECTION_MAX: [usize; WARMUP_MAX as usize] =
    [1, 1, 1, 1, 2, 2, 2, 2, 4, 4, 8, 8, 16, 32, 64, 128];

/// Result of the slow-start admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Warmup complete; no ceiling.
    Open,
    /// At most this many connections (active + starting + idle).
    Limit(usize),
    /// Recent failures outweigh warmup progress. New connections wait until
    /// `chunks` failure chunks have passed since the last failure.
    Backoff { chunks: u32 },
}

impl Admission {
    /// Connection ceiling as a single number, `usize::MAX` when open and 0
    /// while backing off.
    pub fn ceiling(self) -> usize {
        match self {
            Admission::Open => usize::MAX,
            Admission::Limit(limit) => limit,
            Admission::Backoff { .. } => 0,
        }
    }
}

/// Chunk lengths derived from the warmup and recovery times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmupSchedule {
    pub chunk: Duration,
    pub fail_chunk: Duration,
}

impl WarmupSchedule {
    pub fn new(warmup_time: Duration, recover_time: Duration) -> Self {
        Self {
            chunk: chunk_of(warmup_time),
            fail_chunk: chunk_of(recover_time),
        }
    }

    /// Warmup chunks elapsed since the first successful connect, not yet
    /// offset by failures.
    pub fn elapsed_chunks(&self, since_first_success: Option<Duration>) -> i64 {
        match since_first_success {
            Some(elapsed) => (elapsed.as_millis() / self.chunk.as_millis()) as i64,
            None => 0,
        }
    }

    pub fn admission(&self, since_first_success: Option<Duration>, fail_count: u32) -> Admission {
        let index = self.elapsed_chunks(since_first_success) - i64::from(fail_count);

        if index < 0 {
            Admission::Backoff {
                chunks: u32::try_from(-index).unwrap_or(u32::MAX),
            }
        } else if index >= i64::from(WARMUP_MAX) {
            Admission::Open
        } else {
            Admission::Limit(WARMUP_CONNECTION_MAX[index as usize])
        }
    }

    /// How long after the last failure a backing-off pool may connect again.
    pub fn backoff_delay(&self, chunks: u32) -> Duration {
        self.fail_chunk.saturating_mul(chunks)
    }
}

fn chunk_of(total: Duration) -> Duration {
    let chunk = total / WARMUP_MAX as u32;
    chunk.max(Duration::from_millis(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> WarmupSchedule {
        WarmupSchedule::new(Duration::from_millis(1600), Duration::from_millis(16_000))
    }

    #[test]
    fn chunks_are_sixteenths() {
        let s = schedule();
        assert_eq!(s.chunk, Duration::from_millis(100));
        assert_eq!(s.fail_chunk, Duration::from_millis(1000));
    }

    #[test]
    fn zero_warmup_uses_minimum_chunk() {
        let s = WarmupSchedule::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(s.chunk, Duration::from_millis(1));
        assert_eq!(s.fail_chunk, Duration::from_millis(1));
    }

    #[test]
    fn before_first_success_admits_one() {
        assert_eq!(schedule().admission(None, 0), Admission::Limit(1));
    }

    #[test]
    fn ceiling_follows_table() {
        let s = schedule();
        assert_eq!(
            s.admission(Some(Duration::from_millis(0)), 0),
            Admission::Limit(1)
        );
        assert_eq!(
            s.admission(Some(Duration::from_millis(800)), 0),
            Admission::Limit(4)
        );
        assert_eq!(
            s.admission(Some(Duration::from_millis(1599)), 0),
            Admission::Limit(128)
        );
        assert_eq!(s.admission(Some(Duration::from_millis(1600)), 0), Admission::Open);
    }

    #[test]
    fn failures_push_into_backoff() {
        let s = schedule();
        assert_eq!(s.admission(None, 3), Admission::Backoff { chunks: 3 });
        assert_eq!(
            s.admission(Some(Duration::from_millis(250)), 3),
            Admission::Backoff { chunks: 1 }
        );
        assert_eq!(s.backoff_delay(3), Duration::from_millis(3000));
    }

    #[test]
    fn ceiling_non_decreasing_in_elapsed_time() {
        let s = schedule();
        for fails in 0..20 {
            let mut prev = 0;
            for ms in (0..3000).step_by(25) {
                let ceiling = s.admission(Some(Duration::from_millis(ms)), fails).ceiling();
                assert!(ceiling >= prev, "fails={} ms={}", fails, ms);
                prev = ceiling;
            }
        }
    }

    #[test]
    fn ceiling_non_increasing_in_fail_count() {
        let s = schedule();
        for ms in (0..3000).step_by(25) {
            let mut prev = usize::MAX;
            for fails in 0..20 {
                let ceiling = s.admission(Some(Duration::from_millis(ms)), fails).ceiling();
                assert!(ceiling <= prev, "fails={} ms={}", fails, ms);
                prev = ceiling;
            }
        }
    }
}
