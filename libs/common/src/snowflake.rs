use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Custom epoch: 2024-01-01T00:00:00Z in milliseconds since Unix epoch.
const CHAT_EPOCH_MS: u64 = 1_704_067_200_000;

const WORKER_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Largest worker id that fits in the layout.
pub const MAX_WORKER_ID: u16 = (1 << WORKER_BITS) - 1;

struct State {
    last_ms: u64,
    sequence: u64,
}

/// 64-bit time-ordered message id generator.
///
/// Layout (MSB to LSB):
/// - 42 bits: ms since `CHAT_EPOCH_MS`
/// - 10 bits: worker id
/// - 12 bits: per-ms sequence
///
/// Ids from one generator are strictly increasing. If the wall clock steps
/// backwards the generator keeps issuing from the last observed millisecond
/// instead of going back in time.
pub struct SnowflakeGenerator {
    worker_id: u64,
    state: Mutex<State>,
}

impl SnowflakeGenerator {
    /// Worker ids above [`MAX_WORKER_ID`] are masked into range.
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: u64::from(worker_id & MAX_WORKER_ID),
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn generate(&self) -> i64 {
        let mut state = self.state.lock();
        let now_ms = current_ms().max(state.last_ms);

        if now_ms == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence space for this millisecond is used up; borrow the next one.
                state.last_ms += 1;
            }
        } else {
            state.last_ms = now_ms;
            state.sequence = 0;
        }

        let ts = state.last_ms.saturating_sub(CHAT_EPOCH_MS);
        let id = (ts << (WORKER_BITS + SEQUENCE_BITS))
            | (self.worker_id << SEQUENCE_BITS)
            | state.sequence;

        id as i64
    }
}

fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(CHAT_EPOCH_MS)
}

/// Extract the creation timestamp (ms since Unix epoch) from a snowflake id.
pub fn snowflake_timestamp_ms(id: i64) -> u64 {
    ((id as u64) >> (WORKER_BITS + SEQUENCE_BITS)) + CHAT_EPOCH_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_strictly_increasing_and_unique() {
        let gen = SnowflakeGenerator::new(3);
        let mut seen = HashSet::new();
        let mut prev = 0i64;
        for _ in 0..20_000 {
            let id = gen.generate();
            assert!(id > prev, "not monotonic: {prev} >= {id}");
            assert!(seen.insert(id));
            prev = id;
        }
    }

    #[test]
    fn survives_clock_regression() {
        let gen = SnowflakeGenerator::new(0);
        let first = gen.generate();
        // Pretend the last issued id came from one minute in the future.
        gen.state.lock().last_ms += 60_000;
        let second = gen.generate();
        assert!(second > first);
    }

    #[test]
    fn timestamp_is_recoverable() {
        let gen = SnowflakeGenerator::new(0);
        let before = current_ms();
        let id = gen.generate();
        let after = current_ms();
        let ts = snowflake_timestamp_ms(id);
        assert!(ts >= before && ts <= after + 1, "ts={ts} before={before} after={after}");
    }

    #[test]
    fn worker_id_is_masked() {
        let gen = SnowflakeGenerator::new(u16::MAX);
        let id = gen.generate() as u64;
        assert_eq!((id >> SEQUENCE_BITS) & u64::from(MAX_WORKER_ID), u64::from(MAX_WORKER_ID));
    }
}
