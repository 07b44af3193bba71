/*
    id.rs - Monotonic, lexicographically sortable operation identifiers

    An id is a 20-character base-36 string:

        [9 chars: millisecond timestamp][4 chars: per-process counter][7 chars: random]

    Lexicographic order on ids matches creation order to millisecond
    resolution; ties are broken by counter then random suffix. Because
    the time prefix has fixed width, "older than max_age" reduces to a
    string comparison against `cutoff(max_age)`, which is what lets the
    persistent store flush tombstones with a single bounded range delete.
*/

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Total id length in characters
pub const ID_LENGTH: usize = 20;

/// Width of the base-36 millisecond timestamp prefix
pub const TIME_WIDTH: usize = 9;

const COUNTER_WIDTH: usize = 4;
const RANDOM_WIDTH: usize = 7;
const COUNTER_SPAN: u64 = 36u64.pow(COUNTER_WIDTH as u32);

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Unique identifier for a single insertion or deletion
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(pub String);

impl OpId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Millisecond timestamp embedded in the id prefix
    pub fn timestamp_ms(&self) -> u64 {
        let prefix = &self.0[..TIME_WIDTH.min(self.0.len())];
        u64::from_str_radix(prefix, 36).unwrap_or(0)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OpId {
    fn from(s: &str) -> Self {
        OpId(s.to_string())
    }
}

/// Generates strictly increasing ids for one process
#[derive(Debug, Default)]
pub struct IdGenerator {
    /// (last millisecond seen, counter within that millisecond)
    state: Mutex<(u64, u64)>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next id
    pub fn generate(&self) -> OpId {
        let now = now_ms();
        let (ms, counter) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if now > state.0 {
                *state = (now, 0);
            } else {
                // Clock went backwards or same millisecond: keep the last
                // timestamp so the sequence stays monotonic
                state.1 += 1;
            }
            *state
        };

        let mut rng = rand::thread_rng();
        let mut id = String::with_capacity(ID_LENGTH);
        id.push_str(&base36(ms, TIME_WIDTH));
        id.push_str(&base36(counter % COUNTER_SPAN, COUNTER_WIDTH));
        for _ in 0..RANDOM_WIDTH {
            id.push(char::from(ALPHABET[rng.gen_range(0..36)]));
        }
        OpId(id)
    }

    /// Lexicographic bound below which ids are older than `max_age`
    pub fn cutoff(max_age: Duration) -> String {
        let floor = now_ms().saturating_sub(max_age.as_millis() as u64);
        base36(floor, TIME_WIDTH)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Fixed-width base-36 rendering, left-padded with zeros
fn base36(mut n: u64, width: usize) -> String {
    let mut out = vec![b'0'; width];
    let mut i = width;
    while i > 0 {
        i -= 1;
        out[i] = ALPHABET[(n % 36) as usize];
        n /= 36;
        if n == 0 {
            break;
        }
    }
    out.into_iter().map(char::from).collect()
}
