//! Injectable time and randomness.
//!
//! Every component receives an [`Effects`] bundle instead of reading the system clock
//! or OS RNG directly. Production wiring uses [`SystemClock`] and [`OsRandom`]; tests
//! use [`ManualClock`] and [`SeededRandom`] so that runs are reproducible.

use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Wall-clock time source in milliseconds since the UNIX epoch
pub trait TimeEffects: Send + Sync {
    /// Current time in milliseconds
    fn now_ms(&self) -> u64;
}

/// Cryptographically secure randomness
pub trait RandomEffects: Send + Sync {
    /// Fill `dest` with random bytes
    fn fill_bytes(&self, dest: &mut [u8]);
}

/// System clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl TimeEffects for SystemClock {
    #[allow(clippy::disallowed_methods)]
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::UNIX_EPOCH
            .elapsed()
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `start_ms`
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    /// Move the clock forward
    pub fn advance_ms(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Move the clock forward by whole seconds
    pub fn advance_secs(&self, secs: u64) {
        self.advance_ms(secs.saturating_mul(1000));
    }

    /// Jump to an absolute time
    pub fn set_ms(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl TimeEffects for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Operating system CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomEffects for OsRandom {
    fn fill_bytes(&self, dest: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(dest);
    }
}

/// Seeded ChaCha20 stream for reproducible runs
pub struct SeededRandom {
    rng: Mutex<ChaCha20Rng>,
}

impl SeededRandom {
    /// Create from a 64-bit seed
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)),
        }
    }
}

impl std::fmt::Debug for SeededRandom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeededRandom").finish_non_exhaustive()
    }
}

impl RandomEffects for SeededRandom {
    fn fill_bytes(&self, dest: &mut [u8]) {
        self.rng.lock().fill_bytes(dest);
    }
}

/// Bundle of injected effects handed to every component
#[derive(Clone)]
pub struct Effects {
    /// Time source
    pub time: Arc<dyn TimeEffects>,
    /// Randomness source
    pub random: Arc<dyn RandomEffects>,
}

impl Effects {
    /// System clock and OS randomness
    pub fn production() -> Self {
        Self {
            time: Arc::new(SystemClock),
            random: Arc::new(OsRandom),
        }
    }

    /// Manual clock and seeded randomness. The clock handle is returned so tests
    /// can advance time.
    pub fn deterministic(seed: u64, start_ms: u64) -> (Self, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let effects = Self {
            time: clock.clone(),
            random: Arc::new(SeededRandom::new(seed)),
        };
        (effects, clock)
    }

    /// Build from explicit parts
    pub fn new(time: Arc<dyn TimeEffects>, random: Arc<dyn RandomEffects>) -> Self {
        Self { time, random }
    }

    /// Current time in milliseconds
    pub fn now_ms(&self) -> u64 {
        self.time.now_ms()
    }

    /// Current time in whole seconds
    pub fn now_secs(&self) -> u64 {
        self.time.now_ms() / 1000
    }

    /// Fixed-size random array
    pub fn random_bytes<const N: usize>(&self) -> [u8; N] {
        let mut out = [0u8; N];
        self.random.fill_bytes(&mut out);
        out
    }

    /// Random version-4 UUID drawn from the injected RNG
    pub fn random_uuid(&self) -> uuid::Uuid {
        uuid::Builder::from_random_bytes(self.random_bytes()).into_uuid()
    }
}

impl std::fmt::Debug for Effects {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effects")
            .field("now_ms", &self.time.now_ms())
            .finish_non_exhaustive()
    }
}
