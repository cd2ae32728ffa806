//! Host fault-injection profiles. The listener applies these to inbound
//! traffic; the consensus engine never sees them and must simply survive
//! them.

use std::time::Duration;

use clap::ValueEnum;
use rand::Rng;

/// Network behavior assigned to one process at launch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Profile {
    /// No delay, no loss.
    Reliable,
    /// Slow links: 200–1000 ms handling delay, 5 % loss.
    Latent,
    /// Crash-prone: light jitter, 25 % loss, and a coin flip on terminating
    /// shortly after serving a propose trigger.
    Failure,
    /// Everyday network: 20–220 ms handling delay, 2 % loss.
    Standard,
}

impl Profile {
    /// Artificial delay before an inbound message is handled.
    #[must_use]
    pub fn inbound_delay(self, rng: &mut impl Rng) -> Option<Duration> {
        let ms = match self {
            Profile::Reliable => return None,
            Profile::Latent => rng.random_range(200..1000),
            Profile::Standard => rng.random_range(20..220),
            Profile::Failure => rng.random_range(10..60),
        };
        Some(Duration::from_millis(ms))
    }

    /// Whether to silently drop an inbound message.
    #[must_use]
    pub fn should_drop(self, rng: &mut impl Rng) -> bool {
        let rate = match self {
            Profile::Reliable => return false,
            Profile::Latent => 0.05,
            Profile::Standard => 0.02,
            Profile::Failure => 0.25,
        };
        rng.random_bool(rate)
    }

    /// Whether this process should die shortly after serving a propose
    /// trigger, leaving its prepare broadcast orphaned.
    #[must_use]
    pub fn crash_after_propose(self, rng: &mut impl Rng) -> bool {
        self == Profile::Failure && rng.random_bool(0.5)
    }
}
