use std::time::Duration;

use rand::{thread_rng, Rng};
use tokio::time::sleep;

use crate::config::PacingSection;

/// Human-like pauses around interactive actions. Pacing is a bot-detection
/// mitigation only; nothing depends on the exact durations.
#[derive(Debug, Clone)]
pub struct HumanPacer {
    config: PacingSection,
}

impl HumanPacer {
    pub fn new(config: PacingSection) -> Self {
        Self { config }
    }

    pub async fn pause(&self, range_ms: (u64, u64)) -> u64 {
        let millis = random_millis(range_ms);
        if millis > 0 {
            sleep(Duration::from_millis(millis)).await;
        }
        millis
    }

    pub fn typing_delay(&self) -> Duration {
        let [low, high] = self.config.typing_delay_ms;
        Duration::from_millis(random_millis((low, high)))
    }
}

pub(crate) fn random_millis(range_ms: (u64, u64)) -> u64 {
    if range_ms.0 == 0 && range_ms.1 == 0 {
        return 0;
    }
    let lower = range_ms.0.min(range_ms.1);
    let upper = range_ms.0.max(range_ms.1);
    thread_rng().gen_range(lower..=upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_millis_respects_reversed_bounds() {
        for _ in 0..50 {
            let value = random_millis((300, 100));
            assert!((100..=300).contains(&value));
        }
        assert_eq!(random_millis((0, 0)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_sleeps_within_range() {
        let pacer = HumanPacer::new(PacingSection::default());
        let start = tokio::time::Instant::now();
        let waited = pacer.pause((200, 200)).await;
        assert_eq!(waited, 200);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
