use std::sync::{Mutex, RwLock};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::codec::ExceptionCode;
use crate::config::FaultConfig;

/// Resolved fault profile; copied per request so a mid-flight update never
/// tears.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaultProfile {
    pub latency: Duration,
    pub drop_rate: f32,
    pub bit_flip_rate: f32,
    pub forced_exception: Option<ExceptionCode>,
}

impl From<&FaultConfig> for FaultProfile {
    fn from(config: &FaultConfig) -> Self {
        Self {
            latency: Duration::from_millis(u64::from(config.latency_ms)),
            drop_rate: config.drop_rate.clamp(0.0, 1.0),
            bit_flip_rate: config.bit_flip_rate.clamp(0.0, 1.0),
            forced_exception: config.forced_exception.and_then(ExceptionCode::from_u8),
        }
    }
}

impl Default for FaultProfile {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            drop_rate: 0.0,
            bit_flip_rate: 0.0,
            forced_exception: None,
        }
    }
}

/// Shared fault state with atomic profile swaps.
#[derive(Debug)]
pub struct FaultInjector {
    profile: RwLock<FaultProfile>,
    rng: Mutex<SmallRng>,
}

impl FaultInjector {
    pub fn new(profile: FaultProfile) -> Self {
        Self {
            profile: RwLock::new(profile),
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    /// A request in flight keeps the profile it sampled here.
    pub fn snapshot(&self) -> FaultProfile {
        *self.profile.read().expect("fault profile poisoned")
    }

    pub fn update(&self, profile: FaultProfile) {
        *self.profile.write().expect("fault profile poisoned") = profile;
    }

    pub fn roll_drop(&self, profile: &FaultProfile) -> bool {
        if profile.drop_rate <= 0.0 {
            return false;
        }
        self.rng
            .lock()
            .expect("fault rng poisoned")
            .gen::<f32>()
            < profile.drop_rate
    }

    /// Flips each payload bit with probability `bit_flip_rate`; returns the
    /// number of flipped bits.
    pub fn flip_bits(&self, profile: &FaultProfile, payload: &mut [u8]) -> u32 {
        if profile.bit_flip_rate <= 0.0 {
            return 0;
        }
        let mut rng = self.rng.lock().expect("fault rng poisoned");
        let mut flipped = 0;
        for byte in payload.iter_mut() {
            for bit in 0..8 {
                if rng.gen::<f32>() < profile.bit_flip_rate {
                    *byte ^= 1 << bit;
                    flipped += 1;
                }
            }
        }
        flipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_rates_never_fire() {
        let injector = FaultInjector::new(FaultProfile::default());
        let profile = injector.snapshot();
        for _ in 0..100 {
            assert!(!injector.roll_drop(&profile));
        }
        let mut payload = [0xAAu8; 16];
        assert_eq!(injector.flip_bits(&profile, &mut payload), 0);
        assert_eq!(payload, [0xAAu8; 16]);
    }

    #[test]
    fn test_full_drop_rate_always_fires() {
        let config = FaultConfig {
            drop_rate: 1.0,
            ..Default::default()
        };
        let injector = FaultInjector::new(FaultProfile::from(&config));
        let profile = injector.snapshot();
        for _ in 0..100 {
            assert!(injector.roll_drop(&profile));
        }
    }

    #[test]
    fn test_full_flip_rate_inverts_payload() {
        let config = FaultConfig {
            bit_flip_rate: 1.0,
            ..Default::default()
        };
        let injector = FaultInjector::new(FaultProfile::from(&config));
        let profile = injector.snapshot();
        let mut payload = [0x00u8, 0xFF];
        assert_eq!(injector.flip_bits(&profile, &mut payload), 16);
        assert_eq!(payload, [0xFF, 0x00]);
    }

    #[test]
    fn test_profile_update_swaps_atomically() {
        let injector = FaultInjector::new(FaultProfile::default());
        let before = injector.snapshot();

        let config = FaultConfig {
            latency_ms: 500,
            drop_rate: 0.5,
            ..Default::default()
        };
        injector.update(FaultProfile::from(&config));

        // The earlier snapshot is unaffected; new snapshots see the update.
        assert_eq!(before.latency, Duration::ZERO);
        assert_eq!(injector.snapshot().latency, Duration::from_millis(500));
    }
}
