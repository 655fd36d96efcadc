//! DRM master arbitration
//!
//! The compositor may share the device with another master (e.g. during a
//! session switch). Failing to get or give up master rights is logged and
//! retried a bounded number of times; it never becomes a hard error.

use log::{error, info, warn};
use std::thread;

use super::kms::KmsDevice;
use crate::constants::{MASTER_RETRY_BACKOFF, MASTER_RETRY_LIMIT};

/// Single best-effort check that the descriptor holds master rights
///
/// No-op when `held` is already set.
pub fn acquire_master_once<D: KmsDevice + ?Sized>(device: &D, held: &mut bool) -> bool {
    if *held {
        return true;
    }

    match device.authenticate() {
        Ok(()) => {
            info!("DRM master held by default");
            *held = true;
        }
        Err(e) => warn!("Not DRM master: {:#}", e),
    }
    *held
}

/// Claim master rights, retrying up to `MASTER_RETRY_LIMIT` times
///
/// Returns the number of attempts made. Without `force` this is a no-op
/// while `held` is set. With `force` the claim is re-issued even when held;
/// the retry bound is the same either way.
pub fn set_master<D: KmsDevice + ?Sized>(device: &D, held: &mut bool, force: bool) -> u32 {
    if *held && !force {
        return 0;
    }

    let mut attempts = 0;
    while attempts < MASTER_RETRY_LIMIT {
        attempts += 1;
        match device.set_master() {
            Ok(()) => {
                info!("DRM master acquired (attempt {})", attempts);
                *held = true;
                return attempts;
            }
            Err(e) => {
                warn!("{:#}", e);
                *held = false;
                if attempts < MASTER_RETRY_LIMIT {
                    thread::sleep(MASTER_RETRY_BACKOFF);
                }
            }
        }
    }

    error!(
        "Giving up on DRM master after {} attempts, continuing without it",
        attempts
    );
    attempts
}

/// Release master rights, retrying up to `MASTER_RETRY_LIMIT` times
///
/// No-op when master rights are not held. Returns the number of attempts.
pub fn drop_master<D: KmsDevice + ?Sized>(device: &D, held: &mut bool) -> u32 {
    if !*held {
        return 0;
    }

    let mut attempts = 0;
    while attempts < MASTER_RETRY_LIMIT {
        attempts += 1;
        match device.drop_master() {
            Ok(()) => {
                info!("DRM master dropped");
                *held = false;
                return attempts;
            }
            Err(e) => {
                warn!("{:#}", e);
                if attempts < MASTER_RETRY_LIMIT {
                    thread::sleep(MASTER_RETRY_BACKOFF);
                }
            }
        }
    }

    error!("Giving up on dropping DRM master after {} attempts", attempts);
    attempts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::fake::FakeCard;

    #[test]
    fn test_set_master_retry_bound() {
        let card = FakeCard::new(&[41]);
        card.with(|t| t.master_available = false);
        let mut held = false;

        assert_eq!(set_master(&card, &mut held, false), 10);
        assert!(!held);
        assert_eq!(card.with(|t| t.set_master_calls), 10);
    }

    #[test]
    fn test_set_master_stops_on_success() {
        let card = FakeCard::new(&[41]);
        let mut held = false;

        assert_eq!(set_master(&card, &mut held, true), 1);
        assert!(held);

        // Already held: no kernel call unless forced
        assert_eq!(set_master(&card, &mut held, false), 0);
        assert_eq!(set_master(&card, &mut held, true), 1);
        assert_eq!(card.with(|t| t.set_master_calls), 2);
    }

    #[test]
    fn test_drop_master() {
        let card = FakeCard::new(&[41]);
        let mut held = false;
        assert_eq!(drop_master(&card, &mut held), 0);

        held = true;
        card.with(|t| t.drop_master_fails = true);
        assert_eq!(drop_master(&card, &mut held), 10);
        assert!(held);

        card.with(|t| t.drop_master_fails = false);
        assert_eq!(drop_master(&card, &mut held), 1);
        assert!(!held);
    }

    #[test]
    fn test_acquire_master_once_idempotent() {
        let card = FakeCard::new(&[41]);
        let mut held = false;
        assert!(!acquire_master_once(&card, &mut held));

        card.with(|t| t.master_held = true);
        assert!(acquire_master_once(&card, &mut held));

        card.with(|t| t.master_held = false);
        assert!(acquire_master_once(&card, &mut held));
    }
}
