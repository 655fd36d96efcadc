//! Display plane reservation
//!
//! Platforms may pin a few planes to a display. Once per epoch (until the
//! display disconnects) every connected display gives back the planes it
//! was not reserved.

use log::debug;

use super::display::PhysicalDisplay;
use crate::config::PlaneConfig;
use crate::constants::MAX_RESERVED_PLANES;

/// Prune unreserved planes from connected displays not yet pruned
///
/// Returns the number of displays that released planes.
pub fn remove_unreserved_planes(displays: &mut [PhysicalDisplay], config: &PlaneConfig) -> usize {
    let mut pruned = 0;
    for display in displays.iter_mut() {
        if !display.is_connected() || display.planes_updated() {
            continue;
        }

        let reserved = config.reserved_planes(display.pipe());
        if !reserved.is_empty() && reserved.len() < MAX_RESERVED_PLANES {
            display.release_unreserved_planes(reserved);
            pruned += 1;
        } else {
            debug!("Display {}: no plane reservation", display.pipe());
        }
        display.set_planes_updated(true);
    }
    pruned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlaneReservation;
    use crate::drm::fake::mode;

    fn config(reserved: Vec<PlaneReservation>) -> PlaneConfig {
        PlaneConfig {
            reserve: true,
            reserved,
        }
    }

    fn connected(pipe: usize, planes: Vec<u32>) -> PhysicalDisplay {
        let mut display = PhysicalDisplay::new(pipe, 41 + pipe as u32, planes);
        display.connect(10 + pipe as u32, vec![mode("a", true)], 0);
        display
    }

    #[test]
    fn test_prune_once_per_epoch() {
        let cfg = config(vec![PlaneReservation {
            display: 0,
            planes: vec![31],
        }]);
        let mut displays = vec![connected(0, vec![31, 32, 33])];

        assert_eq!(remove_unreserved_planes(&mut displays, &cfg), 1);
        assert_eq!(displays[0].planes(), &[31]);
        assert_eq!(remove_unreserved_planes(&mut displays, &cfg), 0);
        assert!(displays[0].planes_updated());
    }

    #[test]
    fn test_skips_disconnected_and_oversized() {
        let cfg = config(vec![
            PlaneReservation {
                display: 0,
                planes: vec![31, 32, 33, 34],
            },
            PlaneReservation {
                display: 1,
                planes: vec![35],
            },
        ]);
        let mut displays = vec![
            connected(0, vec![31, 32, 33, 34, 35]),
            PhysicalDisplay::new(1, 42, vec![35, 36]),
        ];

        assert_eq!(remove_unreserved_planes(&mut displays, &cfg), 0);
        assert_eq!(displays[0].planes().len(), 5);
        assert!(displays[0].planes_updated());
        assert_eq!(displays[1].planes(), &[35, 36]);
        assert!(!displays[1].planes_updated());
    }
}
