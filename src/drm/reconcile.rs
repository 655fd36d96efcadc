//! Connector → encoder → CRTC reconciliation
//!
//! One pass re-derives which outputs are connected and which pipeline
//! drives each of them. Binding is two-phase:
//!
//! 1. outputs whose connector already has an encoder bound to a CRTC go to
//!    the display owning that CRTC;
//! 2. the remaining outputs try each of their encoders and take the first
//!    unconnected display whose pipe is in the encoder's possible-CRTC mask.
//!
//! In both phases displays are scanned in ascending pipe order and the
//! first eligible one wins.

use anyhow::{Context, Result};
use log::{debug, warn};

use super::display::PhysicalDisplay;
use super::kms::{preferred_mode_index, ConnectorProbe, KmsDevice};

/// What a reconciliation pass observed and changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassOutcome {
    /// Connectors reporting a live connection
    pub connected_outputs: u32,
    /// (pipe, connector) pairs bound by this pass
    pub bound: Vec<(usize, u32)>,
    /// Pipes that were connected before the pass and no longer are
    pub lost: Vec<usize>,
}

/// Run one reconciliation pass over `displays`
///
/// Fails without touching any display when the resource snapshot cannot be
/// fetched. Connectors or encoders that cannot be queried are skipped.
pub fn reconcile<D: KmsDevice + ?Sized>(
    device: &D,
    displays: &mut [PhysicalDisplay],
    reserve_planes: bool,
) -> Result<PassOutcome> {
    let resources = device
        .resources()
        .context("Failed to get DRM resources for reconciliation")?;

    let was_connected: Vec<bool> = displays.iter().map(|d| d.is_connected()).collect();

    // Start by assuming nothing is connected
    for display in displays.iter_mut() {
        if reserve_planes && !display.is_connected() {
            display.set_planes_updated(false);
        }
        display.mark_for_disconnect();
    }

    let mut outcome = PassOutcome::default();
    let mut probes = Vec::with_capacity(resources.connectors.len());
    for &id in &resources.connectors {
        match device.connector(id) {
            Ok(probe) => {
                if probe.connected {
                    outcome.connected_outputs += 1;
                    probes.push(probe);
                }
            }
            Err(e) => warn!("Skipping connector {}: {:#}", id, e),
        }
    }

    let mut deferred = Vec::new();
    for probe in probes {
        // Ensure we have at least one valid mode
        if probe.modes.is_empty() {
            debug!("Connector {} has no modes", probe.id);
            continue;
        }

        if probe.encoder_id == 0 {
            deferred.push(probe);
            continue;
        }

        let encoder = match device.encoder(probe.encoder_id) {
            Ok(encoder) => encoder,
            Err(e) => {
                warn!(
                    "Skipping connector {} (encoder {}): {:#}",
                    probe.id, probe.encoder_id, e
                );
                continue;
            }
        };

        if encoder.crtc_id == 0 {
            deferred.push(probe);
            continue;
        }

        match bind_first(displays, &probe, |d| d.crtc_id() == encoder.crtc_id) {
            Some(pipe) => outcome.bound.push((pipe, probe.id)),
            None => debug!(
                "Connector {}: crtc {} already taken",
                probe.id, encoder.crtc_id
            ),
        }
    }

    // Connectors without a usable encoder: try every encoder they support
    for probe in deferred {
        let mut bound = None;
        for &encoder_id in &probe.encoders {
            let encoder = match device.encoder(encoder_id) {
                Ok(encoder) => encoder,
                Err(e) => {
                    warn!("Skipping encoder {}: {:#}", encoder_id, e);
                    continue;
                }
            };

            bound = bind_first(displays, &probe, |d| {
                d.pipe() < 32 && encoder.possible_crtcs & (1 << d.pipe()) != 0
            });
            if bound.is_some() {
                break;
            }
        }

        match bound {
            Some(pipe) => outcome.bound.push((pipe, probe.id)),
            None => warn!("No free pipeline for connector {}", probe.id),
        }
    }

    for (display, was) in displays.iter_mut().zip(was_connected) {
        if !display.is_connected() {
            display.disconnect();
            if was {
                outcome.lost.push(display.pipe());
            }
        }
    }

    debug!(
        "Reconciled: {} connected outputs, bound {:?}, lost {:?}",
        outcome.connected_outputs, outcome.bound, outcome.lost
    );
    Ok(outcome)
}

/// Connect `probe` to the first unconnected display accepted by `eligible`
fn bind_first(
    displays: &mut [PhysicalDisplay],
    probe: &ConnectorProbe,
    eligible: impl Fn(&PhysicalDisplay) -> bool,
) -> Option<usize> {
    let preferred = preferred_mode_index(&probe.modes);
    displays
        .iter_mut()
        .filter(|d| !d.is_connected() && eligible(d))
        .find_map(|d| {
            d.connect(probe.id, probe.modes.clone(), preferred)
                .then(|| d.pipe())
        })
}
