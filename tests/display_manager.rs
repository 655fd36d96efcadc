//! Hotplug scenarios driven through the public API with a simulated device

use anyhow::{anyhow, Result};
use kmsdm::drm::kms::{
    ConnectorProbe, DisplayMode, EncoderProbe, KmsDevice, PlaneProbe, ResourceSnapshot,
};
use kmsdm::{Config, DisplayHandle, DisplayManager};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Topology {
    crtcs: Vec<u32>,
    connectors: Vec<ConnectorProbe>,
    encoders: Vec<EncoderProbe>,
}

/// Simulated card: topology can change between passes
#[derive(Default)]
struct SimCard {
    topology: Mutex<Topology>,
}

impl SimCard {
    fn new(crtcs: &[u32]) -> Self {
        let card = Self::default();
        card.topology.lock().unwrap().crtcs = crtcs.to_vec();
        card
    }

    fn encoder(&self, id: u32, crtc_id: u32, possible_crtcs: u32) {
        self.topology.lock().unwrap().encoders.push(EncoderProbe {
            id,
            crtc_id,
            possible_crtcs,
        });
    }

    fn plug(&self, id: u32, modes: Vec<DisplayMode>, encoder_id: u32, encoders: &[u32]) {
        let mut topology = self.topology.lock().unwrap();
        topology.connectors.retain(|c| c.id != id);
        topology.connectors.push(ConnectorProbe {
            id,
            connected: true,
            modes,
            encoder_id,
            encoders: encoders.to_vec(),
        });
    }

    fn unplug(&self, id: u32) {
        let mut topology = self.topology.lock().unwrap();
        if let Some(connector) = topology.connectors.iter_mut().find(|c| c.id == id) {
            connector.connected = false;
            connector.modes.clear();
        }
    }
}

impl KmsDevice for SimCard {
    fn resources(&self) -> Result<ResourceSnapshot> {
        let topology = self.topology.lock().unwrap();
        Ok(ResourceSnapshot {
            crtcs: topology.crtcs.clone(),
            connectors: topology.connectors.iter().map(|c| c.id).collect(),
        })
    }

    fn connector(&self, id: u32) -> Result<ConnectorProbe> {
        let topology = self.topology.lock().unwrap();
        topology
            .connectors
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| anyhow!("no connector {}", id))
    }

    fn encoder(&self, id: u32) -> Result<EncoderProbe> {
        let topology = self.topology.lock().unwrap();
        topology
            .encoders
            .iter()
            .find(|e| e.id == id)
            .copied()
            .ok_or_else(|| anyhow!("no encoder {}", id))
    }

    fn planes(&self) -> Result<Vec<PlaneProbe>> {
        Ok(Vec::new())
    }

    fn set_master(&self) -> Result<()> {
        Ok(())
    }

    fn drop_master(&self) -> Result<()> {
        Ok(())
    }

    fn authenticate(&self) -> Result<()> {
        Err(anyhow!("not master"))
    }
}

fn modes(preferred: Option<usize>, count: usize) -> Vec<DisplayMode> {
    (0..count)
        .map(|i| DisplayMode {
            name: format!("mode{}", i),
            clock: 148_500,
            hdisplay: 1920,
            vdisplay: 1080,
            vrefresh: 60,
            preferred: preferred == Some(i),
        })
        .collect()
}

fn record(manager: &DisplayManager<SimCard>) -> Arc<Mutex<Vec<Vec<DisplayHandle>>>> {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    manager.register_hotplug_callback(Arc::new(move |displays: &[DisplayHandle]| {
        sink.lock().unwrap().push(displays.to_vec());
    }));
    calls
}

#[test]
fn test_monitor_plugged_on_bound_encoder() {
    let card = SimCard::new(&[41, 42]);
    card.encoder(20, 41, 0b11);
    card.plug(10, modes(Some(1), 3), 20, &[20]);
    let manager = DisplayManager::new(card, Config::default()).unwrap();
    let calls = record(&manager);

    manager.update_display_state().unwrap();

    let displays = manager.displays();
    assert!(displays[0].connected);
    assert_eq!(displays[0].mode.as_ref().unwrap().name, "mode1");
    assert!(!displays[1].connected);
    assert_eq!(manager.connected_display_count(), 1);

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], vec![displays[0].clone()]);
}

#[test]
fn test_monitor_without_encoder_uses_second_candidate() {
    let card = SimCard::new(&[41, 42]);
    card.encoder(21, 0, 0b00);
    card.encoder(22, 0, 0b10);
    card.plug(11, modes(None, 2), 0, &[21, 22]);
    let manager = DisplayManager::new(card, Config::default()).unwrap();

    manager.update_display_state().unwrap();

    let displays = manager.displays();
    assert!(!displays[0].connected);
    assert!(displays[1].connected);
    assert_eq!(displays[1].connector_id, 11);
    assert_eq!(displays[1].mode.as_ref().unwrap().name, "mode0");
}

#[test]
fn test_plug_unplug_sequence() {
    let card = SimCard::new(&[41, 42]);
    card.encoder(20, 41, 0b01);
    card.encoder(21, 42, 0b10);
    card.plug(10, modes(Some(0), 1), 20, &[20]);
    let manager = DisplayManager::new(card, Config::default()).unwrap();
    let calls = record(&manager);

    manager.update_display_state().unwrap();
    manager.device().plug(11, modes(Some(0), 1), 21, &[21]);
    manager.update_display_state().unwrap();
    manager.device().unplug(10);
    manager.update_display_state().unwrap();

    let connected: Vec<Vec<u32>> = calls
        .lock()
        .unwrap()
        .iter()
        .map(|list| list.iter().map(|d| d.connector_id).collect())
        .collect();
    assert_eq!(connected, vec![vec![10], vec![10, 11], vec![11]]);
    assert_eq!(manager.connected_display_count(), 1);

    // Pipelines never change owner
    let crtcs: Vec<u32> = manager.displays().iter().map(|d| d.crtc_id).collect();
    assert_eq!(crtcs, vec![41, 42]);
}

#[test]
fn test_last_registered_callback_wins() {
    let card = SimCard::new(&[41]);
    let manager = DisplayManager::new(card, Config::default()).unwrap();
    let first = record(&manager);
    let second = record(&manager);

    manager.update_display_state().unwrap();
    assert!(first.lock().unwrap().is_empty());
    assert_eq!(second.lock().unwrap().len(), 1);
}
