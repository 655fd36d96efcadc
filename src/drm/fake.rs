//! Simulated KMS topology for tests

use anyhow::{bail, Result};
use std::sync::Mutex;

use super::kms::{ConnectorProbe, DisplayMode, EncoderProbe, KmsDevice, PlaneProbe, ResourceSnapshot};

#[derive(Default)]
pub(crate) struct Topology {
    pub crtcs: Vec<u32>,
    pub connectors: Vec<ConnectorProbe>,
    pub encoders: Vec<EncoderProbe>,
    pub planes: Vec<PlaneProbe>,
    pub fail_resources: bool,
    pub fail_connectors: Vec<u32>,
    pub fail_encoders: Vec<u32>,
    /// SET_MASTER succeeds
    pub master_available: bool,
    pub master_held: bool,
    pub set_master_calls: u32,
    pub drop_master_calls: u32,
    pub drop_master_fails: bool,
}

pub(crate) struct FakeCard {
    topology: Mutex<Topology>,
}

pub(crate) fn mode(name: &str, preferred: bool) -> DisplayMode {
    DisplayMode {
        name: name.to_string(),
        clock: 148_500,
        hdisplay: 1920,
        vdisplay: 1080,
        vrefresh: 60,
        preferred,
    }
}

impl FakeCard {
    pub fn new(crtcs: &[u32]) -> Self {
        Self {
            topology: Mutex::new(Topology {
                crtcs: crtcs.to_vec(),
                master_available: true,
                ..Default::default()
            }),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Topology) -> R) -> R {
        f(&mut self.topology.lock().unwrap())
    }

    pub fn add_connector(&self, id: u32, modes: Vec<DisplayMode>, encoder_id: u32, encoders: &[u32]) {
        self.with(|t| {
            t.connectors.push(ConnectorProbe {
                id,
                connected: true,
                modes,
                encoder_id,
                encoders: encoders.to_vec(),
            })
        });
    }

    pub fn add_encoder(&self, id: u32, crtc_id: u32, possible_crtcs: u32) {
        self.with(|t| {
            t.encoders.push(EncoderProbe {
                id,
                crtc_id,
                possible_crtcs,
            })
        });
    }

    pub fn unplug(&self, id: u32) {
        self.with(|t| {
            if let Some(c) = t.connectors.iter_mut().find(|c| c.id == id) {
                c.connected = false;
                c.modes.clear();
                c.encoder_id = 0;
            }
        });
    }
}

impl KmsDevice for FakeCard {
    fn resources(&self) -> Result<ResourceSnapshot> {
        self.with(|t| {
            if t.fail_resources {
                bail!("resources unavailable");
            }
            Ok(ResourceSnapshot {
                crtcs: t.crtcs.clone(),
                connectors: t.connectors.iter().map(|c| c.id).collect(),
            })
        })
    }

    fn connector(&self, id: u32) -> Result<ConnectorProbe> {
        self.with(|t| {
            if t.fail_connectors.contains(&id) {
                bail!("connector {} query failed", id);
            }
            match t.connectors.iter().find(|c| c.id == id) {
                Some(c) => Ok(c.clone()),
                None => bail!("no connector {}", id),
            }
        })
    }

    fn encoder(&self, id: u32) -> Result<EncoderProbe> {
        self.with(|t| {
            if t.fail_encoders.contains(&id) {
                bail!("encoder {} query failed", id);
            }
            match t.encoders.iter().find(|e| e.id == id) {
                Some(e) => Ok(*e),
                None => bail!("no encoder {}", id),
            }
        })
    }

    fn planes(&self) -> Result<Vec<PlaneProbe>> {
        Ok(self.with(|t| t.planes.clone()))
    }

    fn set_master(&self) -> Result<()> {
        self.with(|t| {
            t.set_master_calls += 1;
            if !t.master_available {
                bail!("SET_MASTER: device busy");
            }
            t.master_held = true;
            Ok(())
        })
    }

    fn drop_master(&self) -> Result<()> {
        self.with(|t| {
            t.drop_master_calls += 1;
            if t.drop_master_fails {
                bail!("DROP_MASTER: not permitted");
            }
            t.master_held = false;
            Ok(())
        })
    }

    fn authenticate(&self) -> Result<()> {
        self.with(|t| {
            if !t.master_held {
                bail!("not master");
            }
            Ok(())
        })
    }
}
