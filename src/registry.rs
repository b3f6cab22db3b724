//! Registry holding the currently active axis pack.
//!
//! An explicit, constructor-injected service object, never ambient global
//! state, so independent registries can coexist (one per test, one per
//! tenant). The active pointer is swapped atomically behind a `RwLock`:
//! readers clone an `Arc` and observe either the old pack or the new pack
//! in full, never a partially updated one.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::CoreError;
use crate::pack::AxisPack;

#[derive(Debug, Default)]
struct RegistryState {
    packs: HashMap<String, Arc<AxisPack>>,
    active: Option<Arc<AxisPack>>,
}

/// Thread-safe pack registry with swap-on-activate.
#[derive(Debug)]
pub struct AxisRegistry {
    encoder_dim: usize,
    state: RwLock<RegistryState>,
}

impl AxisRegistry {
    /// Create a registry bound to one encoder dimension.
    pub fn new(encoder_dim: usize) -> Self {
        Self {
            encoder_dim,
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub fn encoder_dim(&self) -> usize {
        self.encoder_dim
    }

    /// Insert a validated pack. Id collisions are rejected, never
    /// overwritten; concurrent builders targeting the same id must fail.
    pub fn insert(&self, pack: AxisPack) -> Result<(), CoreError> {
        pack.validate()?;
        if pack.d() != self.encoder_dim {
            return Err(CoreError::DimensionMismatch {
                pack_id: pack.id.clone(),
                expected: self.encoder_dim,
                actual: pack.d(),
            });
        }
        let mut state = self.state.write();
        if state.packs.contains_key(&pack.id) {
            return Err(CoreError::configuration(format!(
                "pack id collision: {} already registered",
                pack.id
            )));
        }
        state.packs.insert(pack.id.clone(), Arc::new(pack));
        Ok(())
    }

    /// Look up a pack by id.
    pub fn get(&self, pack_id: &str) -> Result<Arc<AxisPack>, CoreError> {
        self.state
            .read()
            .packs
            .get(pack_id)
            .cloned()
            .ok_or_else(|| CoreError::PackNotFound {
                pack_id: pack_id.to_string(),
            })
    }

    /// Atomically make a registered pack the active one.
    pub fn activate(&self, pack_id: &str) -> Result<Arc<AxisPack>, CoreError> {
        let mut state = self.state.write();
        let pack = state
            .packs
            .get(pack_id)
            .cloned()
            .ok_or_else(|| CoreError::PackNotFound {
                pack_id: pack_id.to_string(),
            })?;
        state.active = Some(pack.clone());
        debug!(pack_id, "activated axis pack");
        Ok(pack)
    }

    /// The currently active pack, if any.
    pub fn active(&self) -> Option<Arc<AxisPack>> {
        self.state.read().active.clone()
    }

    /// Registered pack ids, sorted.
    pub fn pack_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.read().packs.keys().cloned().collect();
        ids.sort();
        ids
    }
}
