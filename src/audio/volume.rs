//! Volume control shared between the player and the audio decoder
//!
//! The player changes the volume from its controlling thread; the audio
//! decoder's worker picks the new level up on its next render.

use parking_lot::RwLock;
use std::sync::Arc;

/// Volume level, cheap to clone and share
#[derive(Debug, Clone)]
pub struct VolumeControl {
    /// Master volume (0.0 to 1.0)
    master_volume: Arc<RwLock<f32>>,
}

impl VolumeControl {
    pub fn new(volume: f32) -> Self {
        Self {
            master_volume: Arc::new(RwLock::new(volume.clamp(0.0, 1.0))),
        }
    }

    /// Set master volume (0.0 to 1.0)
    pub fn set_volume(&self, volume: f32) {
        *self.master_volume.write() = volume.clamp(0.0, 1.0);
    }

    pub fn volume(&self) -> f32 {
        *self.master_volume.read()
    }
}

impl Default for VolumeControl {
    fn default() -> Self {
        Self::new(1.0)
    }
}
