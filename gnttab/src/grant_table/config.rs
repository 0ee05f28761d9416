//! Grant table sizing

use super::Error;

/// Limits applied to a domain's grant table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantTableConfig {
    /// Grant frames allocated when the table is created
    pub initial_frames: usize,
    /// Upper bound on grant frames, reached by growth
    pub max_grant_frames: usize,
    /// Upper bound on map-track frames
    pub max_maptrack_frames: usize,
}

impl Default for GrantTableConfig {
    fn default() -> Self {
        Self {
            initial_frames: 1,
            max_grant_frames: 32,
            max_maptrack_frames: 8,
        }
    }
}

impl GrantTableConfig {
    /// Checks the limits are usable
    pub fn validate(&self) -> Result<(), Error> {
        if self.initial_frames == 0
            || self.max_maptrack_frames == 0
            || self.initial_frames > self.max_grant_frames
        {
            return Err(Error::InvalidConfig);
        }

        Ok(())
    }
}
