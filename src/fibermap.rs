//! # Fibermap Handling
//!
//! Per-fiber metadata, implemented only to the depth the scheduler needs:
//! fiber status maskbits, bad-amplifier masking, and the sky-fiber test used
//! by the sky-selection stage. Full fibermap assembly (fiber positions,
//! target catalogs, guider metadata) is an external collaborator invoked as
//! a command.

use crate::camword::{parse_badamps, Band};
use crate::constants::instrument::{FIBERS_PER_AMP, FIBERS_PER_SPECTROGRAPH, NUM_SPECTROGRAPHS};
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Fiber status maskbits. Only the bits the scheduling layer sets or reads
/// are defined here; the numeric positions are part of the data model and
/// must not change.
pub mod fibermask {
    /// Amplifier readout issues make the b-camera spectrum unusable
    pub const BADAMPB: u32 = 1 << 22;
    /// Amplifier readout issues make the r-camera spectrum unusable
    pub const BADAMPR: u32 = 1 << 23;
    /// Amplifier readout issues make the z-camera spectrum unusable
    pub const BADAMPZ: u32 = 1 << 24;

    pub fn badamp_bit(band: super::Band) -> u32 {
        match band {
            super::Band::B => BADAMPB,
            super::Band::R => BADAMPR,
            super::Band::Z => BADAMPZ,
        }
    }
}

/// One fiber's scheduling-relevant metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiberRecord {
    pub fiber: u32,
    pub objtype: String,
    pub fiberstatus: u32,
}

/// Per-fiber metadata table attached to an exposure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fibermap {
    pub fibers: Vec<FiberRecord>,
}

impl Fibermap {
    /// A full instrument fibermap with all fibers unflagged.
    pub fn all_fibers() -> Fibermap {
        let total = u32::from(NUM_SPECTROGRAPHS) * FIBERS_PER_SPECTROGRAPH;
        Fibermap {
            fibers: (0..total)
                .map(|fiber| FiberRecord {
                    fiber,
                    objtype: "TGT".to_string(),
                    fiberstatus: 0,
                })
                .collect(),
        }
    }

    /// True when any fiber is already marked as sky; the sky-selection
    /// stage skips frames whose fibermap already carries the marking.
    pub fn has_sky_fibers(&self) -> bool {
        self.fibers.iter().any(|f| f.objtype == "SKY")
    }

    /// Set the per-band BADAMP status bit for every fiber read out through
    /// a flagged amplifier. Amps A and C cover the first half of a
    /// spectrograph's fibers, B and D the second half.
    pub fn apply_badamps(&mut self, badamps: &str) -> Result<()> {
        for bad in parse_badamps(badamps)? {
            let maskbit = fibermask::badamp_bit(bad.band);
            let offset = match bad.amp {
                'B' | 'D' => FIBERS_PER_AMP,
                _ => 0,
            };
            let fibermin = u32::from(bad.spectrograph) * FIBERS_PER_SPECTROGRAPH + offset;
            let fibermax = fibermin + FIBERS_PER_AMP;
            tracing::info!(
                badamp = %bad,
                fibermin,
                fibermax = fibermax - 1,
                "Masking fibers for flagged amplifier"
            );
            for record in &mut self.fibers {
                if record.fiber >= fibermin && record.fiber < fibermax {
                    record.fiberstatus |= maskbit;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_badamps_mask_expected_fiber_ranges() {
        let mut fm = Fibermap::all_fibers();
        fm.apply_badamps("b7D,z8A").unwrap();

        // b7D: upper half of spectrograph 7
        for fiber in 7 * 500 + 250..7 * 500 + 500 {
            assert_ne!(
                fm.fibers[fiber].fiberstatus & fibermask::BADAMPB,
                0,
                "fiber {fiber} should carry BADAMPB"
            );
        }
        assert_eq!(fm.fibers[7 * 500 + 249].fiberstatus & fibermask::BADAMPB, 0);

        // z8A: lower half of spectrograph 8
        for fiber in 8 * 500..8 * 500 + 250 {
            assert_ne!(fm.fibers[fiber].fiberstatus & fibermask::BADAMPZ, 0);
        }
        assert_eq!(fm.fibers[8 * 500 + 250].fiberstatus & fibermask::BADAMPZ, 0);

        // no cross-band contamination
        assert_eq!(fm.fibers[7 * 500 + 300].fiberstatus & fibermask::BADAMPZ, 0);
    }

    #[test]
    fn test_malformed_badamps_rejected() {
        let mut fm = Fibermap::all_fibers();
        assert!(fm.apply_badamps("b7Q").is_err());
    }

    #[test]
    fn test_sky_fiber_detection() {
        let mut fm = Fibermap::all_fibers();
        assert!(!fm.has_sky_fibers());
        fm.fibers[42].objtype = "SKY".to_string();
        assert!(fm.has_sky_fibers());
    }
}
