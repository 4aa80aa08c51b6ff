//! # Stage Gating
//!
//! Which reduction stages apply to an exposure is a pure function of its
//! observation type and the caller's skip flags. Keeping the gating rules
//! here, separate from the command plumbing, makes the obstype-conditioned
//! stage table directly testable.

use crate::constants::ObsType;
use crate::proc::ProcOptions;

/// Everything gets preprocessed, except science exposures running in the
/// post-standard-star phase only.
pub fn runs_preproc(opts: &ProcOptions) -> bool {
    !(opts.obstype == ObsType::Science && opts.no_prestdstar)
}

/// Trace shifts run for continuum and sky-bearing frames, plus science
/// exposures in their pre-standard-star phase.
pub fn runs_traceshift(opts: &ProcOptions) -> bool {
    matches!(
        opts.obstype,
        ObsType::Flat | ObsType::TestFlat | ObsType::Sky | ObsType::Twilight
    ) || (opts.obstype == ObsType::Science && !opts.no_prestdstar)
}

/// The single-exposure PSF fit only applies to arc lamps.
pub fn runs_psf_fit(opts: &ProcOptions) -> bool {
    opts.obstype.is_arc_like()
}

/// Extraction mirrors the traceshift gating.
pub fn runs_extraction(opts: &ProcOptions) -> bool {
    runs_traceshift(opts)
}

pub fn runs_fiberflat(opts: &ProcOptions) -> bool {
    opts.obstype.is_flat_like()
}

/// Sky-fiber selection and sky subtraction.
pub fn runs_sky_stages(opts: &ProcOptions) -> bool {
    matches!(opts.obstype, ObsType::Sky | ObsType::Science)
        && !opts.no_skysub
        && !opts.no_prestdstar
}

pub fn runs_stdstar_fit(opts: &ProcOptions) -> bool {
    opts.obstype == ObsType::Science && !opts.no_skysub && !opts.no_stdstarfit
}

/// Flux calibration and the final calibrated-frame write share gating.
pub fn runs_fluxcalib(opts: &ProcOptions) -> bool {
    opts.obstype == ObsType::Science && !opts.no_skysub && !opts.no_fluxcalib
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camword::Camword;

    fn opts(obstype: ObsType) -> ProcOptions {
        ProcOptions {
            night: 20210115,
            expid: 42,
            obstype,
            cameras: Camword::full(),
            ..ProcOptions::default()
        }
    }

    #[test]
    fn test_arc_stage_plan() {
        let o = opts(ObsType::Arc);
        assert!(runs_preproc(&o));
        assert!(runs_psf_fit(&o));
        assert!(!runs_traceshift(&o));
        assert!(!runs_extraction(&o));
        assert!(!runs_fiberflat(&o));
        assert!(!runs_sky_stages(&o));
        assert!(!runs_stdstar_fit(&o));
        assert!(!runs_fluxcalib(&o));
    }

    #[test]
    fn test_flat_stage_plan() {
        let o = opts(ObsType::Flat);
        assert!(runs_traceshift(&o));
        assert!(runs_extraction(&o));
        assert!(runs_fiberflat(&o));
        assert!(!runs_psf_fit(&o));
        assert!(!runs_sky_stages(&o));
    }

    #[test]
    fn test_science_stage_plan() {
        let o = opts(ObsType::Science);
        assert!(runs_preproc(&o));
        assert!(runs_traceshift(&o));
        assert!(runs_extraction(&o));
        assert!(runs_sky_stages(&o));
        assert!(runs_stdstar_fit(&o));
        assert!(runs_fluxcalib(&o));
    }

    #[test]
    fn test_noskysub_disables_downstream_science_stages() {
        let mut o = opts(ObsType::Science);
        o.no_skysub = true;
        assert!(!runs_sky_stages(&o));
        assert!(!runs_stdstar_fit(&o));
        assert!(!runs_fluxcalib(&o));
        // extraction still runs
        assert!(runs_extraction(&o));
    }

    #[test]
    fn test_poststdstar_phase_skips_early_stages() {
        let mut o = opts(ObsType::Science);
        o.no_prestdstar = true;
        o.no_stdstarfit = true;
        assert!(!runs_preproc(&o));
        assert!(!runs_traceshift(&o));
        assert!(!runs_extraction(&o));
        assert!(!runs_sky_stages(&o));
        assert!(!runs_stdstar_fit(&o));
        assert!(runs_fluxcalib(&o));
    }

    #[test]
    fn test_zero_and_dark_only_preprocess() {
        for obstype in [ObsType::Zero, ObsType::Dark] {
            let o = opts(obstype);
            assert!(runs_preproc(&o));
            assert!(!runs_traceshift(&o));
            assert!(!runs_extraction(&o));
            assert!(!runs_psf_fit(&o));
        }
    }
}
