//! Property-based coverage of the two reversible encodings the scheduler
//! leans on: camwords and task names.

use proptest::prelude::*;
use specpipe_core::camword::{Band, Camera, Camword};
use specpipe_core::tasks::{PipelineTask, TaskProps, TaskValue};
use specpipe_core::tasks::types::{ExtractTask, PsfNightTask, StarFitTask};

fn arb_camera() -> impl Strategy<Value = Camera> {
    (0u8..3, 0u8..10).prop_map(|(band, sp)| {
        let band = match band {
            0 => Band::B,
            1 => Band::R,
            _ => Band::Z,
        };
        Camera::new(band, sp).unwrap()
    })
}

fn arb_camword() -> impl Strategy<Value = Camword> {
    proptest::collection::vec(arb_camera(), 0..30).prop_map(Camword::from_cameras)
}

proptest! {
    #[test]
    fn camword_format_parse_round_trip(word in arb_camword()) {
        let encoded = word.to_string();
        let decoded: Camword = encoded.parse().unwrap();
        prop_assert_eq!(decoded, word);
    }

    #[test]
    fn camword_complement_is_involutive(word in arb_camword()) {
        prop_assert_eq!(word.complement().complement(), word.clone());
        prop_assert_eq!(word.union(&word.complement()), Camword::full());
    }

    #[test]
    fn camword_difference_then_union_restores(word in arb_camword(), removed in arb_camword()) {
        let pruned = word.difference(&removed);
        // adding back everything removed from the original restores it
        let restored = pruned.union(&word.difference(&pruned));
        prop_assert_eq!(restored, word);
    }

    #[test]
    fn per_camera_task_name_round_trip(
        night in 20190101i64..20301231,
        expid in 0i64..99_999_999,
        camera in arb_camera(),
    ) {
        let mut props = TaskProps::new();
        props.insert("night".to_string(), TaskValue::Int(night));
        props.insert("expid".to_string(), TaskValue::Int(expid));
        props.insert("camera".to_string(), TaskValue::Text(camera.to_string()));
        let name = ExtractTask.name_join(&props).unwrap();
        prop_assert_eq!(ExtractTask.name_split(&name).unwrap(), props);
    }

    #[test]
    fn nightly_task_name_round_trip(night in 20190101i64..20301231, camera in arb_camera()) {
        let mut props = TaskProps::new();
        props.insert("night".to_string(), TaskValue::Int(night));
        props.insert("camera".to_string(), TaskValue::Text(camera.to_string()));
        let name = PsfNightTask.name_join(&props).unwrap();
        prop_assert_eq!(PsfNightTask.name_split(&name).unwrap(), props);
    }

    #[test]
    fn spectrograph_task_name_round_trip(
        night in 20190101i64..20301231,
        expid in 0i64..99_999_999,
        spectrograph in 0i64..10,
    ) {
        let mut props = TaskProps::new();
        props.insert("night".to_string(), TaskValue::Int(night));
        props.insert("expid".to_string(), TaskValue::Int(expid));
        props.insert("spectrograph".to_string(), TaskValue::Int(spectrograph));
        let name = StarFitTask.name_join(&props).unwrap();
        prop_assert_eq!(StarFitTask.name_split(&name).unwrap(), props);
    }
}
