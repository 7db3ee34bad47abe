//! Settings persistence.

use rtcore::settings::MAX_FRAMES_IN_FLIGHT;
use rtcore::{Error, Settings};

#[test]
fn test_save_load_roundtrip() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("rtcore.json");

    let settings = Settings {
        frames_in_flight: 3,
        full_rebuild_interval: Some(8),
        prefer_fast_trace: false,
        allow_blas_update: true,
        max_ray_recursion_depth: 4,
        sbt_entry_data_size: 32,
        memory_budget: Some(1 << 20),
    };
    settings.save(&path).expect("Failed to save settings");

    let loaded = Settings::load(&path).expect("Failed to load settings");
    assert_eq!(loaded, settings);
}

#[test]
fn test_load_clamps_hand_edited_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("edited.json");
    std::fs::write(&path, r#"{ "frames_in_flight": 0, "sbt_entry_data_size": 8 }"#).unwrap();

    let loaded = Settings::load(&path).unwrap();
    assert_eq!(loaded.frames_in_flight, 1);
    assert_eq!(loaded.sbt_entry_data_size, 8);
    assert!(loaded.prefer_fast_trace);
    assert!(loaded.frames_in_flight <= MAX_FRAMES_IN_FLIGHT);
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Settings::load(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}
