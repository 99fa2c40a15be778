//! Ecosystem model loading, lint and canonical hashing

use proptest::prelude::*;
use std::path::PathBuf;

use ydp_common::hash::hash_parts;
use ydp_common::model::Ecosystem;
use ydp_common::YdpError;

fn starter() -> Ecosystem {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../demos/yellow_starter.yaml");
    Ecosystem::from_yaml_file(path).unwrap()
}

#[test]
fn test_starter_round_trips_through_file() {
    let eco = starter();
    eco.lint().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("eco.yaml");
    std::fs::write(&path, serde_yaml::to_string(&eco).unwrap()).unwrap();

    let reloaded = Ecosystem::from_yaml_file(&path).unwrap();
    assert_eq!(reloaded, eco);
    assert_eq!(reloaded.producer_of("MaskedCustomers").map(|w| w.name.as_str()), Some("MaskedStoreGenerator"));
}

#[test]
fn test_lint_reports_every_issue() {
    let mut eco = starter();
    eco.teams[0].workspaces[0].dataset_groups[0].sinks[0].datastore = "Nowhere".to_string();
    eco.teams[0].datastores[0].capture.as_mut().unwrap().trigger.expression = "every tuesday".to_string();

    match eco.lint() {
        Err(YdpError::Validation(issues)) => {
            assert_eq!(issues.len(), 2, "{:?}", issues);
            assert!(issues.iter().any(|i| i.contains("Nowhere")));
            assert!(issues.iter().any(|i| i.contains("Store1")));
        },
        other => panic!("expected validation failure, got {:?}", other),
    }
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Ecosystem::from_yaml_file(dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, YdpError::Io(_)));
}

proptest! {
    /// Moving a part boundary always changes the hash
    #[test]
    fn hash_boundaries_are_significant(s in "[a-z]{2,16}", i in 0usize..16, j in 0usize..16) {
        let (i, j) = (i % (s.len() + 1), j % (s.len() + 1));
        prop_assume!(i != j);
        prop_assert_ne!(
            hash_parts([&s[..i], &s[i..]]),
            hash_parts([&s[..j], &s[j..]])
        );
    }
}
