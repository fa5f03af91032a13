// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use super::*;

fn full_config(cache: PathBuf) -> WsdConfig {
    WsdConfig {
        port: 0,
        cache,
        systemplate: Some(PathBuf::from("/opt/systemplate")),
        lotemplate: Some(PathBuf::from("/opt/lotemplate")),
        childroot: Some(PathBuf::from("/opt/jails")),
        losubpath: "lo".to_owned(),
        numprespawns: 10,
        test: false,
        admin_user: None,
        admin_password: None,
    }
}

#[test]
fn missing_required_options_exit_78() {
    let dir = tempfile::tempdir().unwrap();
    for field in ["systemplate", "lotemplate", "childroot"] {
        let mut config = full_config(dir.path().to_path_buf());
        match field {
            "systemplate" => config.systemplate = None,
            "lotemplate" => config.lotemplate = None,
            _ => config.childroot = None,
        }
        let err = config.validate().unwrap_err();
        assert_eq!(err.exit_code(), 78, "{field}");
    }
}

#[test]
fn unusable_cache_exits_69() {
    let mut config = full_config(PathBuf::from("/proc/docbay-cannot-write-here"));
    let err = config.validate().unwrap_err();
    assert_eq!(err.exit_code(), 69);
}

#[test]
fn valid_config_passes_and_test_mode_caps_prespawns() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = full_config(dir.path().join("cache"));
    config.test = true;
    config.validate().unwrap();
    assert_eq!(config.numprespawns, 1);
    assert!(dir.path().join("cache").is_dir());
}
