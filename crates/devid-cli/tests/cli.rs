//! End-to-end tests of the `devid` binary: output and exit status.

#![allow(clippy::unwrap_used)]

use std::io::Write;
use std::process::{Command, Output};

use tempfile::NamedTempFile;

const ENV_VARS: &[&str] = &[
    "SMSDK_USER_AGENT",
    "SMSDK_ACCEPT_LANGUAGE",
    "SMSDK_REFERER",
    "SMSDK_PLATFORM",
    "SMSDK_TIMEOUT_MS",
    "SMSDK_POLL_INTERVAL_MS",
    "SMSDK_ACCESSOR",
    "SMSDK_SERVICE_CONFIG",
    "SMSDK_ALLOWED_HOSTS",
    "SMSDK_REQUEST_TIMEOUT_MS",
    "RUST_LOG",
];

fn script(source: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(source.as_bytes()).unwrap();
    file
}

fn devid(args: &[&str], env: &[(&str, &str)]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_devid"));
    for name in ENV_VARS {
        command.env_remove(name);
    }
    command
        .args(args)
        .envs(env.iter().copied())
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_prints_device_id() {
    let file = script("var SMSdk = { getDeviceId: function () { return 'BdevTest01'; } };");
    let output = devid(
        &[file.path().to_str().unwrap(), "--poll-interval-ms", "10"],
        &[],
    );

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "BdevTest01\n");
}

#[test]
fn test_profile_from_environment() {
    let file = script(
        "var SMSdk = { getDeviceId: function () { return navigator.platform + '|' + screen.width; } };",
    );
    let output = devid(
        &[file.path().to_str().unwrap(), "--poll-interval-ms", "10"],
        &[(
            "SMSDK_USER_AGENT",
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15",
        )],
    );

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "iPhone|390\n");
}

#[test]
fn test_missing_script_exits_1() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.js");
    let output = devid(&[missing.to_str().unwrap()], &[]);

    assert_eq!(output.status.code(), Some(1));
    assert!(stdout(&output).is_empty());
    assert!(stderr(&output).contains("script not found"), "{}", stderr(&output));
}

#[test]
fn test_no_arguments_exits_1() {
    let output = devid(&[], &[]);

    assert_eq!(output.status.code(), Some(1));
    assert!(stdout(&output).is_empty());
    assert!(stderr(&output).contains("required"), "stderr: {}", stderr(&output));
}

#[test]
fn test_unknown_flag_exits_1() {
    let file = script("var SMSdk = { getDeviceId: function () { return 'x'; } };");
    let output = devid(&[file.path().to_str().unwrap(), "--no-such-flag"], &[]);

    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_help_exits_0() {
    let output = devid(&["--help"], &[]);

    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("SCRIPT"));
}

#[test]
fn test_injection_failure_exits_1() {
    let file = script("throw new Error('boom at load');");
    let output = devid(&[file.path().to_str().unwrap()], &[]);

    assert_eq!(output.status.code(), Some(1));
    assert!(stdout(&output).is_empty());
    assert!(stderr(&output).contains("boom at load"), "{}", stderr(&output));
}

#[test]
fn test_timeout_exits_2() {
    let file = script("var SMSdk = { getDeviceId: function () { return ''; } };");
    let output = devid(
        &[
            file.path().to_str().unwrap(),
            "--timeout-ms",
            "300",
            "--poll-interval-ms",
            "20",
        ],
        &[],
    );

    assert_eq!(output.status.code(), Some(2));
    assert!(stdout(&output).is_empty());
    assert!(stderr(&output).contains("no device id after 300ms"), "{}", stderr(&output));
}

#[test]
fn test_service_config_file() {
    let mut config = NamedTempFile::new().unwrap();
    config
        .write_all(br#"{"organization": "org-from-file", "appId": "web"}"#)
        .unwrap();
    let file = script(
        "var SMSdk = { getDeviceId: function () { return _smConf.organization + '/' + _smConf.appId + '/' + _smConf.apiHost; } };",
    );
    let output = devid(
        &[
            file.path().to_str().unwrap(),
            "--service-config",
            config.path().to_str().unwrap(),
            "--poll-interval-ms",
            "10",
        ],
        &[],
    );

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "org-from-file/web/fp-it.portal101.cn\n");
}
