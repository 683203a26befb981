//! Rules for production code in the session core and client

use architectural_enforcement::{assert_clean, core_src, find_violations, workspace_root};

/// Blocking sleeps stall the reducer loop and every transport task
#[test]
fn no_thread_sleep() {
    let mut violations = find_violations(&core_src(), &["thread::sleep"], &[]);
    let client = workspace_root().join("session").join("client").join("src");
    violations.extend(find_violations(&client, &["thread::sleep"], &[]));
    assert_clean("std::thread::sleep in production code", &violations);
}

/// Timed waits belong to the transport's reconnect and heartbeat loops; the
/// controller only waits on the turn deadline
#[test]
fn async_sleep_only_in_transport() {
    let violations = find_violations(
        &core_src(),
        &["time::sleep("],
        &["transport/socket_io.rs"],
    );
    assert_clean("tokio::time::sleep outside the transport", &violations);
}

/// Filesystem access stays in configuration and storage, which run before or
/// outside async hot paths
#[test]
fn filesystem_only_in_config_and_storage() {
    let violations = find_violations(
        &core_src(),
        &["std::fs::", "File::open", "File::create"],
        &["config/", "storage.rs"],
    );
    assert_clean("filesystem access outside config/storage", &violations);
}

/// The state machine talks to the network through traits only
#[test]
fn network_crates_stay_behind_layers() {
    let violations = find_violations(
        &core_src(),
        &["reqwest", "tokio_tungstenite"],
        &["api/", "transport/", "config/", "lib.rs"],
    );
    assert_clean("network crate used outside api/transport", &violations);
}

#[test]
fn no_unwrap_in_library_code() {
    let violations = find_violations(&core_src(), &[".unwrap()", ".expect("], &[]);
    assert_clean("unwrap/expect in library code", &violations);
}
