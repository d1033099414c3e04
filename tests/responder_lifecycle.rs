use mdns_host::{HostResponder, ResponderConfig, ResponderEvent, ResponderStatus};
use std::thread::sleep;
use std::time::Duration;
use test_log::test;

/// Builds a config bound to a private port so tests do not collide with a
/// system mDNS responder (or with each other).
fn test_config(port: u16, probe_wait_millis: u64) -> ResponderConfig {
    ResponderConfig {
        port,
        probe_wait_millis,
        ..ResponderConfig::default()
    }
}

/// Test that the responder claims a candidate hostname and confirms it
/// after an unchallenged probe window.
#[test]
fn test_hostname_claim_lifecycle() {
    let responder =
        HostResponder::with_config(test_config(55353, 300)).expect("Failed to create responder");

    let monitor = responder.monitor().unwrap();

    // The candidate is available immediately, before confirmation.
    let status = responder.hostname().unwrap().recv().unwrap();
    assert!(
        status.name.ends_with(".local."),
        "candidate {} should be dot-terminated under .local.",
        status.name
    );
    let candidate = status.name.clone();

    // Wait out the probe window; nobody on a private port challenges us.
    sleep(Duration::from_millis(800));

    let status = responder.hostname().unwrap().recv().unwrap();
    assert!(status.confirmed, "probe window should have elapsed");
    assert_eq!(status.name, candidate, "unchallenged candidate must not change");

    // The monitor saw the confirmation.
    let mut confirmed = false;
    let timer = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < timer {
        match monitor.recv_timeout(Duration::from_millis(100)) {
            Ok(ResponderEvent::HostnameConfirmed(name)) => {
                assert_eq!(name, candidate);
                confirmed = true;
                break;
            }
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    assert!(confirmed, "monitor should receive HostnameConfirmed");

    responder.shutdown().unwrap();
}

/// Test that the daemon reports Running, then Shutdown, and that a cloned
/// handle observes the same daemon.
#[test]
fn test_status_and_shutdown() {
    let responder =
        HostResponder::with_config(test_config(55354, 2000)).expect("Failed to create responder");
    let clone = responder.clone();

    let status = responder.status().unwrap().recv().unwrap();
    assert!(matches!(status, ResponderStatus::Running));

    let status = clone.status().unwrap().recv().unwrap();
    assert!(matches!(status, ResponderStatus::Running));

    // Shutdown via the original handle.
    let shutdown_receiver = responder.shutdown().unwrap();
    let status = shutdown_receiver.recv().unwrap();
    assert!(matches!(status, ResponderStatus::Shutdown));

    // Give the daemon thread time to exit and drop its receiver.
    sleep(Duration::from_millis(300));

    // Both handles now report Shutdown.
    let status = clone.status().unwrap().recv().unwrap();
    assert!(matches!(status, ResponderStatus::Shutdown));
}

/// Test that commands fail gracefully after shutdown.
#[test]
fn test_commands_after_shutdown() {
    let responder =
        HostResponder::with_config(test_config(55355, 2000)).expect("Failed to create responder");

    let shutdown_receiver = responder.shutdown().unwrap();
    let status = shutdown_receiver.recv().unwrap();
    assert!(matches!(status, ResponderStatus::Shutdown));

    sleep(Duration::from_millis(300));

    // hostname and monitor go through the command channel, which is now
    // disconnected.
    assert!(responder.hostname().is_err());
    assert!(responder.monitor().is_err());

    // A second shutdown either errors out or reports Shutdown again.
    if let Ok(receiver) = responder.shutdown() {
        if let Ok(status) = receiver.recv() {
            assert!(matches!(status, ResponderStatus::Shutdown));
        }
    }
}
