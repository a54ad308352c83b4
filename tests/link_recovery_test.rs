//! Connection-loss and resynchronization behavior.
//!
//! The wear counters are not idempotent, so a round trip that dies between
//! send and confirmation leaves the shadow behind the device. These tests
//! script exactly those faults and verify the proxy refuses to guess: no
//! optimistic counting, mutating operations blocked until a status read
//! restores the shadow from the device's authoritative counters.

use chamber_guard::link::mock::{LinkFault, MockDeviceLink, SimulatedChamber};
use chamber_guard::link::{DeviceLink, RetryPolicy, TcpDeviceLink};
use chamber_guard::proxy::{spawn_proxy, ProxyHandle};
use chamber_guard::wear::Thresholds;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

fn spawn_mock_proxy() -> (
    ProxyHandle,
    Arc<Mutex<SimulatedChamber>>,
    Arc<Mutex<VecDeque<LinkFault>>>,
) {
    let link = MockDeviceLink::new();
    let chamber = link.chamber();
    let faults = link.fault_queue();
    let (proxy, _task) = spawn_proxy(Box::new(link), Thresholds::default(), 32);
    (proxy, chamber, faults)
}

#[tokio::test]
async fn lost_confirmation_is_indeterminate_until_resynced() {
    let (proxy, chamber, faults) = spawn_mock_proxy();

    faults.lock().await.push_back(LinkFault::LoseResponse);

    // The setpoint change executes device-side but its confirmation is lost.
    let outcome = proxy.set_temperature(30.0).await.unwrap();
    assert!(!outcome.accepted);
    assert_eq!(outcome.error.as_ref().unwrap().code, "LinkTimeout");
    assert_eq!(
        outcome.state.temp_changes, 0,
        "an indeterminate outcome must not be counted optimistically"
    );
    assert_eq!(chamber.lock().await.temp_changes, 1, "the device did count");

    // Mutating operations are refused until the shadow is resynchronized.
    let outcome = proxy.open_door().await.unwrap();
    assert!(!outcome.accepted);
    assert_eq!(outcome.error.as_ref().unwrap().code, "LinkUnavailable");
    assert_eq!(chamber.lock().await.door_cycles, 0);

    // The status read adopts the device's counters wholesale.
    let status = proxy.status().await.unwrap();
    assert!(status.accepted);
    assert_eq!(status.state.temp_changes, 1);
    assert_eq!(status.state.current_temp, 30.0);

    // Normal service resumes.
    let outcome = proxy.open_door().await.unwrap();
    assert!(outcome.accepted);
}

#[tokio::test]
async fn drop_before_send_leaves_the_device_untouched() {
    let (proxy, chamber, faults) = spawn_mock_proxy();

    faults.lock().await.push_back(LinkFault::DropBeforeSend);

    let outcome = proxy.open_door().await.unwrap();
    assert!(!outcome.accepted);
    assert_eq!(outcome.error.as_ref().unwrap().code, "LinkUnavailable");
    assert_eq!(chamber.lock().await.door_cycles, 0);

    let status = proxy.status().await.unwrap();
    assert!(status.accepted);

    let outcome = proxy.open_door().await.unwrap();
    assert!(outcome.accepted);
    assert_eq!(chamber.lock().await.door_cycles, 1);
}

#[tokio::test]
async fn reset_stays_reachable_while_resync_is_pending() {
    let (proxy, _chamber, faults) = spawn_mock_proxy();

    faults.lock().await.push_back(LinkFault::LoseResponse);
    let _ = proxy.emergency_stop().await.unwrap();

    // Reset is exempt from the resync gate, like status.
    let outcome = proxy.reset().await.unwrap();
    assert!(outcome.accepted);
    assert!(!outcome.state.emergency_stopped);
}

#[tokio::test]
async fn status_adopts_out_of_band_wear() {
    let (proxy, chamber, _faults) = spawn_mock_proxy();

    // Someone else wore the door out while we were not looking.
    chamber.lock().await.door_cycles = 8;

    let status = proxy.status().await.unwrap();
    assert_eq!(status.state.door_cycles, 8);

    // Only one actuation remains under the margin.
    let first = proxy.open_door().await.unwrap();
    assert!(first.accepted);
    let second = proxy.open_door().await.unwrap();
    assert!(!second.accepted);
    assert_eq!(
        second.error.as_ref().unwrap().code,
        "DoorMechanismProtection"
    );
    assert_eq!(chamber.lock().await.door_cycles, 9);
}

#[tokio::test]
async fn link_health_tracks_fault_and_recovery() {
    let (proxy, _chamber, faults) = spawn_mock_proxy();

    proxy.status().await.unwrap();
    let health = proxy.link_health().await.unwrap();
    assert!(health.connected);
    assert!(!health.needs_resync);

    faults.lock().await.push_back(LinkFault::LoseResponse);
    let _ = proxy.open_door().await.unwrap();

    let health = proxy.link_health().await.unwrap();
    assert!(!health.connected);
    assert!(health.needs_resync);

    proxy.status().await.unwrap();
    let health = proxy.link_health().await.unwrap();
    assert!(health.connected);
    assert!(!health.needs_resync);
}

#[tokio::test]
async fn full_stack_over_tcp_against_the_simulated_chamber() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let chamber = Arc::new(Mutex::new(SimulatedChamber::new()));
    tokio::spawn(chamber_guard::link::mock::serve(listener, chamber.clone()));

    let link = TcpDeviceLink::new(
        addr.to_string(),
        Duration::from_secs(1),
        Duration::from_secs(1),
        RetryPolicy {
            max_attempts: 2,
            backoff_delay: Duration::from_millis(10),
        },
    );
    let (proxy, _task) = spawn_proxy(Box::new(link), Thresholds::default(), 32);

    let status = proxy.status().await.unwrap();
    assert!(status.accepted);
    assert!(!status.state.door_open);

    let outcome = proxy.open_door().await.unwrap();
    assert!(outcome.accepted);
    assert_eq!(outcome.state.door_cycles, 1);

    // Throttled setpoint over the real wire: 20 -> 60.
    let outcome = proxy.set_temperature(95.0).await.unwrap();
    assert!(outcome.accepted);
    assert_eq!(outcome.state.current_temp, 60.0);

    let device = chamber.lock().await;
    assert_eq!(device.door_cycles, 1);
    assert_eq!(device.current_temp, 60.0);
    assert!(!device.broken);
}

#[tokio::test]
async fn raw_link_survives_server_hangup_between_commands() {
    // One reply per connection, then the server hangs up.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let chamber = Arc::new(Mutex::new(SimulatedChamber::new()));
    let server_chamber = chamber.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            if let Ok(Some(line)) = lines.next_line().await {
                let reply = server_chamber.lock().await.handle_line(&line);
                let _ = write_half.write_all(format!("{}\n", reply).as_bytes()).await;
            }
        }
    });

    let mut link = TcpDeviceLink::new(
        addr.to_string(),
        Duration::from_secs(1),
        Duration::from_secs(1),
        RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        },
    );

    let reply = link.send_command("STATUS").await.unwrap();
    assert!(reply.contains("\"OK\""));

    // The command caught by the hangup fails and is not replayed; the
    // one after it rides the reconnected link.
    let mut failures = 0;
    for _ in 0..2 {
        match link.send_command("STATUS").await {
            Ok(reply) => {
                assert!(reply.contains("\"OK\""));
                break;
            }
            Err(_) => failures += 1,
        }
    }
    assert!(failures <= 1, "at most the interrupted command may fail");
}
