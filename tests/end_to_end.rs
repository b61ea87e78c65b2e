//! Client/server scenarios against an in-process simulated station.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use alfen_modbus::codec::Value;
use alfen_modbus::simulator::{
    default_server_context, spawn_mirror_loop, spawn_tcp_simulator, ServerContext, Simulator,
};
use alfen_modbus::{Hub, HubConfig};

struct SimHandle {
    addr: SocketAddr,
    context: Arc<ServerContext>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn start_simulator(socket_units: &[u8], mirror_period: Duration) -> SimHandle {
    let context = Arc::new(default_server_context(200, socket_units).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = spawn_tcp_simulator(listener, Simulator::new(Arc::clone(&context)));
    let mirror = spawn_mirror_loop(
        Arc::clone(&context),
        socket_units.to_vec(),
        mirror_period,
    );
    SimHandle {
        addr,
        context,
        tasks: vec![server, mirror],
    }
}

fn hub_config(addr: SocketAddr, read_socket_2: bool) -> HubConfig {
    HubConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        read_socket_2,
        scan_interval: 1,
        request_timeout_ms: 2_000,
        ..HubConfig::default()
    }
}

fn f32_value(snapshot: &alfen_modbus::Snapshot, key: &str) -> f64 {
    snapshot
        .get(key)
        .unwrap_or_else(|| panic!("missing key {key}"))
        .as_f64()
        .unwrap_or_else(|| panic!("key {key} is not numeric"))
}

#[tokio::test]
async fn poll_cycle_decodes_the_seeded_station() {
    let sim = start_simulator(&[1, 2], Duration::from_secs(1)).await;
    let hub = Hub::connect(hub_config(sim.addr, true)).await.unwrap();

    hub.poll_once().await.unwrap();
    let snapshot = hub.snapshot();

    assert_eq!(
        snapshot.get("name"),
        Some(&Value::Str("Alfen Eve Single Pro-line".to_owned()))
    );
    assert_eq!(
        snapshot.get("firmwareVersion"),
        Some(&Value::Str("5.16.0-4095".to_owned()))
    );
    assert_eq!(snapshot.get("actualMaxCurrent"), Some(&Value::F32(32.0)));
    assert_eq!(snapshot.get("socketCount"), Some(&Value::U16(2)));

    for socket in [1u8, 2] {
        assert_eq!(
            snapshot.get(&format!("socket_{socket}_voltageL1N")),
            Some(&Value::F32(232.5))
        );
        assert_eq!(
            snapshot.get(&format!("socket_{socket}_mode3State")),
            Some(&Value::Str("C2".to_owned()))
        );
        assert_eq!(
            snapshot.get(&format!("socket_{socket}_realEnergyDeliveredSum")),
            Some(&Value::F64(45745.98))
        );
        assert_eq!(
            snapshot.get(&format!("socket_{socket}_maxCurrentValidTime")),
            Some(&Value::U32(60))
        );
    }
}

#[tokio::test]
async fn commanded_current_is_mirrored_into_the_applied_register() {
    let sim = start_simulator(&[1], Duration::from_millis(50)).await;
    let hub = Hub::connect(hub_config(sim.addr, false)).await.unwrap();

    hub.poll_once().await.unwrap();
    let transmitted = hub.set_max_current(1, 14.5).await.unwrap();
    assert_eq!(transmitted, 14.5);

    // Give the mirror loop a few periods to acknowledge the setpoint.
    tokio::time::sleep(Duration::from_millis(250)).await;
    hub.poll_once().await.unwrap();

    let snapshot = hub.snapshot();
    assert_eq!(
        snapshot.get("socket_1_modbusSlaveMaxCurrent"),
        Some(&Value::F32(14.5))
    );
    let applied = f32_value(&snapshot, "socket_1_actualAppliedMaxCurrent");
    assert!((applied - 14.5).abs() < 0.1, "applied = {applied}");
}

#[tokio::test]
async fn requested_current_is_clamped_to_the_observed_limit() {
    let sim = start_simulator(&[1], Duration::from_millis(50)).await;
    let hub = Hub::connect(hub_config(sim.addr, false)).await.unwrap();

    // Observe the station's 32 A hard ceiling first.
    hub.poll_once().await.unwrap();
    let transmitted = hub.set_max_current(1, 40.0).await.unwrap();
    assert_eq!(transmitted, 32.0);

    hub.poll_once().await.unwrap();
    assert_eq!(
        hub.value("socket_1_modbusSlaveMaxCurrent"),
        Some(Value::F32(32.0))
    );
    assert_eq!(hub.value("no_such_field"), None);
}

#[tokio::test]
async fn failing_device_keeps_its_previous_fields() {
    let sim = start_simulator(&[1, 2], Duration::from_secs(1)).await;
    let hub = Hub::connect(hub_config(sim.addr, true)).await.unwrap();

    hub.poll_once().await.unwrap();
    assert_eq!(
        hub.snapshot().get("socket_2_voltageL1N"),
        Some(&Value::F32(232.5))
    );

    // Unit 2 disappears; unit 1 keeps measuring a new voltage.
    sim.context.remove(2);
    let new_voltage = alfen_modbus::codec::encode(
        alfen_modbus::codec::DataType::F32,
        &Value::F32(240.0),
    )
    .unwrap();
    sim.context.write(1, 306, &new_voltage).unwrap();

    hub.poll_once().await.unwrap();
    let snapshot = hub.snapshot();
    assert_eq!(
        snapshot.get("socket_1_voltageL1N"),
        Some(&Value::F32(240.0)),
        "healthy device must update"
    );
    assert_eq!(
        snapshot.get("socket_2_voltageL1N"),
        Some(&Value::F32(232.5)),
        "failed device must retain its previous fields"
    );
}

#[tokio::test]
async fn listeners_see_whole_cycles_and_unsubscribe_on_drop() {
    let sim = start_simulator(&[1], Duration::from_secs(1)).await;
    let hub = Hub::connect(hub_config(sim.addr, false)).await.unwrap();

    let cycles = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&cycles);
    let subscription = hub.subscribe(move |snapshot| {
        // Every notification carries a complete cycle: station and socket
        // fields together, never a partial merge.
        assert!(snapshot.contains_key("actualMaxCurrent"));
        assert!(snapshot.contains_key("socket_1_voltageL1N"));
        observed.fetch_add(1, Ordering::SeqCst);
    });

    hub.poll_once().await.unwrap();
    hub.poll_once().await.unwrap();
    assert_eq!(cycles.load(Ordering::SeqCst), 2);

    drop(subscription);
    hub.poll_once().await.unwrap();
    assert_eq!(cycles.load(Ordering::SeqCst), 2);

    drop(sim);
}

#[tokio::test]
async fn panicking_listener_does_not_break_the_cycle() {
    let sim = start_simulator(&[1], Duration::from_secs(1)).await;
    let hub = Hub::connect(hub_config(sim.addr, false)).await.unwrap();

    let _panicking = hub.subscribe(|_| panic!("listener bug"));
    let notified = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&notified);
    let _counting = hub.subscribe(move |_| {
        observed.fetch_add(1, Ordering::SeqCst);
    });

    hub.poll_once().await.unwrap();
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert!(!hub.snapshot().is_empty());
}

#[tokio::test]
async fn unreachable_station_fails_setup() {
    // Bind and immediately drop to get a port with no listener behind it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = Hub::connect(hub_config(addr, false)).await;
    assert!(result.is_err());
}
