//! Relay sessions over real loopback sockets: Modbus/TCP answered by an
//! in-process engine, and the IEC 61850 association handshake.

use std::sync::Arc;
use std::time::Duration;

use gridsim::bridge::Bridge;
use gridsim::engine::{Engine, EngineSettings, SharedEngine};
use gridsim::relay::{RelaySettings, RelayState};
use gridsim::server::{ControlMessage, EndpointSpec, Protocol};
use gridsim_types::Value;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

fn engine() -> SharedEngine {
    let mut engine = Engine::with_system_clock(EngineSettings::default());
    let profile = engine.substation_mut().model_mut().profile_mut("default");
    profile.holding_registers.insert(0, 50);
    profile.holding_registers.insert(1, 1000);
    Arc::new(Mutex::new(engine))
}

fn local_port(relay: &RelayState, protocol: Protocol) -> u16 {
    relay
        .endpoint_statuses()
        .into_iter()
        .find(|status| status.protocol == protocol)
        .and_then(|status| status.local_port)
        .expect("listener bound")
}

async fn exchange(port: u16, request: &[u8], reply_len: usize) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut reply = vec![0u8; reply_len];
    timeout(IO_TIMEOUT, stream.read_exact(&mut reply))
        .await
        .expect("reply in time")
        .unwrap();
    reply
}

#[tokio::test]
async fn test_modbus_read_answered_by_engine() {
    let relay = RelayState::new(RelaySettings::default());
    let _bridge = Bridge::new(engine(), relay.clone(), None)
        .start(vec![(Protocol::Modbus, vec![EndpointSpec::new("127.0.0.1", 0)])])
        .await;
    let port = local_port(&relay, Protocol::Modbus);

    // Read two holding registers from address 0
    let reply = exchange(
        port,
        &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02],
        13,
    )
    .await;
    assert_eq!(
        reply,
        [0x00, 0x01, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x00, 0x32, 0x03, 0xE8]
    );
    assert_eq!(relay.pending_count(), 0);
}

#[tokio::test]
async fn test_modbus_missing_address_is_exception() {
    let relay = RelayState::new(RelaySettings::default());
    let _bridge = Bridge::new(engine(), relay.clone(), None)
        .start(vec![(Protocol::Modbus, vec![EndpointSpec::new("127.0.0.1", 0)])])
        .await;
    let port = local_port(&relay, Protocol::Modbus);

    let reply = exchange(
        port,
        &[0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x64, 0x00, 0x01],
        9,
    )
    .await;
    assert_eq!(reply, [0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02]);
}

#[tokio::test]
async fn test_modbus_without_control_peer_fails_fast() {
    let relay = RelayState::new(RelaySettings::default());
    relay
        .set_protocol_endpoints(Protocol::Modbus, vec![EndpointSpec::new("127.0.0.1", 0)])
        .await;
    let port = local_port(&relay, Protocol::Modbus);

    let reply = exchange(
        port,
        &[0x00, 0x03, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01],
        9,
    )
    .await;
    assert_eq!(reply, [0x00, 0x03, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x04]);
    assert_eq!(relay.pending_count(), 0);
}

#[tokio::test]
async fn test_modbus_unknown_function_answered_locally() {
    let relay = RelayState::new(RelaySettings::default());
    relay
        .set_protocol_endpoints(Protocol::Modbus, vec![EndpointSpec::new("127.0.0.1", 0)])
        .await;
    let port = local_port(&relay, Protocol::Modbus);

    let reply = exchange(port, &[0x00, 0x04, 0x00, 0x00, 0x00, 0x02, 0x07, 0x2B], 9).await;
    assert_eq!(reply, [0x00, 0x04, 0x00, 0x00, 0x00, 0x03, 0x07, 0xAB, 0x01]);
}

#[tokio::test]
async fn test_modbus_empty_pdu_is_illegal_function() {
    let relay = RelayState::new(RelaySettings::default());
    relay
        .set_protocol_endpoints(Protocol::Modbus, vec![EndpointSpec::new("127.0.0.1", 0)])
        .await;
    let port = local_port(&relay, Protocol::Modbus);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01])
        .await
        .unwrap();
    let mut reply = [0u8; 9];
    timeout(IO_TIMEOUT, stream.read_exact(&mut reply))
        .await
        .expect("reply in time")
        .unwrap();
    assert_eq!(reply, [0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x80, 0x01]);

    // The connection survives and keeps answering
    stream
        .write_all(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x02, 0x01, 0x2B])
        .await
        .unwrap();
    timeout(IO_TIMEOUT, stream.read_exact(&mut reply))
        .await
        .expect("reply in time")
        .unwrap();
    assert_eq!(reply, [0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0x01, 0xAB, 0x01]);
}

#[tokio::test]
async fn test_modbus_command_reaches_control_plane() {
    let relay = RelayState::new(RelaySettings::default());
    let mut control = relay.subscribe();
    relay
        .set_protocol_endpoints(
            Protocol::Modbus,
            vec![EndpointSpec {
                unit_id: Some(9),
                ..EndpointSpec::new("127.0.0.1", 0)
            }],
        )
        .await;
    let port = local_port(&relay, Protocol::Modbus);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(&[0x00, 0x05, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x07, 0x00, 0x2A])
        .await
        .unwrap();

    let (request_id, unit_id, address) = timeout(IO_TIMEOUT, async {
        loop {
            if let Ok(ControlMessage::ModbusCmd {
                request_id,
                unit_id,
                address,
                ..
            }) = control.recv().await
            {
                return (request_id, unit_id, address);
            }
        }
    })
    .await
    .expect("command published");
    assert_eq!(unit_id, 9);
    assert_eq!(address, 7);

    relay
        .complete_modbus(request_id, 6, Some(vec![Value::Int(42)]), None)
        .await;

    let mut reply = [0u8; 12];
    timeout(IO_TIMEOUT, stream.read_exact(&mut reply))
        .await
        .expect("reply in time")
        .unwrap();
    assert_eq!(
        reply,
        [0x00, 0x05, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x07, 0x00, 0x2A]
    );
}

#[tokio::test]
async fn test_iec_connection_request_confirmed() {
    let relay = RelayState::new(RelaySettings::default());
    relay
        .set_protocol_endpoints(Protocol::Iec61850, vec![EndpointSpec::new("127.0.0.1", 0)])
        .await;
    let port = local_port(&relay, Protocol::Iec61850);

    let cr = [
        0x03, 0x00, 0x00, 0x16, 0x11, 0xE0, 0x00, 0x00, 0x00, 0x07, 0x00, 0xC1, 0x02, 0x00, 0x01,
        0xC2, 0x02, 0x00, 0x01, 0xC0, 0x01, 0x0A,
    ];
    let reply = exchange(port, &cr, 14).await;
    assert_eq!(
        reply,
        [0x03, 0x00, 0x00, 0x0E, 0x09, 0xD0, 0x00, 0x07, 0x00, 0x01, 0x00, 0xC0, 0x01, 0x0A]
    );
}

#[tokio::test]
async fn test_closed_listener_frees_port() {
    let relay = RelayState::new(RelaySettings::default());
    relay
        .set_protocol_endpoints(Protocol::Modbus, vec![EndpointSpec::new("127.0.0.1", 0)])
        .await;
    let port = local_port(&relay, Protocol::Modbus);

    relay.reset_endpoints().await;
    assert!(relay.endpoint_statuses().is_empty());

    relay
        .set_protocol_endpoints(Protocol::Modbus, vec![EndpointSpec::new("127.0.0.1", port)])
        .await;
    assert_eq!(local_port(&relay, Protocol::Modbus), port);
}
