use super::helpers::{lan_gateway, seeded_allocator, CallLog, MockPmpClient, StaticInterfaces};
use crate::config::NatConfig;
use crate::handle::NatHandle;
use crate::natpmp::{MappingReply, NatPmpClient, NatPmpHandle, TokioNatPmpClient, NATPMP_TYPE};
use crate::types::{NatError, PortPair, Protocol};
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

const GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const EXTERNAL: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 10);

fn handle_with(log: CallLog) -> NatPmpHandle {
    NatPmpHandle::new(
        Box::new(MockPmpClient::new(Some(EXTERNAL), log)),
        GATEWAY,
        seeded_allocator(21),
        StaticInterfaces::single([10, 0, 0, 5], [255, 255, 255, 0]),
    )
}

#[tokio::test]
async fn test_validate_requires_external_address_reply() {
    let silent = NatPmpHandle::validate(
        Box::new(MockPmpClient::new(None, CallLog::default())),
        GATEWAY,
        seeded_allocator(1),
        StaticInterfaces::single([10, 0, 0, 5], [255, 255, 255, 0]),
    )
    .await;
    assert!(silent.is_none());

    let live = NatPmpHandle::validate(
        Box::new(MockPmpClient::new(Some(EXTERNAL), CallLog::default())),
        GATEWAY,
        seeded_allocator(1),
        StaticInterfaces::single([10, 0, 0, 5], [255, 255, 255, 0]),
    )
    .await;
    assert!(live.is_some());
}

#[tokio::test]
async fn test_handle_addresses() {
    let handle = handle_with(CallLog::default());

    assert_eq!(handle.backend_type(), NATPMP_TYPE);
    assert_eq!(handle.device_address().await.unwrap(), lan_gateway());
    assert_eq!(handle.external_address().await.unwrap(), IpAddr::V4(EXTERNAL));
    assert_eq!(
        handle.internal_address().await.unwrap(),
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))
    );
}

#[tokio::test]
async fn test_internal_address_outside_any_subnet() {
    let handle = NatPmpHandle::new(
        Box::new(MockPmpClient::new(Some(EXTERNAL), CallLog::default())),
        Ipv4Addr::new(192, 168, 1, 1),
        seeded_allocator(1),
        StaticInterfaces::single([10, 0, 0, 5], [255, 255, 255, 0]),
    );

    assert!(matches!(
        handle.internal_address().await,
        Err(NatError::NoInternalAddress(_))
    ));
}

#[tokio::test]
async fn test_add_mapping_sends_internal_then_external_port() {
    let log = CallLog::default();
    let handle = handle_with(log.clone());

    let pair = handle
        .add_port_mapping(Protocol::Udp, 40000, 8080, "ignored", Duration::from_secs(7200))
        .await
        .unwrap();

    assert_eq!(pair, PortPair::new(40000, 8080));
    let calls = log.binds();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].protocol, Protocol::Udp);
    assert_eq!(calls[0].internal, 8080);
    assert_eq!(calls[0].external, 40000);
    assert_eq!(calls[0].lease_secs, 7200);
}

#[tokio::test]
async fn test_automatic_mapping_then_delete_round_trip() {
    let log = CallLog::default();
    let handle = handle_with(log.clone());

    let pair = handle
        .add_port_mapping(Protocol::Tcp, 0, 8080, "svc", Duration::ZERO)
        .await
        .unwrap();
    assert!((10000..65535).contains(&pair.external));
    assert_eq!(pair.internal, 8080);
    assert_eq!(log.binds()[0].lease_secs, 0);

    handle
        .delete_port_mapping(Protocol::Tcp, pair.external)
        .await
        .unwrap();
    assert!(handle.mappings().await.is_empty());

    // Deletion is a zero-lifetime request for the cached internal port.
    let delete = &log.binds()[1];
    assert_eq!(delete.internal, 8080);
    assert_eq!(delete.external, 0);
    assert_eq!(delete.lease_secs, 0);
}

#[tokio::test]
async fn test_delete_unknown_port_is_silent() {
    let log = CallLog::default();
    let handle = handle_with(log.clone());

    handle
        .delete_port_mapping(Protocol::Tcp, 45678)
        .await
        .expect("unknown port must not fail");
    assert!(log.binds().is_empty());
}

#[tokio::test]
async fn test_conflict_keeps_original_mapping() {
    let handle = handle_with(CallLog::default());

    handle
        .add_port_mapping(Protocol::Tcp, 40000, 8080, "svc", Duration::from_secs(60))
        .await
        .unwrap();
    let result = handle
        .add_port_mapping(Protocol::Tcp, 40000, 9090, "svc", Duration::from_secs(60))
        .await;

    assert!(matches!(result, Err(NatError::ExternalPortInUse { .. })));
    assert_eq!(handle.mappings().await, vec![PortPair::new(40000, 8080)]);
}

fn mapping_reply(opcode: u8, private_port: u16, public_port: u16, lifetime: u32) -> Vec<u8> {
    let mut reply = vec![0, 128 + opcode, 0, 0, 0, 0, 0x0e, 0x10];
    reply.extend_from_slice(&private_port.to_be_bytes());
    reply.extend_from_slice(&public_port.to_be_bytes());
    reply.extend_from_slice(&lifetime.to_be_bytes());
    reply
}

fn drain(gateway: &UdpSocket) -> usize {
    let mut buf = [0u8; 64];
    let mut count = 0;
    while gateway.try_recv_from(&mut buf).is_ok() {
        count += 1;
    }
    count
}

// All wire cases share one test: the client always targets port 5351.
#[tokio::test]
async fn test_tokio_client_against_loopback_gateway() {
    let gateway = UdpSocket::bind((Ipv4Addr::LOCALHOST, 5351))
        .await
        .expect("NAT-PMP port free on loopback");

    // Silent gateway: every attempt is sent, then the client gives up.
    let impatient = NatConfig {
        natpmp_initial_timeout_ms: 20,
        natpmp_max_attempts: 3,
        ..NatConfig::default()
    };
    let client = TokioNatPmpClient::connect(Ipv4Addr::LOCALHOST, &impatient)
        .await
        .unwrap();
    let start = Instant::now();
    let result = client.external_address().await;
    assert!(matches!(result, Err(NatError::Timeout)), "{:?}", result);
    assert!(
        start.elapsed() >= Duration::from_millis(140),
        "20 + 40 + 80 ms schedule, took {:?}",
        start.elapsed()
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(drain(&gateway), 3);

    // A late reply for another private port is skipped; the matching one wins.
    let patient = NatConfig {
        natpmp_initial_timeout_ms: 2000,
        natpmp_max_attempts: 2,
        ..NatConfig::default()
    };
    let client = TokioNatPmpClient::connect(Ipv4Addr::LOCALHOST, &patient)
        .await
        .unwrap();

    let responder = tokio::spawn(async move {
        let mut buf = [0u8; 64];
        let (len, peer) = gateway.recv_from(&mut buf).await.unwrap();
        let request = buf[..len].to_vec();
        gateway
            .send_to(&mapping_reply(2, 9999, 41000, 60), peer)
            .await
            .unwrap();
        gateway
            .send_to(&mapping_reply(2, 8080, 40000, 3600), peer)
            .await
            .unwrap();

        let (_, peer) = gateway.recv_from(&mut buf).await.unwrap();
        let mut public = vec![0, 128, 0, 0, 0, 0, 0x0e, 0x10];
        public.extend_from_slice(&EXTERNAL.octets());
        gateway.send_to(&public, peer).await.unwrap();
        request
    });

    let reply = client
        .add_port_mapping(Protocol::Tcp, 8080, 40000, 3600)
        .await
        .unwrap();
    assert_eq!(
        reply,
        MappingReply {
            internal_port: 8080,
            external_port: 40000,
            lifetime_secs: 3600,
        }
    );
    assert_eq!(client.external_address().await.unwrap(), EXTERNAL);

    let request = responder.await.unwrap();
    assert_eq!(request.len(), 12);
    assert_eq!(request[1], 2, "TCP mapping opcode");
    assert_eq!(u16::from_be_bytes([request[4], request[5]]), 8080);
    assert_eq!(u16::from_be_bytes([request[6], request[7]]), 40000);
    assert_eq!(
        u32::from_be_bytes([request[8], request[9], request[10], request[11]]),
        3600
    );
}

#[tokio::test]
async fn test_gateway_assigned_port_is_not_reported() {
    let log = CallLog::default();
    let mut client = MockPmpClient::new(Some(EXTERNAL), log.clone());
    client.assigned_external = Some(50123);
    let handle = NatPmpHandle::new(
        Box::new(client),
        GATEWAY,
        seeded_allocator(4),
        StaticInterfaces::single([10, 0, 0, 5], [255, 255, 255, 0]),
    );

    let pair = handle
        .add_port_mapping(Protocol::Udp, 40000, 8080, "svc", Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(pair, PortPair::new(40000, 8080));
    assert_eq!(handle.mappings().await, vec![PortPair::new(40000, 8080)]);
}
