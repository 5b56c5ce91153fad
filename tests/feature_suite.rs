//! End-to-end session scenarios against a scripted tunnel-server peer
//! running over an in-memory pipe.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::time::timeout;

use sdc::config::LocalConf;
use sdc::error::{AgentError, FramingError};
use sdc::messages::{
    decode_payload, decode_socket_data, encode_payload, encode_socket_data, AuthRequest,
    HealthCheckProbe, RegistrationRequest, RegistrationResponse, ServerSuppliedConf,
    CONTROL_CLOSE,
};
use sdc::session::Session;
use sdc::rules::parse_rules;

const RULES_XML: &[u8] = br#"
<resourceRules>
  <rule agentId="agent-1">
    <url>https://intranet.example:443/</url>
  </rule>
</resourceRules>
"#;

const FRAME_REGISTRATION: u32 = 2;
const FRAME_HEALTH_CHECK: u32 = 3;
const FRAME_SOCKET_DATA: u32 = 4;
const FRAME_CONNECTION_CONTROL: u32 = 5;

fn test_conf() -> Arc<LocalConf> {
    let conf: LocalConf = toml::from_str(
        r#"
            agent_id = "agent-1"
            user = "connector"
            domain = "corp.example"
            oauth_consumer_secret = "s3cr3t"
            tunnel_server = "tunnel.test:443"
            rules_file = "/nonexistent/rules.xml"
            socks_server_port = 0
            health_check_port = 1100
            health_check_gadget_users = "ops@corp.example"
        "#,
    )
    .unwrap();
    Arc::new(conf)
}

async fn read_line<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.unwrap();
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    String::from_utf8(line).unwrap()
}

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> (u32, Vec<u8>) {
    let length = stream.read_u32().await.unwrap();
    let frame_type = stream.read_u32().await.unwrap();
    let mut payload = vec![0u8; (length - 8) as usize];
    stream.read_exact(&mut payload).await.unwrap();
    (frame_type, payload)
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, frame_type: u32, payload: &[u8]) {
    stream.write_u32(payload.len() as u32 + 8).await.unwrap();
    stream.write_u32(frame_type).await.unwrap();
    stream.write_all(payload).await.unwrap();
}

/// Scripted server side of the pre-framing handshake; answers `OK`.
async fn accept_auth(server: &mut DuplexStream) -> AuthRequest {
    let greeting = read_line(server).await;
    assert_eq!(greeting, "connect v1.0");
    let auth_line = read_line(server).await;
    let request: AuthRequest = serde_json::from_str(&auth_line).unwrap();
    assert!(request.oauth_string.contains("oauth_signature="));
    server.write_all(b"{\"status\":\"OK\"}\n").await.unwrap();
    request
}

/// Scripted server side of the registration exchange; answers `OK` with the
/// given server-supplied configuration.
async fn accept_registration(
    server: &mut DuplexStream,
    conf: Option<ServerSuppliedConf>,
) -> RegistrationRequest {
    let (frame_type, payload) = read_frame(server).await;
    assert_eq!(frame_type, FRAME_REGISTRATION);
    let request: RegistrationRequest = decode_payload(&payload).unwrap();
    let response = RegistrationResponse {
        result: RegistrationResponse::RESULT_OK.into(),
        status_message: None,
        server_supplied_conf: conf,
    };
    write_frame(
        server,
        FRAME_REGISTRATION,
        &encode_payload(&response).unwrap(),
    )
    .await;
    request
}

async fn establish(server_conf: Option<ServerSuppliedConf>) -> (Session, DuplexStream) {
    let (client, mut server) = tokio::io::duplex(256 * 1024);
    let conf = test_conf();
    let rules = parse_rules(RULES_XML).unwrap();

    let server_task = tokio::spawn(async move {
        accept_auth(&mut server).await;
        accept_registration(&mut server, server_conf).await;
        server
    });

    let session = Session::establish(client, conf, &rules, RULES_XML)
        .await
        .unwrap();
    let server = server_task.await.unwrap();
    (session, server)
}

#[tokio::test]
async fn happy_path_auth_advances_to_registration() {
    let (session, _server) = establish(None).await;
    assert!(session.key_store().is_sealed());
    assert_eq!(session.key_store().len(), 2); // one rule + health check
    assert!(session.key_store().is_allowed("intranet.example", 443));
    assert!(session.key_store().is_allowed("localhost", 1100));
    assert!(!session.auth_context().oauth_string.is_empty());
}

#[tokio::test]
async fn registration_request_carries_the_capability_surface() {
    let (client, mut server) = tokio::io::duplex(256 * 1024);
    let conf = test_conf();
    let rules = parse_rules(RULES_XML).unwrap();

    let server_task = tokio::spawn(async move {
        accept_auth(&mut server).await;
        let request = accept_registration(&mut server, None).await;
        (request, server)
    });

    let session = Session::establish(client, conf, &rules, RULES_XML)
        .await
        .unwrap();
    let (request, _server) = server_task.await.unwrap();

    assert_eq!(request.agent_id, "agent-1");
    assert_eq!(request.health_check_port, 1100);
    assert_eq!(request.socks_server_port, session.socks_addr().port());
    assert_eq!(request.resource_rules, RULES_XML.to_vec());
    assert_eq!(request.resource_keys.len(), 2);
    assert_eq!(
        request.health_check_gadget_users,
        Some(vec!["ops@corp.example".to_string()])
    );
}

#[tokio::test]
async fn access_denied_fails_before_any_frame() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let conf = test_conf();

    let server_task = tokio::spawn(async move {
        read_line(&mut server).await;
        read_line(&mut server).await;
        server
            .write_all(b"{\"status\":\"ACCESS_DENIED\"}\n")
            .await
            .unwrap();
        // No registration frame may ever arrive: the client must drop the
        // connection without further bytes.
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        rest
    });

    let err = Session::establish(client, conf, &[], RULES_XML)
        .await
        .unwrap_err();
    match &err {
        AgentError::Authentication { email, status } => {
            assert_eq!(email, "connector@corp.example");
            assert!(status.contains("ACCESS_DENIED"));
        }
        other => panic!("expected Authentication, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 2);
    assert!(server_task.await.unwrap().is_empty());
}

#[tokio::test]
async fn mangled_auth_response_is_flagged() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let conf = test_conf();

    tokio::spawn(async move {
        read_line(&mut server).await;
        read_line(&mut server).await;
        server
            .write_all(b"SO NOT A REAL JSON STRING\n")
            .await
            .unwrap();
        server
    });

    let err = Session::establish(client, conf, &[], RULES_XML)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::MangledResponse(_)));
    assert!(err.to_string().starts_with("Mangled"));
    assert!(err.is_recoverable());
}

#[tokio::test]
async fn server_supplied_conf_retunes_health_cadence() {
    let (session, _server) = establish(Some(ServerSuppliedConf {
        heartbeat_seconds: Some(5),
        health_check_timeout_seconds: None,
    }))
    .await;
    assert_eq!(session.health().interval(), Duration::from_secs(5));
    assert_eq!(session.health().timeout(), Duration::from_secs(30));
    assert!(session.key_store().is_sealed());
    assert!(!session.key_store().is_empty());
}

#[tokio::test]
async fn registration_error_is_terminal_with_exit_code_3() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let conf = test_conf();
    let rules = parse_rules(RULES_XML).unwrap();

    tokio::spawn(async move {
        accept_auth(&mut server).await;
        let (frame_type, _) = read_frame(&mut server).await;
        assert_eq!(frame_type, FRAME_REGISTRATION);
        let response = RegistrationResponse {
            result: RegistrationResponse::RESULT_ERROR.into(),
            status_message: Some("quota exceeded".into()),
            server_supplied_conf: None,
        };
        write_frame(
            &mut server,
            FRAME_REGISTRATION,
            &encode_payload(&response).unwrap(),
        )
        .await;
        server
    });

    let err = Session::establish(client, conf, &rules, RULES_XML)
        .await
        .unwrap_err();
    match err.root() {
        AgentError::Registration { status_message } => {
            assert_eq!(status_message, "quota exceeded");
        }
        other => panic!("expected Registration, got {other:?}"),
    }
    assert!(!err.is_recoverable());
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn health_probes_are_echoed_with_matching_sequence() {
    let (_session, mut server) = establish(None).await;
    let probe = HealthCheckProbe {
        seq: 41,
        timestamp_ms: 1_700_000_000_000,
    };
    let payload = encode_payload(&probe).unwrap();
    write_frame(&mut server, FRAME_HEALTH_CHECK, &payload).await;

    let (frame_type, echoed) = read_frame(&mut server).await;
    assert_eq!(frame_type, FRAME_HEALTH_CHECK);
    let echoed: HealthCheckProbe = decode_payload(&echoed).unwrap();
    assert_eq!(echoed, probe);
}

#[tokio::test]
async fn silent_peer_trips_the_health_watchdog() {
    let (mut session, _server) = establish(Some(ServerSuppliedConf {
        heartbeat_seconds: Some(2),
        health_check_timeout_seconds: Some(1),
    }))
    .await;
    let err = timeout(Duration::from_secs(10), session.run_until_failure())
        .await
        .expect("watchdog should trip");
    assert!(matches!(err, AgentError::HealthTimeout { .. }));
    assert!(err.is_recoverable());
}

#[tokio::test]
async fn oversized_frame_closes_the_session() {
    let (mut session, mut server) = establish(None).await;
    server.write_u32(2 * 1024 * 1024).await.unwrap();
    server.write_u32(FRAME_HEALTH_CHECK).await.unwrap();
    let err = timeout(Duration::from_secs(5), session.run_until_failure())
        .await
        .unwrap();
    assert!(matches!(
        err,
        AgentError::Framing(FramingError::OversizedFrame { .. })
    ));
    assert_eq!(err.exit_code(), 4);
}

#[tokio::test]
async fn frame_for_unregistered_type_closes_the_session() {
    let (mut session, mut server) = establish(None).await;
    // AUTHORIZATION is only valid before framing; no handler is registered.
    write_frame(&mut server, 1, b"").await;
    let err = timeout(Duration::from_secs(5), session.run_until_failure())
        .await
        .unwrap();
    assert!(matches!(
        err,
        AgentError::Framing(FramingError::UnhandledFrameType(1))
    ));
}

async fn socks_connect(addr: std::net::SocketAddr, host: &str, port: u16) -> (TcpStream, u8) {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket.write_all(&[5, 1, 0]).await.unwrap();
    let mut choice = [0u8; 2];
    socket.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [5, 0]);

    let mut request = vec![5u8, 1, 0, 3, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    socket.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    socket.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 5);
    (socket, reply[1])
}

#[tokio::test]
async fn disallowed_socks_target_is_refused_without_frames() {
    let (session, mut server) = establish(None).await;
    let (_socket, reply) = socks_connect(session.socks_addr(), "other.example", 443).await;
    assert_eq!(reply, 0x02); // connection not allowed by ruleset

    // No SOCKET_DATA frame may cross the tunnel for a refused target.
    let quiet = timeout(Duration::from_millis(300), read_frame(&mut server)).await;
    assert!(quiet.is_err());
}

#[tokio::test]
async fn allowed_socks_target_is_bridged_with_half_close() {
    let (session, mut server) = establish(None).await;
    let (mut socket, reply) = socks_connect(session.socks_addr(), "intranet.example", 443).await;
    assert_eq!(reply, 0x00);

    // Local → tunnel.
    socket.write_all(b"ping").await.unwrap();
    let (frame_type, payload) = read_frame(&mut server).await;
    assert_eq!(frame_type, FRAME_SOCKET_DATA);
    let (stream_id, data) = decode_socket_data(&payload.into()).unwrap();
    assert_eq!(&data[..], b"ping");

    // Tunnel → local.
    write_frame(
        &mut server,
        FRAME_SOCKET_DATA,
        &encode_socket_data(stream_id, b"pong"),
    )
    .await;
    let mut answer = [0u8; 4];
    socket.read_exact(&mut answer).await.unwrap();
    assert_eq!(&answer, b"pong");

    // Peer half-close reaches the local socket as EOF.
    let mut close = Vec::new();
    close.extend_from_slice(&stream_id.to_be_bytes());
    close.push(CONTROL_CLOSE);
    write_frame(&mut server, FRAME_CONNECTION_CONTROL, &close).await;
    assert_eq!(socket.read(&mut [0u8; 16]).await.unwrap(), 0);

    // Local close becomes a half-close control frame on the tunnel.
    drop(socket);
    let (frame_type, payload) = read_frame(&mut server).await;
    assert_eq!(frame_type, FRAME_CONNECTION_CONTROL);
    assert_eq!(&payload[..4], &stream_id.to_be_bytes());
    assert_eq!(payload[4], CONTROL_CLOSE);
}

#[tokio::test]
async fn concurrent_senders_never_interleave_frame_bytes() {
    let (session, mut server) = establish(None).await;

    let mut tasks = Vec::new();
    for lane in 0u32..8 {
        let sender = session.sender().clone();
        tasks.push(tokio::spawn(async move {
            for n in 0u32..25 {
                let body = vec![lane as u8; 64 + n as usize];
                sender
                    .send(
                        sdc::messages::FrameType::SocketData,
                        encode_socket_data(lane, &body),
                    )
                    .await
                    .unwrap();
            }
        }));
    }

    // Every frame decodes cleanly and its payload is uniform, which a byte
    // interleaving of two frames would break.
    for _ in 0..(8 * 25) {
        let (frame_type, payload) = read_frame(&mut server).await;
        assert_eq!(frame_type, FRAME_SOCKET_DATA);
        let (lane, body) = decode_socket_data(&payload.into()).unwrap();
        assert!(body.iter().all(|b| *b == lane as u8));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn frame_before_registration_ack_closes_the_session() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let conf = test_conf();
    let rules = parse_rules(RULES_XML).unwrap();

    tokio::spawn(async move {
        accept_auth(&mut server).await;
        let (frame_type, _) = read_frame(&mut server).await;
        assert_eq!(frame_type, FRAME_REGISTRATION);
        // Probe instead of a registration response: a protocol violation.
        let probe = encode_payload(&HealthCheckProbe {
            seq: 1,
            timestamp_ms: 1,
        })
        .unwrap();
        write_frame(&mut server, FRAME_HEALTH_CHECK, &probe).await;
        server
    });

    let err = Session::establish(client, conf, &rules, RULES_XML)
        .await
        .unwrap_err();
    assert!(matches!(
        err.root(),
        AgentError::Framing(FramingError::UnhandledFrameType(3))
    ));
    assert!(err.is_recoverable());
}

#[tokio::test]
async fn session_shutdown_closes_live_socks_streams() {
    let (session, _server) = establish(None).await;
    let (mut socket, reply) = socks_connect(session.socks_addr(), "intranet.example", 443).await;
    assert_eq!(reply, 0x00);

    session.shutdown();

    // The per-connection pumps die with the session, so the local socket
    // observes close instead of hanging.
    let outcome = timeout(Duration::from_secs(5), socket.read(&mut [0u8; 16]))
        .await
        .expect("socket should observe session shutdown");
    assert!(matches!(outcome, Ok(0) | Err(_)));
}
