//! End-to-end protocol tests
//!
//! Each test drives a live server instance through a minimal WebSocket
//! client speaking the AEAD tunnel protocol, with a local TCP echo service
//! standing in for the target.

use shadowsocks_ws_rust::crypto::{derive_key, derive_subkey, CipherKind, SessionCipher};
use shadowsocks_ws_rust::framing::{Decryptor, MAX_PAYLOAD_SIZE};
use shadowsocks_ws_rust::{inbound, ServerContext};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const METHOD: CipherKind = CipherKind::ChaCha20Poly1305;
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn master_key() -> Vec<u8> {
    derive_key("secret", 32)
}

/// Client-side sealer: salt followed by length/payload frame pairs
struct Sealer {
    cipher: SessionCipher,
    salt: Option<Vec<u8>>,
}

impl Sealer {
    fn new() -> Self {
        let salt: Vec<u8> = (0u8..32).collect();
        let subkey = derive_subkey(&master_key(), &salt);
        Sealer {
            cipher: SessionCipher::new(METHOD, &subkey).unwrap(),
            salt: Some(salt),
        }
    }

    fn seal(&mut self, payload: &[u8]) -> Vec<u8> {
        let mut out = self.salt.take().unwrap_or_default();
        let len = (payload.len() as u16).to_be_bytes();
        out.extend(self.cipher.encrypt(&len).unwrap());
        out.extend(self.cipher.encrypt(payload).unwrap());
        out
    }
}

/// Start the tunnel server on an ephemeral port
async fn spawn_server() -> SocketAddr {
    let ctx = Arc::new(ServerContext {
        method: METHOD,
        key: master_key(),
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = inbound::router(ctx);
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

/// Start a TCP echo service on an ephemeral port
async fn spawn_echo(bind: &str) -> SocketAddr {
    let listener = TcpListener::bind(bind).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Open a WebSocket to the server with a plain HTTP/1.1 upgrade handshake
async fn ws_connect(addr: SocketAddr, path: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        path, addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.unwrap();
        response.push(byte[0]);
        if response.ends_with(b"\r\n\r\n") {
            break;
        }
        assert!(response.len() < 4096, "oversized handshake response");
    }
    let head = String::from_utf8_lossy(&response);
    assert!(head.starts_with("HTTP/1.1 101"), "handshake failed: {}", head);
    stream
}

/// Send one masked binary frame
async fn ws_send_binary(stream: &mut TcpStream, payload: &[u8]) {
    let mask_key = [0x12u8, 0x34, 0x56, 0x78];
    let mut frame = Vec::with_capacity(payload.len() + 14);
    frame.push(0x82); // FIN + binary
    if payload.len() < 126 {
        frame.push(0x80 | payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        frame.push(0x80 | 127);
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }
    frame.extend_from_slice(&mask_key);
    frame.extend(
        payload
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ mask_key[i % 4]),
    );
    stream.write_all(&frame).await.unwrap();
}

/// Read one unmasked frame from the server; None once the connection closed
async fn ws_recv_frame(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.ok()?;

    let opcode = header[0] & 0x0F;
    assert_eq!(header[1] & 0x80, 0, "server frames must not be masked");

    let mut len = (header[1] & 0x7F) as u64;
    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext).await.ok()?;
        len = u16::from_be_bytes(ext) as u64;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext).await.ok()?;
        len = u64::from_be_bytes(ext);
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await.ok()?;
    Some((opcode, payload))
}

/// Collect tunneled bytes from the server until `want` bytes arrived
async fn recv_tunneled(stream: &mut TcpStream, want: usize) -> Vec<u8> {
    let mut dec = Decryptor::new(METHOD, master_key());
    let mut received = Vec::new();
    while received.len() < want {
        let (opcode, payload) = timeout(RECV_TIMEOUT, ws_recv_frame(stream))
            .await
            .expect("timed out waiting for tunneled data")
            .expect("connection closed early");
        if opcode != 0x2 {
            continue;
        }
        for p in dec.feed(&payload).unwrap() {
            received.extend_from_slice(&p);
        }
    }
    received
}

#[tokio::test]
async fn test_ipv4_target_roundtrip() {
    let echo = spawn_echo("127.0.0.1:0").await;
    let server = spawn_server().await;

    let mut ws = ws_connect(server, "/").await;
    let mut sealer = Sealer::new();

    let mut header = vec![0x01, 127, 0, 0, 1];
    header.extend_from_slice(&echo.port().to_be_bytes());
    ws_send_binary(&mut ws, &sealer.seal(&header)).await;
    ws_send_binary(&mut ws, &sealer.seal(b"hello")).await;

    assert_eq!(recv_tunneled(&mut ws, 5).await, b"hello");
}

#[tokio::test]
async fn test_ipv6_target_roundtrip() {
    let echo = spawn_echo("[::1]:0").await;
    let server = spawn_server().await;

    let mut ws = ws_connect(server, "/").await;
    let mut sealer = Sealer::new();

    let mut header = vec![0x04];
    header.extend_from_slice(&std::net::Ipv6Addr::LOCALHOST.octets());
    header.extend_from_slice(&echo.port().to_be_bytes());
    ws_send_binary(&mut ws, &sealer.seal(&header)).await;
    ws_send_binary(&mut ws, &sealer.seal(b"hello")).await;

    assert_eq!(recv_tunneled(&mut ws, 5).await, b"hello");
}

#[tokio::test]
async fn test_domain_target_with_inlined_data() {
    let echo = spawn_echo("127.0.0.1:0").await;
    let server = spawn_server().await;

    // Any upgrade path works
    let mut ws = ws_connect(server, "/tunnel/v1").await;
    let mut sealer = Sealer::new();

    // First payload: domain header with the opening bytes of the stream
    // inlined behind it; a second payload rides in the same message
    let name = echo.ip().to_string();
    let mut first = vec![0x03, name.len() as u8];
    first.extend_from_slice(name.as_bytes());
    first.extend_from_slice(&echo.port().to_be_bytes());
    first.extend_from_slice(b"ping");

    let mut message = sealer.seal(&first);
    message.extend(sealer.seal(b"pong"));
    ws_send_binary(&mut ws, &message).await;

    // The inlined bytes reach the target before the queued payload
    assert_eq!(recv_tunneled(&mut ws, 8).await, b"pingpong");
}

#[tokio::test]
async fn test_server_salt_leads_egress() {
    let echo = spawn_echo("127.0.0.1:0").await;
    let server = spawn_server().await;

    let mut ws = ws_connect(server, "/").await;
    let mut sealer = Sealer::new();

    let mut header = vec![0x01, 127, 0, 0, 1];
    header.extend_from_slice(&echo.port().to_be_bytes());
    ws_send_binary(&mut ws, &sealer.seal(&header)).await;

    // The very first egress bytes are the salt, sent before any target data
    let (opcode, payload) = timeout(RECV_TIMEOUT, ws_recv_frame(&mut ws))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(opcode, 0x2);
    assert_eq!(payload.len(), METHOD.salt_size());
}

#[tokio::test]
async fn test_tampered_frame_terminates_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();

    // Record everything the target ever receives
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match sock.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => data.extend_from_slice(&buf[..n]),
            }
        }
        let _ = tx.send(data);
    });

    let server = spawn_server().await;
    let mut ws = ws_connect(server, "/").await;
    let mut sealer = Sealer::new();

    let mut header = vec![0x01, 127, 0, 0, 1];
    header.extend_from_slice(&target.port().to_be_bytes());
    ws_send_binary(&mut ws, &sealer.seal(&header)).await;

    // Flip one bit in the payload frame's tag
    let mut frame = sealer.seal(b"hello");
    let last = frame.len() - 1;
    frame[last] ^= 0x01;
    ws_send_binary(&mut ws, &frame).await;

    // The target socket is destroyed without a single tunneled byte
    let data = timeout(RECV_TIMEOUT, rx).await.unwrap().unwrap();
    assert!(data.is_empty());

    // And the websocket is torn down on us
    loop {
        match timeout(RECV_TIMEOUT, ws_recv_frame(&mut ws)).await.unwrap() {
            None => break,
            Some((opcode, _)) => assert!(opcode == 0x2 || opcode == 0x8),
        }
    }
}

#[tokio::test]
async fn test_oversize_length_frame_terminates_connection() {
    let echo = spawn_echo("127.0.0.1:0").await;
    let server = spawn_server().await;

    let mut ws = ws_connect(server, "/").await;
    let mut sealer = Sealer::new();

    let mut header = vec![0x01, 127, 0, 0, 1];
    header.extend_from_slice(&echo.port().to_be_bytes());
    ws_send_binary(&mut ws, &sealer.seal(&header)).await;

    // A bare length frame claiming 0xFFFF bytes
    let bogus = sealer.cipher.encrypt(&[0xFF, 0xFF]).unwrap();
    ws_send_binary(&mut ws, &bogus).await;

    loop {
        match timeout(RECV_TIMEOUT, ws_recv_frame(&mut ws)).await.unwrap() {
            None => break,
            Some((opcode, _)) => assert!(opcode == 0x2 || opcode == 0x8),
        }
    }
}

#[tokio::test]
async fn test_target_eof_closes_tunnel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();

    // Target replies once, then closes its end
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let n = sock.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        sock.write_all(b"world\n").await.unwrap();
        sock.shutdown().await.unwrap();
    });

    let server = spawn_server().await;
    let mut ws = ws_connect(server, "/").await;
    let mut sealer = Sealer::new();

    let mut header = vec![0x01, 127, 0, 0, 1];
    header.extend_from_slice(&target.port().to_be_bytes());
    ws_send_binary(&mut ws, &sealer.seal(&header)).await;
    ws_send_binary(&mut ws, &sealer.seal(b"hello")).await;

    let mut dec = Decryptor::new(METHOD, master_key());
    let mut received = Vec::new();
    let mut closed = false;
    while !closed {
        match timeout(RECV_TIMEOUT, ws_recv_frame(&mut ws)).await.unwrap() {
            None => closed = true,
            Some((0x8, _)) => closed = true,
            Some((0x2, payload)) => {
                for p in dec.feed(&payload).unwrap() {
                    received.extend_from_slice(&p);
                }
            }
            Some(_) => {}
        }
    }
    assert_eq!(received, b"world\n");
}

#[tokio::test]
async fn test_large_payload_backpressure() {
    const TOTAL: usize = 2 * 1024 * 1024;
    const FILL: u8 = 0x42;

    // Slow-draining sink: reads in small chunks with a pause between them so
    // the relay's writes have to wait, then reports how many correct bytes
    // made it through
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 8192];
        let mut count = 0u64;
        while count < TOTAL as u64 {
            match sock.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    count += buf[..n].iter().filter(|&&b| b == FILL).count() as u64;
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        }
        let _ = sock.write_all(&count.to_be_bytes()).await;
    });

    let server = spawn_server().await;
    let mut ws = ws_connect(server, "/").await;
    let mut sealer = Sealer::new();

    let mut header = vec![0x01, 127, 0, 0, 1];
    header.extend_from_slice(&target.port().to_be_bytes());
    ws_send_binary(&mut ws, &sealer.seal(&header)).await;

    let data = vec![FILL; TOTAL];
    let mut message = Vec::with_capacity(TOTAL + TOTAL / MAX_PAYLOAD_SIZE * 64);
    for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
        message.extend(sealer.seal(chunk));
    }
    ws_send_binary(&mut ws, &message).await;

    // Every byte reaches the target despite the slow drain
    let reply = recv_tunneled(&mut ws, 8).await;
    assert_eq!(
        u64::from_be_bytes(reply[..8].try_into().unwrap()),
        TOTAL as u64
    );
}
