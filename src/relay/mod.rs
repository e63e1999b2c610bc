//! Per-connection relay between the WebSocket and the target TCP socket
//!
//! Each connection is one task. Ingress bytes pass through the [`Decryptor`]
//! into an ordered payload queue; the first payload names the target, the
//! rest is tunneled. Return traffic is framed by the [`Encryptor`] and sent
//! back as binary WebSocket messages. Backpressure in both directions is the
//! await points themselves: the next WebSocket message is read only after the
//! queue drained into the target, and the next target read happens only after
//! the previous WebSocket send completed.

use crate::common::net::{configure_tcp_stream, Address};
use crate::framing::{Decryptor, Encryptor, MAX_PAYLOAD_SIZE};
use crate::{Error, Result, ServerContext};
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection lifecycle stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Awaiting the request header
    Closed,
    /// Target connect in flight
    Opening,
    /// Draining queued payloads into the target
    Writing,
    /// Steady-state relay
    Open,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Closed => "closed",
            Stage::Opening => "opening",
            Stage::Writing => "writing",
            Stage::Open => "open",
        };
        f.write_str(name)
    }
}

/// Per-connection relay state
struct Relay {
    decryptor: Decryptor,
    queue: VecDeque<Bytes>,
    stage: Stage,
    peer: SocketAddr,
    target: String,
}

/// Handle one upgraded WebSocket connection until it tears down.
pub async fn serve(socket: WebSocket, peer: SocketAddr, ctx: Arc<ServerContext>) {
    let mut relay = Relay::new(&ctx, peer);

    if let Err(e) = relay.run(socket, &ctx).await {
        match &e {
            Error::Crypto(_) | Error::Protocol(_) | Error::Address(_) => {
                warn!(
                    "relay {} -> {} [{}]: {}",
                    relay.peer, relay.target, relay.stage, e
                );
            }
            _ => {
                error!(
                    "relay {} -> {} [{}]: {}",
                    relay.peer, relay.target, relay.stage, e
                );
            }
        }
    }
}

impl Relay {
    fn new(ctx: &ServerContext, peer: SocketAddr) -> Self {
        Relay {
            decryptor: Decryptor::new(ctx.method, ctx.key.clone()),
            queue: VecDeque::new(),
            stage: Stage::Closed,
            peer,
            target: "-".to_string(),
        }
    }

    /// Decode a message's worth of ciphertext into the payload queue
    fn absorb(&mut self, data: &[u8]) -> Result<()> {
        for payload in self.decryptor.feed(data)? {
            self.queue.push_back(payload);
        }
        Ok(())
    }

    /// Pop the first payload and parse the target out of it. Bytes after the
    /// header are the head of the tunneled stream and go back in front of
    /// everything queued behind them.
    fn take_target(&mut self) -> Result<Option<(Address, u16)>> {
        let first = match self.queue.pop_front() {
            Some(first) => first,
            None => return Ok(None),
        };

        let (addr, port, consumed) = Address::parse_header(&first)?;
        if consumed < first.len() {
            self.queue.push_front(first.slice(consumed..));
        }
        Ok(Some((addr, port)))
    }

    async fn run(&mut self, mut ws: WebSocket, ctx: &ServerContext) -> Result<()> {
        // Wait for enough ciphertext to reveal the request header
        let (addr, port) = loop {
            let msg = match ws.recv().await {
                Some(msg) => msg.map_err(|e| Error::protocol(e.to_string()))?,
                // Peer went away before requesting anything
                None => return Ok(()),
            };

            match msg {
                Message::Binary(data) => {
                    self.absorb(&data)?;
                    if let Some(target) = self.take_target()? {
                        break target;
                    }
                }
                Message::Close(_) => return Ok(()),
                // Ping/pong are answered by the websocket layer; text frames
                // are not part of the ciphertext stream
                _ => {}
            }
        };

        self.target = addr.to_string_with_port(port);
        self.stage = Stage::Opening;
        debug!("relay {} -> {} connecting", self.peer, self.target);

        // Ingress stays paused while the connect is in flight; messages
        // already in flight are still decoded into the queue, and a client
        // close cancels the dial.
        let connect = connect_target(&addr, port);
        tokio::pin!(connect);
        let remote = loop {
            tokio::select! {
                res = &mut connect => break res?,
                msg = ws.recv() => match msg {
                    Some(Ok(Message::Binary(data))) => self.absorb(&data)?,
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("relay {} -> {} closed during connect", self.peer, self.target);
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(Error::protocol(e.to_string())),
                },
            }
        };

        // The server salt is the first egress bytes; the encrypt context
        // comes up together with it
        let mut encryptor = Encryptor::new(ctx.method, &ctx.key)?;
        if ws
            .send(Message::Binary(encryptor.wrap(&[])?.to_vec()))
            .await
            .is_err()
        {
            debug!("relay {} -> {} closed during connect", self.peer, self.target);
            return Ok(());
        }

        let (mut remote_rd, mut remote_wr) = remote.into_split();

        // Everything queued while the connect was in flight goes out first,
        // in arrival order
        self.stage = Stage::Writing;
        self.drain(&mut remote_wr).await?;
        self.stage = Stage::Open;
        debug!("relay {} -> {} established", self.peer, self.target);

        let mut buf = vec![0u8; MAX_PAYLOAD_SIZE];
        loop {
            tokio::select! {
                msg = ws.recv() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        self.stage = Stage::Writing;
                        self.absorb(&data)?;
                        self.drain(&mut remote_wr).await?;
                        self.stage = Stage::Open;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("relay {} -> {} closed by client", self.peer, self.target);
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(Error::protocol(e.to_string())),
                },
                read = remote_rd.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        // FIN from the target: echo it back. Everything read
                        // so far has already been sent, so the tunnel can
                        // close cleanly.
                        let _ = remote_wr.shutdown().await;
                        let _ = ws.send(Message::Close(None)).await;
                        debug!("relay {} -> {} target finished", self.peer, self.target);
                        return Ok(());
                    }
                    let frames = encryptor.wrap(&buf[..n])?;
                    if ws.send(Message::Binary(frames.to_vec())).await.is_err() {
                        // Client went away; dropping the target socket
                        // finishes the teardown
                        debug!("relay {} -> {} closed by client", self.peer, self.target);
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Write queued payloads to the target in order. Each write awaits the
    /// socket's drain, which is what holds further ingress back.
    async fn drain<W: AsyncWrite + Unpin>(&mut self, remote_wr: &mut W) -> Result<()> {
        while let Some(payload) = self.queue.pop_front() {
            remote_wr.write_all(&payload).await?;
        }
        Ok(())
    }
}

/// Resolve and connect to the requested target
async fn connect_target(addr: &Address, port: u16) -> Result<TcpStream> {
    let stream = match addr {
        Address::Ipv4(ip) => connect_ip(IpAddr::V4(*ip), port).await?,
        Address::Ipv6(ip) => connect_ip(IpAddr::V6(*ip), port).await?,
        Address::Domain(domain) => {
            let mut addrs = timeout(CONNECT_TIMEOUT, lookup_host((domain.as_str(), port)))
                .await?
                .map_err(|e| Error::connection(format!("resolve {}: {}", domain, e)))?;
            let first = addrs
                .next()
                .ok_or_else(|| Error::connection(format!("resolve {}: no addresses", domain)))?;
            timeout(CONNECT_TIMEOUT, TcpStream::connect(first))
                .await?
                .map_err(|e| Error::connection(format!("connect {}: {}", first, e)))?
        }
    };

    configure_tcp_stream(&stream);
    Ok(stream)
}

async fn connect_ip(ip: IpAddr, port: u16) -> Result<TcpStream> {
    timeout(CONNECT_TIMEOUT, TcpStream::connect((ip, port)))
        .await?
        .map_err(|e| Error::connection(format!("connect {}:{}: {}", ip, port, e)))
}
