//! # Link Task
//!
//! One cooperatively scheduled task per link drives the engine: a periodic
//! tick fires LOAD / LOAD-REQUEST / STORE, and transport readability wakes
//! the same task to parse and dispatch at most one message before
//! yielding. All key-database mutation happens inside this task; outside
//! observers go through the engine mutex for single queries only.
//!
//! Frames are self-delimiting through the 32-bit length prefix at the
//! start of the Q3P header. Peer URIs read `tcp://host:port`; the
//! asterisk host picks a default-gateway local IPv4.

use crate::domain::errors::ProtocolError;
use crate::domain::message::{HEADER_SIZE, PACKET_MAX_SIZE};
use crate::engine::Engine;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Why a drive loop ended.
enum LinkEnd {
    /// Transport failed or closed; reconnect may apply.
    Lost,
    /// Authentication failure; never reconnect on our own.
    Poisoned,
    /// Operator asked us to stop.
    Shutdown,
}

/// Handle on a running link task.
pub struct Link {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Link {
    /// Dial a peer key store and keep the link alive.
    ///
    /// Reconnects with the same address after transport loss when the
    /// engine is configured for it, but never after an authentication
    /// failure.
    pub async fn connect(
        engine: Arc<Mutex<Engine>>,
        uri: &str,
        secret: Vec<u8>,
    ) -> Result<Link, ProtocolError> {
        let (host, port) = parse_peer_uri(uri)?;
        {
            let mut engine = engine.lock();
            engine.set_initial_secret(secret)?;
            engine.set_url_peer(uri);
        }

        let shutdown = Arc::new(Notify::new());
        let shutdown_task = shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                let reconnect = {
                    let mut locked = engine.lock();
                    locked.set_connecting();
                    locked.config.reconnect
                };
                info!(%host, port, "dialing peer key store");
                let stream = tokio::select! {
                    result = TcpStream::connect((host.clone(), port)) => result,
                    _ = shutdown_task.notified() => return,
                };
                match stream {
                    Ok(stream) => match drive(&engine, stream, &shutdown_task).await {
                        LinkEnd::Shutdown | LinkEnd::Poisoned => return,
                        LinkEnd::Lost if !reconnect => return,
                        LinkEnd::Lost => {}
                    },
                    Err(e) => {
                        warn!(error = %e, "connect failed");
                        if !reconnect {
                            return;
                        }
                    }
                }
                let pause = engine.lock().config.tick_interval;
                tokio::select! {
                    _ = tokio::time::sleep(pause * 4) => {}
                    _ = shutdown_task.notified() => return,
                }
            }
        });

        Ok(Link { shutdown, handle })
    }

    /// Listen for one peer at a time.
    ///
    /// Returns the bound address alongside the handle; port 0 in the URI
    /// asks the system for an ephemeral port.
    pub async fn listen(
        engine: Arc<Mutex<Engine>>,
        uri: &str,
        secret: Vec<u8>,
    ) -> Result<(Link, std::net::SocketAddr), ProtocolError> {
        let (host, port) = parse_peer_uri(uri)?;
        let bind_host = if host == "*" { "0.0.0.0".to_string() } else { host };
        let listener = TcpListener::bind((bind_host, port))
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        let local = listener
            .local_addr()
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        {
            let mut engine = engine.lock();
            engine.set_initial_secret(secret)?;
            engine.set_url_listen(uri);
        }

        let shutdown = Arc::new(Notify::new());
        let shutdown_task = shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                engine.lock().set_connecting();
                let accepted = tokio::select! {
                    result = listener.accept() => result,
                    _ = shutdown_task.notified() => return,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "peer key store connected");
                        match drive(&engine, stream, &shutdown_task).await {
                            LinkEnd::Shutdown | LinkEnd::Poisoned => return,
                            LinkEnd::Lost => {}
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });

        Ok((Link { shutdown, handle }, local))
    }

    /// Stop the link task and wait for it.
    pub async fn shutdown(self) {
        self.shutdown.notify_waiters();
        let _ = self.handle.await;
    }
}

/// Run one attached transport until it ends.
async fn drive(engine: &Arc<Mutex<Engine>>, stream: TcpStream, shutdown: &Notify) -> LinkEnd {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "could not disable nagle");
    }
    let (read_half, mut write_half) = stream.into_split();

    let tick_interval = {
        let mut locked = engine.lock();
        if let Err(e) = locked.transport_attached() {
            warn!(error = %e, "refusing transport");
            return LinkEnd::Lost;
        }
        locked.config.tick_interval
    };

    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(8);
    let reader = tokio::spawn(read_frames(read_half, frame_tx));

    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let end = loop {
        if flush_outbox(engine, &mut write_half).await.is_err() {
            break LinkEnd::Lost;
        }

        tokio::select! {
            _ = interval.tick() => {
                engine.lock().tick(Instant::now());
            }
            frame = frame_rx.recv() => {
                match frame {
                    None => break LinkEnd::Lost,
                    Some(frame) => {
                        let result = engine.lock().handle_frame(&frame, Instant::now());
                        if let Err(e) = result {
                            if e.is_hostile() {
                                warn!(error = %e, "link poisoned");
                                break LinkEnd::Poisoned;
                            }
                            // non-hostile protocol noise is survivable
                            warn!(error = %e, "frame rejected");
                        }
                    }
                }
            }
            _ = shutdown.notified() => break LinkEnd::Shutdown,
        }
    };

    reader.abort();
    engine.lock().transport_lost();
    end
}

/// Read length-prefixed frames into the channel until the stream ends.
async fn read_frames(mut read_half: OwnedReadHalf, frames: mpsc::Sender<Vec<u8>>) {
    loop {
        let mut prefix = [0u8; 4];
        if read_half.read_exact(&mut prefix).await.is_err() {
            return;
        }
        let length = u32::from_be_bytes(prefix) as usize;
        if !(HEADER_SIZE..=PACKET_MAX_SIZE).contains(&length) {
            warn!(length, "dropping stream with an impossible frame length");
            return;
        }
        let mut frame = vec![0u8; length];
        frame[..4].copy_from_slice(&prefix);
        if read_half.read_exact(&mut frame[4..]).await.is_err() {
            return;
        }
        if frames.send(frame).await.is_err() {
            return;
        }
    }
}

async fn flush_outbox(
    engine: &Arc<Mutex<Engine>>,
    write_half: &mut OwnedWriteHalf,
) -> std::io::Result<()> {
    let frames = engine.lock().take_outbox();
    for frame in frames {
        write_half.write_all(&frame).await?;
    }
    write_half.flush().await
}

/// Parse `tcp://host:port`. The asterisk host resolves to a local
/// default-gateway IPv4 where one can be determined.
pub fn parse_peer_uri(uri: &str) -> Result<(String, u16), ProtocolError> {
    let rest = uri
        .strip_prefix("tcp://")
        .ok_or_else(|| ProtocolError::Config(format!("unknown scheme in URI {uri:?}")))?;
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| ProtocolError::Config(format!("no port in URI {uri:?}")))?;
    if host.is_empty() {
        return Err(ProtocolError::Config(format!("no host in URI {uri:?}")));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| ProtocolError::Config(format!("bad port in URI {uri:?}")))?;

    if host == "*" {
        // keep the asterisk for bind sites, but prefer a concrete address
        return Ok((
            default_local_ipv4()
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "*".to_string()),
            port,
        ));
    }
    Ok((host.to_string(), port))
}

/// The local IPv4 the default route would use; no packet is sent.
fn default_local_ipv4() -> Option<Ipv4Addr> {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    probe.connect("8.8.8.8:53").ok()?;
    match probe.local_addr().ok()? {
        std::net::SocketAddr::V4(addr) if !addr.ip().is_loopback() => Some(*addr.ip()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer_uri() {
        assert_eq!(
            parse_peer_uri("tcp://alice.example:10001").unwrap(),
            ("alice.example".to_string(), 10001)
        );
        assert_eq!(
            parse_peer_uri("tcp://127.0.0.1:0").unwrap(),
            ("127.0.0.1".to_string(), 0)
        );
    }

    #[test]
    fn test_parse_peer_uri_rejects_garbage() {
        assert!(parse_peer_uri("udp://host:1").is_err());
        assert!(parse_peer_uri("tcp://hostonly").is_err());
        assert!(parse_peer_uri("tcp://:77").is_err());
        assert!(parse_peer_uri("tcp://host:notaport").is_err());
    }

    #[test]
    fn test_asterisk_host_resolves_or_stays() {
        let (host, port) = parse_peer_uri("tcp://*:4000").unwrap();
        assert_eq!(port, 4000);
        assert!(!host.is_empty());
    }
}
