//! UDP discovery responder.
//!
//! Apps locate the device by broadcasting a probe to a well-known port;
//! the responder answers the sender directly with the HTTP port.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  FLUENS_DISCOVER              (broadcast, surrounding whitespace ignored)
//! Response: FLUENS_ESP32_HERE:<port>     (unicast to the sender)
//! ```
//!
//! Anything else gets no reply.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Well-known UDP discovery port
pub const DISCOVERY_PORT: u16 = 12345;

/// Payload an app broadcasts to find the device
pub const DISCOVERY_PROBE: &str = "FLUENS_DISCOVER";

/// Reply prefix, followed by the decimal HTTP port
pub const DISCOVERY_REPLY_PREFIX: &str = "FLUENS_ESP32_HERE:";

/// Back-off after a failed receive
const RECV_ERROR_PAUSE: Duration = Duration::from_secs(1);

const MAX_DATAGRAM: usize = 1024;

/// Whether a datagram is a discovery probe.
pub fn is_probe(payload: &[u8]) -> bool {
    std::str::from_utf8(payload)
        .map(|text| text.trim() == DISCOVERY_PROBE)
        .unwrap_or(false)
}

/// Reply payload advertising `http_port`.
pub fn reply_for(http_port: u16) -> String {
    format!("{DISCOVERY_REPLY_PREFIX}{http_port}")
}

/// Create a broadcast-capable UDP socket.
///
/// No address or port reuse: a second instance on the same port fails to bind.
fn create_discovery_socket(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_broadcast(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// Whether the loop keeps going after handling one receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Sleep for `pause` unless `stop` fires first. Returns `Flow::Stop` if it did.
async fn pause_unless_stopped(pause: Duration, stop: &mut watch::Receiver<bool>) -> Flow {
    tokio::select! {
        changed = stop.changed() => {
            if changed.is_err() || *stop.borrow() {
                Flow::Stop
            } else {
                Flow::Continue
            }
        }
        _ = tokio::time::sleep(pause) => Flow::Continue,
    }
}

/// Answers discovery probes on a bound UDP socket.
pub struct DiscoveryResponder {
    socket: UdpSocket,
    error_pause: Duration,
}

impl DiscoveryResponder {
    /// Bind the responder socket. Must be called from within a tokio runtime.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let std_socket = create_discovery_socket(addr)?;
        let socket = UdpSocket::from_std(std_socket)?;
        Ok(Self {
            socket,
            error_pause: RECV_ERROR_PAUSE,
        })
    }

    /// Override the back-off after a failed receive.
    #[cfg(test)]
    pub fn with_error_pause(mut self, pause: Duration) -> Self {
        self.error_pause = pause;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Answer probes until `stop` flips to true. The socket is closed on return.
    pub async fn run(self, http_port: u16, mut stop: watch::Receiver<bool>) {
        let reply = reply_for(http_port);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            if *stop.borrow() {
                break;
            }

            let flow = tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        Flow::Stop
                    } else {
                        Flow::Continue
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    self.on_received(received, &buf, &reply, &mut stop).await
                }
            };

            if flow == Flow::Stop {
                break;
            }
        }

        debug!("Discovery responder stopped");
    }

    async fn on_received(
        &self,
        received: io::Result<(usize, SocketAddr)>,
        buf: &[u8],
        reply: &str,
        stop: &mut watch::Receiver<bool>,
    ) -> Flow {
        match received {
            Ok((len, peer)) => {
                if is_probe(&buf[..len]) {
                    match self.socket.send_to(reply.as_bytes(), peer).await {
                        Ok(_) => info!(peer = %peer, reply, "Answered discovery probe"),
                        Err(e) => warn!(peer = %peer, error = %e, "Failed to send discovery reply"),
                    }
                } else {
                    debug!(peer = %peer, len, "Ignoring non-probe datagram");
                }
                Flow::Continue
            }
            Err(e) => {
                warn!(error = %e, pause_ms = self.error_pause.as_millis() as u64, "UDP receive error");
                pause_unless_stopped(self.error_pause, stop).await
            }
        }
    }
}

/// Bind and run the responder. A bind failure ends only this component.
pub async fn serve(addr: SocketAddr, http_port: u16, stop: watch::Receiver<bool>) {
    let responder = match DiscoveryResponder::bind(addr) {
        Ok(responder) => responder,
        Err(e) => {
            error!(addr = %addr, error = %e, "Failed to bind discovery socket, discovery disabled");
            return;
        }
    };

    let local = responder.local_addr().unwrap_or(addr);
    info!(addr = %local, http_port, "UDP discovery listening");
    responder.run(http_port, stop).await;
}
