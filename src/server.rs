//! Service supervisor.
//!
//! Binds the HTTP listener, then starts the discovery responder and the
//! console producer as separate tasks once the HTTP port is known. On
//! shutdown both background loops get a stop signal and are awaited.

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::io::BufRead;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::console::{self, Console, ConsoleProducer};
use crate::discovery;
use crate::error::{Result, ServerError};
use crate::http::{self, AppContext};
use crate::slot::MessageSlot;

/// Server instance, not yet listening
pub struct Server {
    config: Config,
    slot: Arc<MessageSlot>,
    console: Console,
}

impl Server {
    /// Create a new server with an empty message slot
    pub fn new(config: Config, console: Console) -> Self {
        Server {
            config,
            slot: Arc::new(MessageSlot::new()),
            console,
        }
    }

    /// Bind the HTTP listener. Failure here is fatal to the whole service.
    pub async fn bind(self) -> Result<BoundServer> {
        let addr = self.config.http_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        info!(address = %listener.local_addr()?, "HTTP server listening");

        Ok(BoundServer {
            listener,
            config: self.config,
            slot: self.slot,
            console: self.console,
        })
    }
}

/// Server with its HTTP listener bound
pub struct BoundServer {
    listener: TcpListener,
    config: Config,
    slot: Arc<MessageSlot>,
    console: Console,
}

impl BoundServer {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get a reference to the message slot for testing
    #[cfg(test)]
    pub fn slot(&self) -> &Arc<MessageSlot> {
        &self.slot
    }

    /// Serve until `shutdown` resolves, reading operator lines from `input`.
    pub async fn run<R, F>(self, input: R, shutdown: F) -> Result<()>
    where
        R: BufRead + Send + 'static,
        F: Future<Output = ()>,
    {
        let local = self.local_addr()?;
        self.console.banner(local);

        let (stop_tx, stop_rx) = watch::channel(false);

        let discovery_task = tokio::spawn(discovery::serve(
            self.config.discovery_addr(),
            local.port(),
            stop_rx.clone(),
        ));

        let lines = console::spawn_reader(input)?;
        let producer = ConsoleProducer::new(Arc::clone(&self.slot), self.console.clone());
        let console_task = tokio::spawn(producer.run(lines, stop_rx));

        let ctx = AppContext {
            slot: Arc::clone(&self.slot),
            console: self.console.clone(),
        };

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "New connection");
                        let ctx = ctx.clone();

                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| http::handle(req, ctx.clone()));
                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                debug!(peer = %peer, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        drop(self.listener);
        let _ = stop_tx.send(true);
        join_background("discovery", discovery_task).await;
        join_background("console", console_task).await;
        info!("Server stopped");

        Ok(())
    }
}

/// Await a background loop; cancellation counts as a normal exit.
async fn join_background(name: &str, task: JoinHandle<()>) {
    match task.await {
        Ok(()) => debug!(task = name, "Background task finished"),
        Err(e) if e.is_cancelled() => debug!(task = name, "Background task cancelled"),
        Err(e) => error!(task = name, error = %e, "Background task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::tests::SharedBuf;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpStream, UdpSocket};
    use tokio::sync::oneshot;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config(discovery_port: u16) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            discovery_port,
            log_level: "info".to_string(),
        }
    }

    fn free_udp_port() -> u16 {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    }

    async fn http_request(addr: SocketAddr, method: &str, path: &str, body: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let raw = format!(
            "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\
             Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(raw.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = Server::new(test_config(0), Console::new(std::io::sink()));
        let bound = server.bind().await.unwrap();

        assert_ne!(bound.local_addr().unwrap().port(), 0);
        assert!(bound.slot().get().is_none());
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config(0);
        config.port = holder.local_addr().unwrap().port();

        let err = match Server::new(config, Console::new(std::io::sink())).bind().await {
            Ok(_) => panic!("bind should fail while the port is held"),
            Err(e) => e,
        };
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let buf = SharedBuf::default();
        let discovery_port = free_udp_port();
        let bound = Server::new(test_config(discovery_port), Console::new(buf.clone()))
            .bind()
            .await
            .unwrap();
        let addr = bound.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let input = Cursor::new(b"status please\n".to_vec());
        let server = tokio::spawn(bound.run(input, async move {
            let _ = shutdown_rx.await;
        }));

        // Console line eventually shows up in the poll
        let polled = timeout(WAIT, async {
            loop {
                let response = http_request(addr, "GET", "/messages", "").await;
                if response.contains("status please") {
                    return response;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert!(polled.starts_with("HTTP/1.1 200"));
        assert!(polled.contains("\"id\":"));

        let posted = http_request(addr, "POST", "/response", r#"{"response":"hello"}"#).await;
        assert!(posted.starts_with("HTTP/1.1 200"));
        assert!(posted.ends_with("OK"));
        assert!(buf.contents().contains("[APP SAYS]: hello"));

        let rejected = http_request(addr, "POST", "/response", "{oops").await;
        assert!(rejected.starts_with("HTTP/1.1 400"));

        // Discovery reports the actual HTTP port
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut reply = [0u8; 64];
        let len = timeout(WAIT, async {
            loop {
                client
                    .send_to(b"FLUENS_DISCOVER", ("127.0.0.1", discovery_port))
                    .await
                    .unwrap();
                if let Ok(Ok((len, _))) =
                    timeout(Duration::from_millis(200), client.recv_from(&mut reply)).await
                {
                    return len;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(
            std::str::from_utf8(&reply[..len]).unwrap(),
            format!("FLUENS_ESP32_HERE:{}", addr.port())
        );

        shutdown_tx.send(()).unwrap();
        assert_ok!(timeout(WAIT, server).await.unwrap().unwrap());

        // Discovery socket is released on shutdown
        assert!(std::net::UdpSocket::bind(("0.0.0.0", discovery_port)).is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_with_blocked_input() {
        // Reader that never yields a line, like an idle terminal
        struct Idle;
        impl std::io::Read for Idle {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                std::thread::sleep(Duration::from_secs(3600));
                Ok(0)
            }
        }

        let bound = Server::new(test_config(0), Console::new(std::io::sink()))
            .bind()
            .await
            .unwrap();

        let run = bound.run(std::io::BufReader::new(Idle), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        timeout(WAIT, run).await.unwrap().unwrap();
    }
}
