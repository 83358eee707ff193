//! The top-level [`Agent`]: binds a listener and drives one [`driver::run`]
//! task per accepted connection, sharing an [`engine::Registry`] across all
//! of them.

use crate::driver::{self, DriverConfig, Handler};
use crate::engine::Registry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Semaphore;

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Socket buffer size the original sets via `SetWriteBuffer`/`SetReadBuffer`:
/// four times the largest frame a connection can negotiate.
const SOCKET_BUFFER_SIZE: u32 = crate::frame::MAX_FRAME_SIZE * 4;

/// Tunables for every connection the agent drives.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    /// Caps the number of connections handled concurrently. `None` means
    /// unbounded.
    pub max_connections: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(30),
            max_connections: None,
        }
    }
}

impl From<Config> for DriverConfig {
    fn from(cfg: Config) -> Self {
        DriverConfig {
            read_timeout: cfg.read_timeout,
            write_timeout: cfg.write_timeout,
            idle_timeout: cfg.idle_timeout,
        }
    }
}

/// Runs the SPOP agent protocol over accepted connections, invoking
/// `handler` for each NOTIFY message.
pub struct Agent {
    handler: Arc<Handler>,
    cfg: Config,
    registry: Arc<Registry>,
    next_conn_id: AtomicU64,
}

impl Agent {
    pub fn new(handler: Arc<Handler>) -> Self {
        Agent::with_config(handler, Config::default())
    }

    pub fn with_config(handler: Arc<Handler>, cfg: Config) -> Self {
        Agent {
            handler,
            cfg,
            registry: Arc::new(Registry::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Bind `addr` and serve TCP connections until the listener errors.
    pub async fn listen_and_serve_tcp<A: ToSocketAddrs>(&self, addr: A) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_tcp(listener).await
    }

    #[tracing::instrument(skip_all, fields(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default()))]
    pub async fn serve_tcp(&self, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!("spop: listening");
        let permits = self.cfg.max_connections.map(|n| Arc::new(Semaphore::new(n)));

        loop {
            let (socket, peer) = listener.accept().await?;
            socket.set_nodelay(true).ok();
            if let Err(e) = set_tcp_buffers(&socket) {
                tracing::warn!(error = %e, "failed to size socket buffers");
            }

            tracing::debug!(%peer, "spop: connection accepted");
            self.spawn_connection(socket, permits.clone()).await;
        }
    }

    /// Bind `path` and serve Unix-domain connections until the listener
    /// errors.
    #[cfg(unix)]
    pub async fn listen_and_serve_unix<P: AsRef<std::path::Path>>(&self, path: P) -> std::io::Result<()> {
        let listener = UnixListener::bind(path)?;
        self.serve_unix(listener).await
    }

    #[cfg(unix)]
    pub async fn serve_unix(&self, listener: UnixListener) -> std::io::Result<()> {
        tracing::info!("spop: listening on unix socket");
        let permits = self.cfg.max_connections.map(|n| Arc::new(Semaphore::new(n)));

        loop {
            let (socket, _addr) = listener.accept().await?;
            tracing::debug!("spop: unix connection accepted");
            self.spawn_connection(socket, permits.clone()).await;
        }
    }

    async fn spawn_connection<S>(&self, socket: S, permits: Option<Arc<Semaphore>>)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let handler = Arc::clone(&self.handler);
        let registry = Arc::clone(&self.registry);
        let cfg: DriverConfig = self.cfg.into();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            // Held for the lifetime of the connection; dropped on return,
            // freeing the slot for the next `accept`.
            let _permit = match permits {
                Some(sem) => match sem.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };

            if let Err(e) = driver::run(socket, conn_id, handler, registry, cfg).await {
                tracing::warn!(error = %e, "spop: connection ended with error");
            }
        });
    }
}

fn set_tcp_buffers(socket: &TcpStream) -> std::io::Result<()> {
    let sock_ref = socket2::SockRef::from(socket);
    sock_ref.set_send_buffer_size(SOCKET_BUFFER_SIZE as usize)?;
    sock_ref.set_recv_buffer_size(SOCKET_BUFFER_SIZE as usize)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Action;
    use crate::codec::Value;
    use crate::connection::{FrameReader, FrameWriter};
    use crate::frame::{Frame, FrameType, FLAG_FIN};
    use crate::notify::MessageIterator;
    use bytes::BytesMut;

    fn noop_handler() -> Arc<Handler> {
        Arc::new(|_messages: &mut MessageIterator| Ok(Vec::<Action>::new()))
    }

    #[tokio::test]
    async fn serve_tcp_completes_a_hello_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let agent = Agent::new(noop_handler());
        tokio::spawn(async move {
            let _ = agent.serve_tcp(listener).await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = tokio::io::split(stream);
        let mut writer = FrameWriter::new(write_half);
        let mut reader = FrameReader::new(read_half);

        let mut body = BytesMut::new();
        crate::codec::encode_kv(&mut body, "supported-versions", &Value::Str("2.0".to_string()));
        crate::codec::encode_kv(&mut body, "max-frame-size", &Value::U32(16_380));
        crate::codec::encode_kv(&mut body, "capabilities", &Value::Str("pipelining".to_string()));
        crate::codec::encode_kv(&mut body, "engine-id", &Value::Str("e1".to_string()));
        let hello = Frame {
            ftype: FrameType::HaproxyHello,
            flags: FLAG_FIN,
            stream_id: 0,
            frame_id: 0,
            data: body.freeze(),
        };

        writer
            .write_frame(&hello, std::time::Duration::from_secs(1))
            .await
            .unwrap();

        let reply = reader
            .read_frame(std::time::Duration::from_secs(1), std::time::Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.ftype, FrameType::AgentHello);
    }

    #[test]
    fn default_config_matches_the_documented_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.read_timeout, Duration::from_secs(1));
        assert_eq!(cfg.write_timeout, Duration::from_secs(1));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(30));
        assert!(cfg.max_connections.is_none());
    }
}
