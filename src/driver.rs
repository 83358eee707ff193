//! Per-connection state machine: HELLO negotiation, the NOTIFY worker
//! pool, and the reply-writer task that drains an engine's shared ACK
//! channel back onto this connection.
//!
//! Generic over the socket type so the identical state machine drives
//! both TCP and Unix-domain connections.

use crate::actions::Action;
use crate::disconnect;
use crate::engine::{EngineEntry, EngineKey, Registry};
use crate::errors::{HandlerError, ProtocolError, StatusCode};
use crate::frame::{Frame, FrameType};
use crate::hello;
use crate::notify::MessageIterator;
use crate::connection::{FrameReader, FrameWriter};
use crate::pool;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::time::Instant;

/// Handler invoked for each NOTIFY frame; returns the actions to reply
/// with in the matching ACK.
pub type Handler = dyn Fn(&mut MessageIterator) -> Result<Vec<Action>, HandlerError> + Send + Sync;

const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(2);

tokio::task_local! {
    /// Counts worker tasks spawned during the scope of a single test's
    /// `driver::run` call, so a test can confirm the pool reuses an idle
    /// worker instead of respawning one. A task-local rather than a
    /// process-wide static so concurrently running tests don't pollute
    /// each other's counts; unset (and silently skipped) outside a test
    /// that opts in via `WORKERS_SPAWNED.scope(...)`.
    #[cfg(test)]
    pub(crate) static WORKERS_SPAWNED: Arc<std::sync::atomic::AtomicUsize>;
}

/// Per-connection timeouts, a subset of [`crate::agent::Config`].
#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
}

/// Drive a single accepted connection to completion: negotiate HELLO,
/// then alternate between dispatching NOTIFY frames to workers and
/// forwarding ACKs back out, until the peer disconnects or an
/// unrecoverable protocol error occurs.
#[tracing::instrument(skip_all, fields(conn_id))]
pub async fn run<S>(
    socket: S,
    conn_id: u64,
    handler: Arc<Handler>,
    registry: Arc<Registry>,
    cfg: DriverConfig,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(socket);
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    let first = reader.read_frame(cfg.idle_timeout, cfg.read_timeout).await?;
    let first = match first {
        Some(f) => f,
        None => return Ok(()),
    };

    if first.ftype != FrameType::HaproxyHello {
        return Err(ProtocolError::Invalid(format!(
            "unexpected frame type {:?} when initializing connection",
            first.ftype
        )));
    }

    let outcome = match hello::handle_hello(&first) {
        Ok(outcome) => outcome,
        Err(e) => {
            let discon = disconnect::build(e.status_code());
            let _ = writer.write_frame(&discon, cfg.write_timeout).await;
            return Err(e);
        }
    };
    writer.write_frame(&outcome.reply, cfg.write_timeout).await?;

    if outcome.healthcheck {
        let disconnect_frame = disconnect::build(StatusCode::None);
        let _ = writer.write_frame(&disconnect_frame, cfg.write_timeout).await;
        return Ok(());
    }

    let engine_key = EngineKey {
        frame_size: outcome.frame_size,
        engine_id: outcome.engine_id.unwrap_or_default(),
        conn_id: if outcome.async_capable { None } else { Some(conn_id) },
    };
    let entry = registry.join(engine_key.clone());

    let (stop_tx, stop_rx) = oneshot::channel::<StatusCode>();
    let reply_task = spawn_reply_writer(writer, Arc::clone(&entry), cfg.write_timeout, stop_rx);

    let result = run_notify_loop(&mut reader, Arc::clone(&handler), &entry, cfg).await;

    let status = match &result {
        Ok(()) => StatusCode::None,
        Err(e) => e.status_code(),
    };
    let _ = stop_tx.send(status);
    let _ = reply_task.await;

    registry.leave(&engine_key);
    result
}

/// Owns the connection's write half for its lifetime: forwards every ACK
/// posted to the engine's shared channel, then writes the final
/// DISCONNECT frame once the read loop signals completion.
fn spawn_reply_writer<W>(
    mut writer: FrameWriter<W>,
    entry: Arc<EngineEntry>,
    write_timeout: Duration,
    mut stop_rx: oneshot::Receiver<StatusCode>,
) -> tokio::task::JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let next_ack = {
                let mut rx = entry.acks_rx.lock().await;
                rx.recv()
            };

            tokio::select! {
                biased;
                status = &mut stop_rx => {
                    let code = status.unwrap_or(StatusCode::Unknown);
                    let frame = disconnect::build(code);
                    if let Err(e) = writer.write_frame(&frame, write_timeout).await {
                        tracing::warn!(error = %e, "failed to send disconnect frame");
                    }
                    return;
                }
                ack = next_ack => {
                    match ack {
                        Some(frame) => {
                            if let Err(e) = writer.write_frame(&frame, write_timeout).await {
                                tracing::warn!(error = %e, "failed to write ack frame");
                            }
                            pool::recycle(frame.data);
                        }
                        None => return,
                    }
                }
            }
        }
    })
}

async fn run_notify_loop<R>(
    reader: &mut FrameReader<R>,
    handler: Arc<Handler>,
    entry: &Arc<EngineEntry>,
    cfg: DriverConfig,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let (notify_tx, notify_rx) = mpsc::channel::<Frame>(1);
    let notify_rx = Arc::new(AsyncMutex::new(notify_rx));

    let result = loop {
        match reader.read_frame(cfg.idle_timeout, cfg.read_timeout).await {
            Ok(Some(frame)) => match frame.ftype {
                FrameType::HaproxyNotify => {
                    // A rendezvous-style send only succeeds while some
                    // worker is already blocked in `recv`, mirroring the
                    // original's `select { case tasks <- frame: default:
                    // spawn }` elastic pool.
                    if let Err(err) = notify_tx.try_send(frame) {
                        let frame = err.into_inner();
                        spawn_worker(
                            Arc::clone(&notify_rx),
                            Arc::clone(&handler),
                            entry.acks_tx.clone(),
                        );
                        // The freshly spawned worker is about to start
                        // polling; this send completes as soon as it does.
                        let _ = notify_tx.send(frame).await;
                    }
                }
                FrameType::HaproxyDiscon => {
                    disconnect::handle(&frame)?;
                    break Ok(());
                }
                other => {
                    break Err(ProtocolError::Invalid(format!(
                        "frame type {other:?} is not handled"
                    )));
                }
            },
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    result
}

fn spawn_worker(
    notify_rx: Arc<AsyncMutex<mpsc::Receiver<Frame>>>,
    handler: Arc<Handler>,
    acks_tx: mpsc::Sender<Frame>,
) {
    #[cfg(test)]
    let _ = WORKERS_SPAWNED.try_with(|counter| {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });

    tokio::spawn(async move {
        loop {
            let sleep = tokio::time::sleep_until(Instant::now() + WORKER_IDLE_TIMEOUT);
            tokio::pin!(sleep);

            let frame = {
                let mut rx = notify_rx.lock().await;
                tokio::select! {
                    frame = rx.recv() => frame,
                    _ = &mut sleep => None,
                }
            };

            match frame {
                Some(frame) => handle_notify(frame, &handler, &acks_tx).await,
                None => return,
            }
        }
    });
}

/// Handle one NOTIFY frame: decode its messages, invoke `handler`, and post
/// the resulting ACK onto the engine's shared channel. The NOTIFY's payload
/// buffer and the ACK's encode buffer are both pool-backed and recycled as
/// soon as each is done with — the payload once the handler returns, the
/// ACK's once the reply-writer has flushed it to the socket.
async fn handle_notify(frame: Frame, handler: &Handler, acks_tx: &mpsc::Sender<Frame>) {
    let payload = frame.data;
    let mut messages = MessageIterator::new(payload.clone());
    let result = handler(&mut messages);
    drop(messages);
    pool::recycle(payload);

    let actions = match result {
        Ok(actions) => actions,
        Err(e) => {
            tracing::error!(error = %e, "handler failed");
            return;
        }
    };

    let mut body = pool::get();
    crate::actions::encode_actions_into(&mut body, &actions);
    let ack = Frame {
        ftype: FrameType::AgentAck,
        flags: frame.flags,
        stream_id: frame.stream_id,
        frame_id: frame.frame_id,
        data: body.freeze(),
    };

    if acks_tx.send(ack).await.is_err() {
        tracing::warn!("ack channel closed before reply could be delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Scope;
    use crate::codec::Value;
    use crate::engine::Registry;
    use crate::frame::FLAG_FIN;
    use bytes::{BufMut, BytesMut};
    use std::time::Duration;

    fn default_cfg() -> DriverConfig {
        DriverConfig {
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_millis(200),
        }
    }

    fn echo_handler() -> Arc<Handler> {
        Arc::new(|messages: &mut MessageIterator| {
            let mut actions = Vec::new();
            for message in messages {
                let message = message.map_err(|e| HandlerError::Failed(e.to_string()))?;
                actions.push(Action::SetVar {
                    name: format!("seen.{}", message.name),
                    scope: Scope::Transaction,
                    value: Value::Bool(true),
                });
            }
            Ok(actions)
        })
    }

    fn hello_frame() -> Frame {
        let mut body = BytesMut::new();
        crate::codec::encode_kv(&mut body, "supported-versions", &Value::Str("2.0".to_string()));
        crate::codec::encode_kv(&mut body, "max-frame-size", &Value::U32(16_380));
        crate::codec::encode_kv(&mut body, "capabilities", &Value::Str("pipelining".to_string()));
        crate::codec::encode_kv(&mut body, "engine-id", &Value::Str("e1".to_string()));
        Frame {
            ftype: FrameType::HaproxyHello,
            flags: FLAG_FIN,
            stream_id: 0,
            frame_id: 0,
            data: body.freeze(),
        }
    }

    fn notify_frame() -> Frame {
        let mut body = BytesMut::new();
        crate::codec::encode_string(&mut body, "msg");
        body.put_u8(0);
        Frame {
            ftype: FrameType::HaproxyNotify,
            flags: FLAG_FIN,
            stream_id: 1,
            frame_id: 1,
            data: body.freeze(),
        }
    }

    fn discon_frame() -> Frame {
        let frame = disconnect::build(StatusCode::None);
        Frame {
            stream_id: 0,
            frame_id: 0,
            ..frame
        }
    }

    #[tokio::test]
    async fn full_hello_notify_ack_disconnect_cycle() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let registry = Arc::new(Registry::new());
        let cfg = default_cfg();

        let driver = tokio::spawn(run(server, 1, echo_handler(), Arc::clone(&registry), cfg));

        let (client_read, client_write) = tokio::io::split(client);
        let mut client_writer = FrameWriter::new(client_write);
        let mut client_reader = FrameReader::new(client_read);

        client_writer.write_frame(&hello_frame(), Duration::from_secs(1)).await.unwrap();
        let reply = client_reader
            .read_frame(Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.ftype, FrameType::AgentHello);

        client_writer.write_frame(&notify_frame(), Duration::from_secs(1)).await.unwrap();
        let ack = client_reader
            .read_frame(Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.ftype, FrameType::AgentAck);

        client_writer.write_frame(&discon_frame(), Duration::from_secs(1)).await.unwrap();
        let final_frame = client_reader
            .read_frame(Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(final_frame.ftype, FrameType::AgentDiscon);

        driver.await.unwrap().unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn non_hello_first_frame_is_rejected() {
        let (client, server) = tokio::io::duplex(4096);
        let registry = Arc::new(Registry::new());
        let driver = tokio::spawn(run(server, 1, echo_handler(), registry, default_cfg()));

        let (_client_read, client_write) = tokio::io::split(client);
        let mut client_writer = FrameWriter::new(client_write);
        client_writer.write_frame(&notify_frame(), Duration::from_secs(1)).await.unwrap();

        let result = driver.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn healthcheck_hello_replies_and_closes_without_touching_registry() {
        let (client, server) = tokio::io::duplex(4096);
        let registry = Arc::new(Registry::new());
        let driver = tokio::spawn(run(server, 1, echo_handler(), Arc::clone(&registry), default_cfg()));

        let (client_read, client_write) = tokio::io::split(client);
        let mut client_writer = FrameWriter::new(client_write);
        let mut client_reader = FrameReader::new(client_read);

        let mut body = BytesMut::new();
        crate::codec::encode_kv(&mut body, "supported-versions", &Value::Str("2.0".to_string()));
        crate::codec::encode_kv(&mut body, "max-frame-size", &Value::U32(16_380));
        crate::codec::encode_kv(&mut body, "capabilities", &Value::Str("".to_string()));
        crate::codec::encode_kv(&mut body, "healthcheck", &Value::Bool(true));
        let frame = Frame {
            ftype: FrameType::HaproxyHello,
            flags: FLAG_FIN,
            stream_id: 0,
            frame_id: 0,
            data: body.freeze(),
        };

        client_writer.write_frame(&frame, Duration::from_secs(1)).await.unwrap();
        let reply = client_reader
            .read_frame(Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.ftype, FrameType::AgentHello);

        let disconnect_frame = client_reader
            .read_frame(Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(disconnect_frame.ftype, FrameType::AgentDiscon);

        driver.await.unwrap().unwrap();
        assert!(registry.is_empty());
    }
}
