//! Connection driver: one writer task, one read loop, EdgeCore behind a mutex.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use diode_core::{
    Error, EdgeCore, Event, Method, Request, Response, SessionEvent, TicketOutcome, TicketParams,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const LEN_SIZE: usize = 2;

/// Callers waiting on a request id.
pub type Waiters = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Response, Error>>>>>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] Error),
    #[error("connection closed")]
    Closed,
    #[error("port open refused: {0}")]
    Refused(String),
    #[error("unexpected {0} response")]
    Unexpected(Method),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

/// Handle for issuing requests on a running connection.
#[derive(Clone)]
pub struct EdgeClient {
    core: Arc<Mutex<EdgeCore>>,
    waiters: Waiters,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    sessions: mpsc::UnboundedSender<SessionEvent>,
}

impl EdgeClient {
    /// Send a request the server does not answer, such as `hello` or `goodbye`.
    pub async fn cast(&self, request: Request) -> Result<(), ClientError> {
        let frame = self.core.lock().await.cast(&request)?;
        self.outbound.send(frame).map_err(|_| ClientError::Closed)
    }

    /// Like `call`, but cancels the request if no reply arrives within `limit`.
    pub async fn call_timeout(
        &self,
        request: Request,
        limit: Duration,
    ) -> Result<Response, ClientError> {
        let (request_id, rx) = {
            let mut core = self.core.lock().await;
            let (request_id, frame) = core.call(&request)?;
            (request_id, self.enqueue(request_id, frame).await?)
        };
        match tokio::time::timeout(limit, rx).await {
            Ok(reply) => Ok(reply.map_err(|_| ClientError::Closed)??),
            Err(_) => {
                let events = self.core.lock().await.cancel(request_id);
                self.deliver(events).await;
                Err(ClientError::Timeout(limit))
            }
        }
    }

    /// Send `request` and wait for its decoded response.
    pub async fn call(&self, request: Request) -> Result<Response, ClientError> {
        let rx = {
            let mut core = self.core.lock().await;
            let (request_id, frame) = core.call(&request)?;
            self.enqueue(request_id, frame).await?
        };
        Ok(rx.await.map_err(|_| ClientError::Closed)??)
    }

    /// Open `port` on `device_id`. Returns the session ref once the server accepts.
    pub async fn open_port(&self, port: u64, device_id: Vec<u8>) -> Result<u64, ClientError> {
        let rx = {
            let mut core = self.core.lock().await;
            let (handle, frame) = core.open_port(port, device_id)?;
            self.enqueue(handle.request_id, frame).await?
        };
        match rx.await.map_err(|_| ClientError::Closed)?? {
            Response::PortOpen { open, .. } if open.ok => Ok(open.ref_id),
            Response::PortOpen { result, .. } => Err(ClientError::Refused(result)),
            other => Err(ClientError::Unexpected(other.method())),
        }
    }

    /// Queue `data` on an open tunnel. Tunnel data is never acknowledged.
    pub async fn send_data(&self, ref_id: u64, data: &[u8]) -> Result<(), ClientError> {
        let mut core = self.core.lock().await;
        for frame in core.send_data(ref_id, data)? {
            self.outbound.send(frame).map_err(|_| ClientError::Closed)?;
        }
        Ok(())
    }

    pub async fn close_port(&self, ref_id: u64) -> Result<(), ClientError> {
        let mut core = self.core.lock().await;
        let frame = core.close_port(ref_id)?;
        self.outbound.send(frame).map_err(|_| ClientError::Closed)
    }

    /// Sign and submit the current usage ticket. Requires a core built with a ticket manager.
    pub async fn submit_ticket(&self, params: &TicketParams) -> Result<TicketOutcome, ClientError> {
        let rx = {
            let mut core = self.core.lock().await;
            let (request_id, frame) = core.submit_ticket(params)?;
            self.enqueue(request_id, frame).await?
        };
        match rx.await.map_err(|_| ClientError::Closed)?? {
            Response::Ticket(outcome) => Ok(outcome),
            other => Err(ClientError::Unexpected(other.method())),
        }
    }

    /// Register a waiter and queue the frame. Caller holds the core lock so
    /// the reply cannot be routed before the waiter exists.
    async fn enqueue(
        &self,
        request_id: u64,
        frame: Vec<u8>,
    ) -> Result<oneshot::Receiver<Result<Response, Error>>, ClientError> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().await;
        waiters.insert(request_id, tx);
        if self.outbound.send(frame).is_err() {
            waiters.remove(&request_id);
            return Err(ClientError::Closed);
        }
        Ok(rx)
    }

    async fn deliver(&self, events: Vec<Event>) {
        for event in events {
            match event {
                Event::Send(frame) => {
                    let _ = self.outbound.send(frame);
                }
                Event::Resolved { request_id, result } => {
                    let waiter = self.waiters.lock().await.remove(&request_id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(result);
                        }
                        None => debug!(request_id, ok = result.is_ok(), "response with no waiter"),
                    }
                }
                Event::Session(event) => {
                    let _ = self.sessions.send(event);
                }
                Event::InboundRejected { request_id, error } => {
                    warn!(request_id, error = %error, "server request rejected");
                }
            }
        }
    }
}

/// A running connection: the client handle, tunnel events, and the read task.
pub struct Connection {
    pub client: EdgeClient,
    pub sessions: mpsc::UnboundedReceiver<SessionEvent>,
    pub task: JoinHandle<io::Result<()>>,
}

/// Drive `core` over a byte stream split into `reader` and `writer`.
pub fn spawn<R, W>(reader: R, writer: W, core: EdgeCore) -> Connection
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (session_tx, session_rx) = mpsc::unbounded_channel();
    let client = EdgeClient {
        core: Arc::new(Mutex::new(core)),
        waiters: Arc::new(Mutex::new(HashMap::new())),
        outbound: tx,
        sessions: session_tx,
    };
    tokio::spawn(async move {
        if let Err(e) = write_loop(writer, rx).await {
            warn!(error = %e, "write failed");
        }
    });
    let task = tokio::spawn(read_loop(reader, client.clone()));
    Connection {
        client,
        sessions: session_rx,
        task,
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        writer.write_all(&frame).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn read_loop<R>(mut reader: R, client: EdgeClient) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let result = read_frames(&mut reader, &client).await;
    let events = client.core.lock().await.on_connection_closed();
    client.deliver(events).await;
    result
}

async fn read_frames<R>(reader: &mut R, client: &EdgeClient) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            warn!("skipping empty frame");
            continue;
        }
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        let outcome = client.core.lock().await.on_message(&body);
        match outcome {
            Ok(events) => client.deliver(events).await,
            Err(e) => warn!(error = %e, "discarding envelope"),
        }
    }
}
