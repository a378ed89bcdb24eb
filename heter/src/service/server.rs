use std::{
    collections::HashSet,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use comms::{
    msg::{Msg, VarBatch},
    specs::{Command, RemoteErr, RemoteErrKind},
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream},
    runtime::{Handle, RuntimeFlavor},
    sync::watch,
    task::{self, JoinSet},
    time,
};
use tokio_util::sync::CancellationToken;

use super::{HandlerRegistry, RegistryBuilder, ServiceHandler};
use crate::error::{HeterErr, Result};

/// The lifecycle of a `HeterServer`, it only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Configured,
    Listening(SocketAddr),
    Stopped,
}

/// Configures a `HeterServer`, handlers can only be registered here.
#[derive(Default)]
pub struct ServerBuilder {
    endpoint: Option<String>,
    registry: RegistryBuilder,
    expected_workers: usize,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the `host:port` address to listen on, port 0 picks a free one.
    pub fn set_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Routes the requests of `channel` to `handler`.
    ///
    /// # Returns
    /// The builder back or a `Config` error if `channel` already has a handler.
    pub fn register_service_handler(
        mut self,
        channel: &str,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<Self> {
        self.registry.register(channel, handler)?;
        Ok(self)
    }

    /// Stops the server once `n` distinct trainers sent `StopWorker`, 0 never does.
    pub fn expected_workers(mut self, n: usize) -> Self {
        self.expected_workers = n;
        self
    }

    /// Builds the server.
    ///
    /// # Returns
    /// The server, ready to be started, or a `Config` error if no endpoint was set.
    pub fn build(self) -> Result<Arc<HeterServer>> {
        let endpoint = self
            .endpoint
            .ok_or_else(|| HeterErr::Config("the server has no endpoint".into()))?;

        Ok(Arc::new(HeterServer {
            endpoint,
            registry: self.registry.build(),
            expected_workers: self.expected_workers,
            stopped_trainers: Mutex::new(HashSet::new()),
            state: watch::Sender::new(ServerState::Configured),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }))
    }
}

/// What to do with a connection after answering a message.
enum Flow {
    Continue(Msg<'static>),
    Close(Msg<'static>),
    /// Reply, then stop the whole server.
    Shutdown(Msg<'static>),
}

/// Accepts connections from peer stages and routes their requests to the registered handlers.
pub struct HeterServer {
    endpoint: String,
    registry: HandlerRegistry,
    expected_workers: usize,
    stopped_trainers: Mutex<HashSet<u32>>,
    state: watch::Sender<ServerState>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl HeterServer {
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// The bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.state() {
            ServerState::Listening(addr) => Some(addr),
            _ => None,
        }
    }

    pub fn channels(&self) -> Vec<&str> {
        self.registry.channels()
    }

    /// Serves connections until `stop` is called.
    ///
    /// Every connection is served by its own task, handlers run on the runtime's
    /// blocking section so a multi threaded runtime is required.
    ///
    /// # Returns
    /// Once the listener was released and every connection task ended, or a `Stopped`
    /// error if the server was stopped before starting. A `Config` error is returned
    /// on a current-thread runtime, on a second start and when the endpoint can't be bound.
    pub async fn start_service(self: &Arc<Self>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(HeterErr::Stopped);
        }

        // Handlers run under `block_in_place`, which panics on a current-thread runtime.
        if Handle::current().runtime_flavor() == RuntimeFlavor::CurrentThread {
            return Err(HeterErr::Config(
                "the server needs a multi-threaded tokio runtime".into(),
            ));
        }

        if self.started.swap(true, Ordering::AcqRel) {
            return Err(HeterErr::Config("the server was already started".into()));
        }

        let listener = match TcpListener::bind(&self.endpoint).await {
            Ok(listener) => listener,
            Err(e) => {
                self.stop();
                return Err(HeterErr::Config(format!(
                    "can't listen on {}: {e}",
                    self.endpoint
                )));
            }
        };

        let addr = listener.local_addr()?;
        self.state.send_if_modified(|state| {
            let configured = *state == ServerState::Configured;
            if configured {
                *state = ServerState::Listening(addr);
            }
            configured
        });

        info!(channels = self.registry.channels().len(); "heter server listening on {addr}");

        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {peer}");
                        let server = Arc::clone(self);
                        tasks.spawn(async move { server.serve(stream, peer).await });
                    }
                    Err(e) => warn!("failed to accept a connection: {e}"),
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("connection ended with an error: {e}"),
                    Err(e) => warn!("connection task failed: {e}"),
                },
            }
        }

        drop(listener);
        tasks.shutdown().await;

        info!("heter server on {addr} stopped");
        Ok(())
    }

    /// Waits for the server to start listening.
    ///
    /// # Returns
    /// The bound address, a `Stopped` error if the server stopped instead, or a
    /// `Timeout` error once `timeout` elapses.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<SocketAddr> {
        let mut rx = self.state.subscribe();
        let ready = rx.wait_for(|state| *state != ServerState::Configured);

        let state = match time::timeout(timeout, ready).await {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => return Err(HeterErr::Stopped),
            Err(_) => {
                return Err(HeterErr::Timeout {
                    what: "waiting for the heter server to listen".into(),
                    after: timeout,
                });
            }
        };

        match state {
            ServerState::Listening(addr) => Ok(addr),
            _ => Err(HeterErr::Stopped),
        }
    }

    /// Stops the server, calling it again has no effect.
    pub fn stop(&self) {
        self.cancel.cancel();

        let stopped = self.state.send_if_modified(|state| {
            let running = *state != ServerState::Stopped;
            *state = ServerState::Stopped;
            running
        });

        if stopped {
            info!("heter server stop requested");
        }
    }

    async fn serve(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        stream.set_nodelay(true)?;
        let (rx, tx) = stream.into_split();
        let (mut rx, mut tx) = comms::channel(rx, tx);
        let mut buf = Vec::new();

        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = rx.recv_into::<Msg>(&mut buf) => received,
            };

            let flow = match received {
                Ok(msg) => self.dispatch(msg),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("{peer} closed the connection");
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    warn!("malformed message from {peer}: {e}");
                    Flow::Continue(Msg::Err(RemoteErr::new(
                        RemoteErrKind::Malformed,
                        e.to_string(),
                    )))
                }
                Err(e) => return Err(e),
            };

            match flow {
                Flow::Continue(reply) => tx.send(&reply).await?,
                Flow::Close(reply) => {
                    tx.send(&reply).await?;
                    break;
                }
                Flow::Shutdown(reply) => {
                    tx.send(&reply).await?;
                    self.stop();
                    break;
                }
            }
        }

        Ok(())
    }

    fn dispatch(&self, msg: Msg<'_>) -> Flow {
        match msg {
            Msg::Request(batch) => Flow::Continue(self.dispatch_request(&batch)),
            Msg::Control(command) => self.control(command),
            other => Flow::Continue(Msg::Err(RemoteErr::new(
                RemoteErrKind::Malformed,
                format!("a server doesn't take {} messages", other.kind_name()),
            ))),
        }
    }

    fn dispatch_request(&self, batch: &VarBatch<'_>) -> Msg<'static> {
        let header = &batch.header;

        let Some(handler) = self.registry.get(&header.channel) else {
            warn!(trainer_id = header.trainer_id; "request for unknown channel {}", header.channel);
            return Msg::Err(RemoteErr::new(
                RemoteErrKind::UnknownChannel,
                format!("no handler for channel `{}`", header.channel),
            ));
        };

        debug!(
            trainer_id = header.trainer_id,
            bytes = batch.data.len();
            "dispatching request on channel {}", header.channel
        );

        match task::block_in_place(|| handler.handle(batch)) {
            Ok(response) => Msg::Response(response),
            Err(e) => {
                warn!(trainer_id = header.trainer_id; "handler for {} failed: {e}", header.channel);
                Msg::Err(e.to_remote())
            }
        }
    }

    fn control(&self, command: Command) -> Flow {
        match command {
            Command::Ping => Flow::Continue(Msg::Control(Command::Pong)),
            Command::StopWorker { trainer_id } => {
                let reply = Msg::Control(Command::Ack);
                if self.stop_worker(trainer_id) {
                    Flow::Shutdown(reply)
                } else {
                    Flow::Continue(reply)
                }
            }
            Command::Disconnect => Flow::Close(Msg::Control(Command::Disconnect)),
            other => Flow::Continue(Msg::Err(RemoteErr::new(
                RemoteErrKind::Malformed,
                format!("unexpected command {other:?}"),
            ))),
        }
    }

    /// Records that `trainer_id` is done.
    ///
    /// # Returns
    /// Whether every expected trainer is done.
    fn stop_worker(&self, trainer_id: u32) -> bool {
        let stopped = {
            let mut trainers = self.stopped_trainers.lock();
            trainers.insert(trainer_id);
            trainers.len()
        };

        info!(trainer_id = trainer_id, stopped = stopped; "trainer asked to stop");
        self.expected_workers > 0 && stopped >= self.expected_workers
    }
}
