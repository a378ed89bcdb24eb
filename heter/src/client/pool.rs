use std::{collections::HashMap, io, time::Duration};

use comms::{OnoReceiver, OnoSender};
use log::debug;
use parking_lot::Mutex;
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time,
};

/// An open connection to a server along with its receive buffer.
pub(super) struct Connection {
    pub rx: OnoReceiver<OwnedReadHalf>,
    pub tx: OnoSender<OwnedWriteHalf>,
    pub buf: Vec<u8>,
}

impl Connection {
    /// Connects to `endpoint`.
    ///
    /// # Returns
    /// The connection or an `io::ErrorKind::TimedOut` error after `timeout`.
    pub async fn connect(endpoint: &str, timeout: Duration) -> io::Result<Self> {
        let stream = time::timeout(timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {endpoint} took over {timeout:?}"),
                )
            })??;

        stream.set_nodelay(true)?;
        debug!("connected to {endpoint}");

        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx);

        Ok(Self {
            rx,
            tx,
            buf: Vec::new(),
        })
    }
}

/// Idle connections per endpoint.
///
/// A connection is taken out for the whole duration of a request, so concurrent
/// requests to one endpoint each get their own connection.
#[derive(Default)]
pub(super) struct ConnectionPool {
    idle: Mutex<HashMap<String, Vec<Connection>>>,
}

impl ConnectionPool {
    pub fn take(&self, endpoint: &str) -> Option<Connection> {
        self.idle.lock().get_mut(endpoint)?.pop()
    }

    pub fn put(&self, endpoint: &str, conn: Connection) {
        self.idle
            .lock()
            .entry(endpoint.to_string())
            .or_default()
            .push(conn);
    }

    pub fn idle(&self, endpoint: &str) -> usize {
        self.idle.lock().get(endpoint).map_or(0, Vec::len)
    }
}
