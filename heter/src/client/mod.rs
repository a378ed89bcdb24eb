//! The requesting side: sends variable batches to peer stages and waits for their replies.

mod pool;
mod registry;
mod retry;

use std::{io, time::Duration};

use comms::{
    msg::{Msg, VarBatch},
    specs::{BACKWARD, BatchHeader, Command, FORWARD},
};
use futures::future;
use log::{debug, warn};
use tokio::time;

pub use registry::ClientRegistry;
pub use retry::RetryPolicy;

use crate::{
    codec,
    device::DeviceContext,
    error::{HeterErr, Result},
    scope::Scope,
};
use pool::{Connection, ConnectionPool};

/// Where an exchange failed, only failures before the request was fully written are retried.
enum Failure {
    BeforeWrite(io::Error),
    AfterWrite(io::Error),
}

/// One exchange performed by `HeterClient::send_and_recv`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendAndRecvOp {
    pub channel: String,
    pub mode: String,
    pub send_vars: Vec<String>,
    /// Variables the response must carry.
    pub recv_vars: Vec<String>,
    pub mini_batch_id: Option<u64>,
    pub micro_batch_id: Option<u64>,
}

impl SendAndRecvOp {
    /// Creates a `forward` exchange on `channel` addressed to the root scope.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            mode: FORWARD.to_string(),
            send_vars: Vec::new(),
            recv_vars: Vec::new(),
            mini_batch_id: None,
            micro_batch_id: None,
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn with_send_vars<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.send_vars = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_recv_vars<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.recv_vars = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mini_batch(mut self, id: u64) -> Self {
        self.mini_batch_id = Some(id);
        self
    }

    pub fn with_micro_batch(mut self, id: u64) -> Self {
        self.micro_batch_id = Some(id);
        self
    }

    fn header(&self, trainer_id: u32) -> BatchHeader {
        BatchHeader {
            channel: self.channel.clone(),
            trainer_id,
            mini_batch_id: self.mini_batch_id,
            micro_batch_id: self.micro_batch_id,
            mode: self.mode.clone(),
            vars: Vec::new(),
        }
    }
}

/// A trainer's handle on the stages before and after it.
pub struct HeterClient {
    next: Vec<String>,
    previous: Vec<String>,
    trainer_id: u32,
    retry: RetryPolicy,
    pool: ConnectionPool,
}

impl HeterClient {
    /// Creates a new `HeterClient`, prefer `ClientRegistry::get_or_create`.
    ///
    /// # Arguments
    /// * `next` - The servers of the next stage.
    /// * `previous` - The servers of the previous stage.
    /// * `trainer_id` - The id of the calling trainer, picks the server within a stage.
    /// * `retry` - The retry policy.
    pub fn new(next: Vec<String>, previous: Vec<String>, trainer_id: u32, retry: RetryPolicy) -> Self {
        Self {
            next,
            previous,
            trainer_id,
            retry,
            pool: ConnectionPool::default(),
        }
    }

    pub fn trainer_id(&self) -> u32 {
        self.trainer_id
    }

    pub fn next_endpoints(&self) -> &[String] {
        &self.next
    }

    pub fn previous_endpoints(&self) -> &[String] {
        &self.previous
    }

    /// The amount of idle pooled connections to `endpoint`.
    pub fn idle_connections(&self, endpoint: &str) -> usize {
        self.pool.idle(endpoint)
    }

    /// Picks the server for a request of `mode`.
    ///
    /// `backward` requests go to the previous stage, anything else to the next one.
    /// Within a stage the server is picked by trainer id.
    ///
    /// # Returns
    /// The endpoint or a `Config` error when the stage has no servers.
    pub fn route(&self, mode: &str) -> Result<&str> {
        let (stage, endpoints) = match mode {
            BACKWARD => ("previous", &self.previous),
            _ => ("next", &self.next),
        };

        if endpoints.is_empty() {
            return Err(HeterErr::Config(format!(
                "no {stage} stage endpoints to route a `{mode}` request to"
            )));
        }

        let index = self.trainer_id as usize % endpoints.len();
        Ok(&endpoints[index])
    }

    /// Sends `batch` to `endpoint` and waits for the remote handler to reply.
    ///
    /// # Arguments
    /// * `endpoint` - The `host:port` of the server.
    /// * `batch` - The request.
    /// * `timeout` - The deadline for the whole exchange, retries included.
    ///
    /// # Returns
    /// The response batch, or a `Protocol` error if the server rejected the request,
    /// a `Transient` error if the connection failed, or a `Timeout` error.
    pub async fn send(
        &self,
        endpoint: &str,
        batch: &VarBatch<'_>,
        timeout: Duration,
    ) -> Result<VarBatch<'static>> {
        let msg = Msg::Request(VarBatch::new(batch.header.clone(), &*batch.data));
        let what = || format!("request on channel {} to {endpoint}", batch.header.channel);

        match self.exchange_within(endpoint, &msg, timeout, what).await? {
            Msg::Response(response) => Ok(response),
            Msg::Err(remote) => Err(remote.into()),
            other => Err(HeterErr::malformed(format!(
                "expected a response from {endpoint}, got a {} message",
                other.kind_name()
            ))),
        }
    }

    /// Serializes the `send_vars` of `op` out of `scope`, sends them to the stage `op.mode`
    /// routes to and lands the response in `scope`.
    ///
    /// # Returns
    /// The names of the received variables, or a `Protocol` error if one of `op.recv_vars`
    /// is missing from the response.
    pub async fn send_and_recv(
        &self,
        ctx: &dyn DeviceContext,
        scope: &Scope,
        op: &SendAndRecvOp,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let endpoint = self.route(&op.mode)?;
        let request = codec::serialize(ctx, scope, op.header(self.trainer_id), &op.send_vars)?;

        let response = self.send(endpoint, &request, timeout).await?;
        let landed = codec::deserialize(ctx, &response, scope)?;

        if let Some(missing) = op.recv_vars.iter().find(|name| !landed.contains(*name)) {
            return Err(HeterErr::malformed(format!(
                "the response on channel {} doesn't carry `{missing}`",
                op.channel
            )));
        }

        debug!(trainer_id = self.trainer_id, vars = landed.len(); "received response from {endpoint}");
        Ok(landed)
    }

    /// Checks that `endpoint` answers.
    pub async fn ping(&self, endpoint: &str, timeout: Duration) -> Result<()> {
        let what = || format!("ping to {endpoint}");
        let reply = self
            .exchange_within(endpoint, &Msg::Control(Command::Ping), timeout, what)
            .await?;

        match reply {
            Msg::Control(Command::Pong) => Ok(()),
            other => Err(unexpected_reply(endpoint, &other)),
        }
    }

    /// Tells every server of the next stage that this trainer is done.
    pub async fn stop_heter_worker(&self, timeout: Duration) -> Result<()> {
        let msg = Msg::Control(Command::StopWorker {
            trainer_id: self.trainer_id,
        });

        let futs = self.next.iter().map(async |endpoint| -> Result<()> {
            let what = || format!("stop request to {endpoint}");
            match self.exchange_within(endpoint, &msg, timeout, what).await? {
                Msg::Control(Command::Ack) => Ok(()),
                other => Err(unexpected_reply(endpoint, &other)),
            }
        });

        future::try_join_all(futs).await?;
        Ok(())
    }

    async fn exchange_within(
        &self,
        endpoint: &str,
        msg: &Msg<'_>,
        timeout: Duration,
        what: impl FnOnce() -> String,
    ) -> Result<Msg<'static>> {
        time::timeout(timeout, self.exchange(endpoint, msg))
            .await
            .map_err(|_| HeterErr::Timeout {
                what: what(),
                after: timeout,
            })?
    }

    async fn exchange(&self, endpoint: &str, msg: &Msg<'_>) -> Result<Msg<'static>> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            let source = match self.try_exchange(endpoint, msg).await {
                Ok(reply) => return Ok(reply),
                Err(Failure::BeforeWrite(e)) if attempts <= self.retry.max_retries => {
                    let delay = self.retry.backoff(attempts);
                    warn!(attempts = attempts; "failed to reach {endpoint}: {e}, retrying in {delay:?}");
                    time::sleep(delay).await;
                    continue;
                }
                Err(Failure::BeforeWrite(e) | Failure::AfterWrite(e)) => e,
            };

            return Err(HeterErr::Transient {
                endpoint: endpoint.to_string(),
                attempts,
                source,
            });
        }
    }

    async fn try_exchange(&self, endpoint: &str, msg: &Msg<'_>) -> std::result::Result<Msg<'static>, Failure> {
        let mut conn = match self.pool.take(endpoint) {
            Some(conn) => conn,
            None => Connection::connect(endpoint, self.retry.connect_timeout)
                .await
                .map_err(Failure::BeforeWrite)?,
        };

        conn.tx.send(msg).await.map_err(Failure::BeforeWrite)?;

        let reply = conn
            .rx
            .recv_into::<Msg>(&mut conn.buf)
            .await
            .map_err(Failure::AfterWrite)?
            .into_owned();

        self.pool.put(endpoint, conn);
        Ok(reply)
    }
}

fn unexpected_reply(endpoint: &str, msg: &Msg<'_>) -> HeterErr {
    match msg {
        Msg::Err(remote) => remote.clone().into(),
        other => HeterErr::malformed(format!(
            "unexpected {} reply from {endpoint}",
            other.kind_name()
        )),
    }
}
