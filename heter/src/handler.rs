//! The handler serving plain variable exchanges between pipeline stages.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use comms::msg::VarBatch;
use log::debug;

use crate::{
    codec,
    device::DeviceContext,
    error::{HeterErr, Result},
    executor::Executor,
    scope::ScopeRegistry,
    service::ServiceHandler,
    task_queue::{TaskEntry, TaskQueue},
};

/// Lands incoming variables in the addressed scope and tells the training loop about it.
///
/// A request's mode may be mapped to a follow-up operator, whose outputs are sent back
/// as the response. Unmapped modes are answered with an empty acknowledgement.
pub struct SendAndRecvHandler {
    scopes: Arc<ScopeRegistry>,
    queue: Arc<TaskQueue>,
    ctx: Arc<dyn DeviceContext>,
    executor: Option<Arc<dyn Executor>>,
    ops: HashMap<String, String>,
    seq: AtomicU64,
}

impl SendAndRecvHandler {
    /// Creates a new `SendAndRecvHandler`.
    ///
    /// # Arguments
    /// * `scopes` - The scopes requests are resolved against.
    /// * `queue` - Where completions are announced, every served channel must be registered on it.
    /// * `ctx` - The context incoming variables are copied to.
    pub fn new(
        scopes: Arc<ScopeRegistry>,
        queue: Arc<TaskQueue>,
        ctx: Arc<dyn DeviceContext>,
    ) -> Self {
        Self {
            scopes,
            queue,
            ctx,
            executor: None,
            ops: HashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Runs operator `op` after landing every request of mode `mode`.
    pub fn on_mode(mut self, mode: impl Into<String>, op: impl Into<String>) -> Self {
        self.ops.insert(mode.into(), op.into());
        self
    }

    fn next_seq(&self, micro: Option<u64>) -> u64 {
        micro.unwrap_or_else(|| self.seq.fetch_add(1, Ordering::Relaxed))
    }
}

impl ServiceHandler for SendAndRecvHandler {
    fn handle(&self, request: &VarBatch<'_>) -> Result<VarBatch<'static>> {
        let header = &request.header;
        let scope = self
            .scopes
            .resolve(header.mini_batch_id, header.micro_batch_id)?;

        // Nothing lands unless its completion can be announced.
        let slot = self.queue.reserve(&header.channel)?;

        let landed = codec::deserialize(self.ctx.as_ref(), request, &scope)?;
        debug!(
            trainer_id = header.trainer_id,
            vars = landed.len();
            "landed request on channel {}", header.channel
        );

        let response = match self.ops.get(&header.mode) {
            Some(op) => {
                let executor = self.executor.as_ref().ok_or_else(|| {
                    HeterErr::Config(format!(
                        "mode `{}` runs operator `{op}` but there is no executor",
                        header.mode
                    ))
                })?;

                let outputs = executor.run_operator(&scope, op)?;
                codec::serialize(self.ctx.as_ref(), &scope, header.reply(), &outputs)?
            }
            None => VarBatch::ack(header),
        };

        let seq = self.next_seq(header.micro_batch_id);
        slot.fill(TaskEntry::new(&header.channel, seq));

        Ok(response)
    }
}
