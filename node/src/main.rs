use std::{env, io, sync::Arc, thread};

use heter::{
    HeterConfig, HostContext, QueueErr, ScopeRegistry, SendAndRecvHandler, ServerBuilder,
    ServiceHandler, TaskQueue,
};
use log::{debug, info, warn};
use tokio::signal;

const CONFIG_VAR: &str = "HETER_CONFIG";

/// Pops every completion of `channel` until the queue is closed.
fn drain(queue: &TaskQueue, channel: &str) {
    loop {
        match queue.pop(channel) {
            Ok(entry) => debug!(seq = entry.seq; "request landed on channel {channel}"),
            Err(QueueErr::Closed(_)) => break,
            Err(e) => {
                warn!("stopped draining {channel}: {e}");
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let path = env::args()
        .nth(1)
        .or_else(|| env::var(CONFIG_VAR).ok())
        .ok_or_else(|| io::Error::other(format!("usage: node <config.json>, or set {CONFIG_VAR}")))?;

    let mut config = HeterConfig::from_path(&path)?;
    config.apply_env();

    let scopes = Arc::new(ScopeRegistry::default());
    if config.micro_batches > 0 {
        scopes.create_micro_batches(0, config.micro_batches);
    }

    let queue = Arc::new(TaskQueue::new(config.queue_capacity));
    let handler: Arc<dyn ServiceHandler> = Arc::new(SendAndRecvHandler::new(
        scopes,
        queue.clone(),
        Arc::new(HostContext),
    ));

    let mut builder = ServerBuilder::new()
        .set_endpoint(&config.endpoint)
        .expected_workers(config.expected_workers);

    for channel in &config.channels {
        queue.register(channel);
        builder = builder.register_service_handler(channel, handler.clone())?;
    }

    let server = builder.build()?;

    let consumers: Vec<_> = config
        .channels
        .iter()
        .cloned()
        .map(|channel| {
            let queue = queue.clone();
            thread::spawn(move || drain(&queue, &channel))
        })
        .collect();

    let mut serving = tokio::spawn({
        let server = server.clone();
        async move { server.start_service().await }
    });

    let addr = server.wait_until_ready(config.ready_timeout()).await?;
    info!("serving {} channel(s) at {addr}", config.channels.len());

    tokio::select! {
        ret = &mut serving => {
            ret.map_err(io::Error::other)??;
            info!("every expected trainer is done, wrapping up");
        }
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, stopping");
            server.stop();
            serving.await.map_err(io::Error::other)??;
        }
    }

    queue.close_all();
    for consumer in consumers {
        if consumer.join().is_err() {
            warn!("a queue consumer panicked");
        }
    }

    Ok(())
}
