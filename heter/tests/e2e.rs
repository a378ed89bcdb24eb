use std::{net::SocketAddr, sync::Arc, time::Duration};

use comms::{
    msg::{Msg, VarBatch},
    specs::{BACKWARD, BatchHeader, Command, RemoteErrKind},
};
use heter::{
    ClientRegistry, DeviceContext, HeterClient, HeterErr, HeterServer, HostContext, Place,
    RetryPolicy, Scope, ScopeRegistry, SendAndRecvHandler, SendAndRecvOp, ServerBuilder,
    ServerState, ServiceHandler, SimDevice, SparseRows, TaskEntry, TaskQueue, Tensor, VarKind,
    Variable, codec,
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    task::{self, JoinHandle},
    time,
};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Stage {
    server: Arc<HeterServer>,
    addr: SocketAddr,
    serving: JoinHandle<heter::Result<()>>,
}

impl Stage {
    fn endpoint(&self) -> String {
        self.addr.to_string()
    }
}

async fn start_stage(
    handler: Arc<dyn ServiceHandler>,
    channels: &[&str],
    expected_workers: usize,
) -> Stage {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut builder = ServerBuilder::new()
        .set_endpoint("127.0.0.1:0")
        .expected_workers(expected_workers);

    for channel in channels {
        builder = builder
            .register_service_handler(channel, handler.clone())
            .unwrap();
    }

    let server = builder.build().unwrap();
    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.start_service().await }
    });

    let addr = server.wait_until_ready(TIMEOUT).await.unwrap();

    Stage {
        server,
        addr,
        serving,
    }
}

struct Landing {
    scopes: Arc<ScopeRegistry>,
    queue: Arc<TaskQueue>,
}

fn landing(channels: &[&str]) -> Landing {
    let scopes = Arc::new(ScopeRegistry::default());
    scopes.create_micro_batches(0, 4);

    let queue = Arc::new(TaskQueue::default());
    for channel in channels {
        queue.register(channel);
    }

    Landing { scopes, queue }
}

async fn pop(queue: &Arc<TaskQueue>, channel: &'static str) -> TaskEntry {
    let queue = queue.clone();
    task::spawn_blocking(move || queue.pop_timeout(channel, TIMEOUT))
        .await
        .unwrap()
        .unwrap()
}

fn client(endpoint: &str, trainer_id: u32) -> HeterClient {
    HeterClient::new(
        vec![endpoint.to_string()],
        Vec::new(),
        trainer_id,
        RetryPolicy::default(),
    )
}

fn batch_of(name: &str, values: &[f32], header: BatchHeader) -> VarBatch<'static> {
    let scope = Scope::root();
    let shape = vec![1, values.len() as i64];
    scope
        .var(name)
        .set(Variable::Dense(Tensor::from_slice(shape, values)));

    codec::serialize(&HostContext, &scope, header, &[name]).unwrap()
}

fn dense_values(scope: &Scope, name: &str) -> Vec<f32> {
    let handle = scope.find(name).unwrap();
    let var = handle.read();
    var.as_dense().unwrap().to_vec().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_lands_in_micro_scope_and_is_popped() {
    let Landing { scopes, queue } = landing(&["x"]);
    let handler = SendAndRecvHandler::new(scopes.clone(), queue.clone(), Arc::new(HostContext));
    let stage = start_stage(Arc::new(handler), &["x"], 0).await;

    let values: Vec<f32> = (0..10).map(|i| i as f32 / 3.0).collect();
    let header = BatchHeader::new("x", 0).with_mini_batch(0).with_micro_batch(0);
    let request = batch_of("x", &values, header);

    let response = client(&stage.endpoint(), 0)
        .send(&stage.endpoint(), &request, TIMEOUT)
        .await
        .unwrap();
    assert!(response.header.vars.is_empty());

    assert_eq!(pop(&queue, "x").await, TaskEntry::new("x", 0));

    let micro = scopes.micro_batch(0, 0).unwrap();
    assert_eq!(dense_values(&micro, "x"), values);

    stage.server.stop();
    stage.serving.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequential_sends_pop_in_send_order() {
    let Landing { scopes, queue } = landing(&["x"]);
    let handler = SendAndRecvHandler::new(scopes, queue.clone(), Arc::new(HostContext));
    let stage = start_stage(Arc::new(handler), &["x"], 0).await;
    let client = client(&stage.endpoint(), 0);

    for micro in [1, 2] {
        let header = BatchHeader::new("x", 0).with_mini_batch(0).with_micro_batch(micro);
        client
            .send(&stage.endpoint(), &batch_of("x", &[micro as f32], header), TIMEOUT)
            .await
            .unwrap();
    }

    assert_eq!(pop(&queue, "x").await.seq, 1);
    assert_eq!(pop(&queue, "x").await.seq, 2);

    stage.server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_channel_is_rejected_and_the_connection_survives() {
    let Landing { scopes, queue } = landing(&["x"]);
    let handler = SendAndRecvHandler::new(scopes, queue.clone(), Arc::new(HostContext));
    let stage = start_stage(Arc::new(handler), &["x"], 0).await;
    let endpoint = stage.endpoint();
    let client = client(&endpoint, 0);

    let err = client
        .send(&endpoint, &batch_of("y", &[1.0], BatchHeader::new("y", 0)), TIMEOUT)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        HeterErr::Protocol {
            kind: RemoteErrKind::UnknownChannel,
            ..
        }
    ));
    assert!(!err.is_transient());
    assert_eq!(client.idle_connections(&endpoint), 1);

    client
        .send(&endpoint, &batch_of("x", &[1.0], BatchHeader::new("x", 0)), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(client.idle_connections(&endpoint), 1);
    assert_eq!(pop(&queue, "x").await.channel, "x");
    assert_eq!(queue.len("x").unwrap(), 0);

    stage.server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_frames_get_an_error_reply() {
    let Landing { scopes, queue } = landing(&["x"]);
    let handler = SendAndRecvHandler::new(scopes, queue, Arc::new(HostContext));
    let stage = start_stage(Arc::new(handler), &["x"], 0).await;

    let mut stream = TcpStream::connect(stage.addr).await.unwrap();

    // A request frame whose header claims more bytes than the frame carries.
    let body = [0, 0, 0, 2, 0, 0, 0, 99, b'{'];
    stream
        .write_all(&(body.len() as u64).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(&body).await.unwrap();

    let (rx, tx) = stream.into_split();
    let (mut rx, mut tx) = comms::channel(rx, tx);
    let mut buf = Vec::new();

    let reply: Msg = rx.recv_into(&mut buf).await.unwrap();
    let Msg::Err(remote) = reply else {
        panic!("expected an error reply, got {reply:?}");
    };
    assert_eq!(remote.kind, RemoteErrKind::Malformed);

    tx.send(&Msg::Control(Command::Ping)).await.unwrap();
    let reply: Msg = rx.recv_into(&mut buf).await.unwrap();
    assert_eq!(reply, Msg::Control(Command::Pong));

    stage.server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_sends_all_land() {
    const SENDS: u32 = 8;

    let Landing { scopes, queue } = landing(&["x"]);
    let handler = SendAndRecvHandler::new(scopes, queue.clone(), Arc::new(HostContext));
    let stage = start_stage(Arc::new(handler), &["x"], 0).await;

    let registry = ClientRegistry::new(RetryPolicy::default());
    let endpoints = vec![stage.endpoint()];

    let sends = (0..SENDS).map(|trainer_id| {
        let client = registry.get_or_create(&endpoints, &[], trainer_id);
        let endpoint = stage.endpoint();

        async move {
            let header = BatchHeader::new("x", trainer_id);
            let name = format!("x{trainer_id}");
            client
                .send(&endpoint, &batch_of(&name, &[trainer_id as f32], header), TIMEOUT)
                .await
        }
    });

    for res in futures::future::join_all(sends).await {
        res.unwrap();
    }

    let mut seqs = Vec::new();
    for _ in 0..SENDS {
        seqs.push(pop(&queue, "x").await.seq);
    }
    seqs.sort_unstable();
    assert_eq!(seqs, (0..SENDS as u64).collect::<Vec<_>>());

    stage.server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_server_refuses_to_restart() {
    let Landing { scopes, queue } = landing(&["x"]);
    let handler = SendAndRecvHandler::new(scopes, queue, Arc::new(HostContext));
    let stage = start_stage(Arc::new(handler), &["x"], 0).await;

    stage.server.stop();
    time::timeout(TIMEOUT, stage.serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    stage.server.stop();
    assert_eq!(stage.server.state(), ServerState::Stopped);

    let waited = time::timeout(
        Duration::from_millis(100),
        stage.server.wait_until_ready(TIMEOUT),
    )
    .await
    .unwrap();
    assert!(matches!(waited, Err(HeterErr::Stopped)));

    assert!(matches!(
        stage.server.start_service().await,
        Err(HeterErr::Stopped)
    ));

    let refused = TcpStream::connect(stage.addr).await;
    assert!(refused.is_err());
}

#[tokio::test]
async fn retries_against_a_dead_port_are_exhausted() {
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };

    let retry = RetryPolicy {
        max_retries: 2,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
        connect_timeout: Duration::from_millis(500),
    };
    let client = HeterClient::new(vec![dead.clone()], Vec::new(), 0, retry);

    let err = client
        .send(&dead, &batch_of("x", &[1.0], BatchHeader::new("x", 0)), TIMEOUT)
        .await
        .unwrap_err();

    assert!(err.is_transient());
    let HeterErr::Transient { attempts, .. } = err else {
        panic!("expected a transient error, got {err}");
    };
    assert_eq!(attempts, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_expected_trainer_stopping_stops_the_server() {
    let Landing { scopes, queue } = landing(&["x"]);
    let handler = SendAndRecvHandler::new(scopes, queue, Arc::new(HostContext));
    let stage = start_stage(Arc::new(handler), &["x"], 2).await;
    let endpoint = stage.endpoint();

    client(&endpoint, 0).ping(&endpoint, TIMEOUT).await.unwrap();

    client(&endpoint, 0).stop_heter_worker(TIMEOUT).await.unwrap();
    client(&endpoint, 0).stop_heter_worker(TIMEOUT).await.unwrap();
    assert!(matches!(stage.server.state(), ServerState::Listening(_)));

    client(&endpoint, 1).stop_heter_worker(TIMEOUT).await.unwrap();

    time::timeout(TIMEOUT, stage.serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stage.server.state(), ServerState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn variables_land_on_the_device() {
    let Landing { scopes, queue } = landing(&["x"]);
    let dev = Arc::new(SimDevice::new(0));
    let handler = SendAndRecvHandler::new(scopes.clone(), queue.clone(), dev.clone());
    let stage = start_stage(Arc::new(handler), &["x"], 0).await;

    let values = [0.5f32, -1.0, 2.5e-3];
    let header = BatchHeader::new("x", 0).with_mini_batch(0).with_micro_batch(3);
    let request = batch_of("x", &values, header);

    client(&stage.endpoint(), 0)
        .send(&stage.endpoint(), &request, TIMEOUT)
        .await
        .unwrap();
    pop(&queue, "x").await;

    assert_eq!(dev.pending(), 0);

    let micro = scopes.micro_batch(0, 3).unwrap();
    let place = micro.find("x").unwrap().read().as_dense().unwrap().place();
    assert_eq!(place, Place::Device(0));

    let back = codec::serialize(dev.as_ref(), &micro, BatchHeader::new("x", 0), &["x"]).unwrap();
    assert_eq!(back.data, request.data);

    stage.server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backward_requests_run_the_follow_up_operator() {
    let Landing { scopes, queue } = landing(&["grad"]);

    let executor = |scope: &Arc<Scope>, op: &str| -> heter::Result<Vec<String>> {
        assert_eq!(op, "scale");
        let scaled: Vec<f32> = dense_values(scope, "g").iter().map(|v| v * 10.0).collect();
        let shape = vec![1, scaled.len() as i64];
        scope
            .var("g@OUT")
            .set(Variable::Dense(Tensor::from_slice(shape, &scaled)));
        Ok(vec!["g@OUT".to_string()])
    };

    let handler = SendAndRecvHandler::new(scopes, queue.clone(), Arc::new(HostContext))
        .with_executor(Arc::new(executor))
        .on_mode(BACKWARD, "scale");
    let stage = start_stage(Arc::new(handler), &["grad"], 0).await;

    let registry = ClientRegistry::new(RetryPolicy::default());
    let client = registry.get_or_create(&[], &[stage.endpoint()], 0);

    let trainer_scope = Scope::root();
    trainer_scope
        .var("g")
        .set(Variable::Dense(Tensor::from_slice(vec![1, 2], &[1.0f32, 2.0])));

    let op = SendAndRecvOp::new("grad")
        .with_mode(BACKWARD)
        .with_mini_batch(0)
        .with_micro_batch(2)
        .with_send_vars(["g"])
        .with_recv_vars(["g@OUT"]);

    let ctx: &dyn DeviceContext = &HostContext;
    let landed = client
        .send_and_recv(ctx, &trainer_scope, &op, TIMEOUT)
        .await
        .unwrap();

    assert_eq!(landed, ["g@OUT"]);
    assert_eq!(dense_values(&trainer_scope, "g@OUT"), [10.0, 20.0]);
    assert_eq!(pop(&queue, "grad").await, TaskEntry::new("grad", 2));

    let missing = op.clone().with_recv_vars(["nope"]);
    let err = client
        .send_and_recv(ctx, &trainer_scope, &missing, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, HeterErr::Protocol { .. }));

    stage.server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kind_conflict_is_refused_without_landing() {
    let Landing { scopes, queue } = landing(&["x"]);
    let value = Tensor::from_slice(vec![1, 2], &[1.0f32, 2.0]);
    scopes
        .root()
        .var("x")
        .set(Variable::SparseRows(SparseRows::new(8, vec![3], value)));

    let handler = SendAndRecvHandler::new(scopes.clone(), queue.clone(), Arc::new(HostContext));
    let stage = start_stage(Arc::new(handler), &["x"], 0).await;
    let endpoint = stage.endpoint();
    let client = client(&endpoint, 0);

    let err = client
        .send(&endpoint, &batch_of("x", &[1.0, 2.0], BatchHeader::new("x", 0)), TIMEOUT)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        HeterErr::Protocol {
            kind: RemoteErrKind::TypeConflict,
            ..
        }
    ));
    assert!(!err.is_transient());
    assert_eq!(client.idle_connections(&endpoint), 1);
    assert_eq!(queue.len("x").unwrap(), 0);

    let held = scopes.root().find_local("x").unwrap();
    assert_eq!(held.kind(), Some(VarKind::SparseRows));

    stage.server.stop();
    stage.serving.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_wakes_a_pending_wait_until_ready() {
    let server = ServerBuilder::new()
        .set_endpoint("127.0.0.1:0")
        .build()
        .unwrap();

    let waiting = tokio::spawn({
        let server = server.clone();
        async move { server.wait_until_ready(TIMEOUT).await }
    });

    time::sleep(Duration::from_millis(50)).await;
    server.stop();

    let res = time::timeout(Duration::from_secs(1), waiting)
        .await
        .expect("wait_until_ready should return once stopped")
        .unwrap();
    assert!(matches!(res, Err(HeterErr::Stopped)));
    assert_eq!(server.state(), ServerState::Stopped);
}
