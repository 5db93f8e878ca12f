//! End-to-end tests over real TCP connections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use zelana_config::OrderSession;
use zelana_coordinator::coordinator::{Manager, ManagerConfig};
use zelana_coordinator::server::{ServerConfig, WorkerServer};
use zelana_coordinator::store::{MemoryTaskStore, TaskId, TaskStatus, TaskStore};
use zelana_coordinator::verifier::ProofVerifier;
use zelana_keypair::Keypair;
use zephyr::{
    AuthEnvelope, BlockTrace, Frame, FrameCodec, ProofMsg, ProtocolError, TaskMsg, WorkerClient,
    WorkerIdentity,
};

/// Accepts every proof, counting calls and noting the task status it saw.
struct RecordingVerifier {
    store: Arc<MemoryTaskStore>,
    calls: AtomicUsize,
    seen: Mutex<Vec<TaskStatus>>,
}

#[async_trait]
impl ProofVerifier for RecordingVerifier {
    async fn verify(&self, task_id: TaskId, _proof: &[u8]) -> anyhow::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.store.get_task(task_id)? {
            self.seen.lock().unwrap().push(task.status);
        }
        Ok(true)
    }
}

struct Harness {
    addr: String,
    manager: Arc<Manager>,
    store: Arc<MemoryTaskStore>,
    verifier: Arc<RecordingVerifier>,
    shutdown: CancellationToken,
}

impl Harness {
    async fn start(collection_time: Duration, reconnect_cooldown: Duration) -> Self {
        Self::start_with(collection_time, reconnect_cooldown, Duration::from_secs(60)).await
    }

    async fn start_with(
        collection_time: Duration,
        reconnect_cooldown: Duration,
        pong_wait: Duration,
    ) -> Self {
        let store = Arc::new(MemoryTaskStore::new());
        let verifier = Arc::new(RecordingVerifier {
            store: Arc::clone(&store),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let manager = Manager::new(
            ManagerConfig {
                dispatch_interval: Duration::from_millis(50),
                collection_time,
                order_session: OrderSession::Asc,
                worker_channel_capacity: 4,
                reconnect_cooldown,
                max_failed_sessions: 64,
            },
            store.clone(),
            verifier.clone(),
        );
        manager.start().unwrap();

        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".into(),
            handshake_timeout: Duration::from_secs(2),
            pong_wait,
            ..ServerConfig::default()
        };
        let server = WorkerServer::bind(config, Arc::clone(&manager)).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let shutdown = server.shutdown_token();
        tokio::spawn(server.run());

        Self {
            addr,
            manager,
            store,
            verifier,
            shutdown,
        }
    }

    async fn connect(&self, seed: u8) -> WorkerClient {
        let keypair = Keypair::from_seed(&[seed; 32]);
        WorkerClient::connect(&self.addr, &keypair, &format!("prover-{seed}"), "v0.1.0")
            .await
            .unwrap()
    }

    fn enqueue(&self) -> TaskId {
        self.store
            .insert_task(vec![BlockTrace {
                number: 100,
                hash: "0xabc".into(),
                trace: serde_json::json!({"txs": 3}),
            }])
            .unwrap()
    }

    fn status(&self, id: TaskId) -> TaskStatus {
        self.store.get_task(id).unwrap().unwrap().status
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.manager.stop().await;
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn next_task_within(client: &mut WorkerClient, wait: Duration) -> Option<TaskMsg> {
    tokio::time::timeout(wait, client.next_task())
        .await
        .ok()
        .and_then(|r| r.unwrap())
}

#[tokio::test]
async fn test_handshake_registers_worker() {
    let h = Harness::start(Duration::from_secs(60), Duration::from_secs(60)).await;
    let client = h.connect(1).await;

    wait_until("registration", || h.manager.worker_count() == 1).await;
    let workers = h.manager.list_workers();
    assert_eq!(workers[0].name, "prover-1");
    assert_eq!(workers[0].version, "v0.1.0");
    assert_eq!(workers[0].public_key, client.pubkey());
    assert!(workers[0].active_session.is_none());
    assert_eq!(h.manager.idle_worker_count(), 1);

    h.stop().await;
}

#[tokio::test]
async fn test_tampered_signature_is_never_registered() {
    let h = Harness::start(Duration::from_secs(60), Duration::from_secs(60)).await;

    let keypair = Keypair::from_seed(&[9; 32]);
    let identity = WorkerIdentity::new("honest", keypair.pubkey(), "v0.1.0");
    let mut envelope = AuthEnvelope::sign(identity, &keypair).unwrap();
    envelope.identity.name = "impostor".into();

    let mut client = WorkerClient::connect_with_envelope(&h.addr, envelope)
        .await
        .unwrap();
    let err = client.next_task().await.unwrap_err();
    assert!(matches!(err, ProtocolError::Rejected(_)));
    assert_eq!(h.manager.worker_count(), 0);

    h.stop().await;
}

#[tokio::test]
async fn test_reconnect_within_cooldown_is_refused() {
    let h = Harness::start(Duration::from_secs(60), Duration::from_secs(60)).await;
    let mut first = h.connect(2).await;
    wait_until("registration", || h.manager.worker_count() == 1).await;

    let mut second = h.connect(2).await;
    match second.next_task().await {
        Err(ProtocolError::Rejected(msg)) => assert!(msg.contains("cooldown")),
        other => panic!("expected rejection, got {other:?}"),
    }

    // The original channel still delivers.
    let id = h.enqueue();
    let task = next_task_within(&mut first, Duration::from_secs(2)).await.unwrap();
    assert_eq!(task.id, id);

    h.stop().await;
}

#[tokio::test]
async fn test_two_workers_one_task_end_to_end() {
    let h = Harness::start(Duration::from_millis(1500), Duration::from_secs(60)).await;
    let a = h.connect(3).await;
    let b = h.connect(4).await;
    wait_until("both workers", || h.manager.idle_worker_count() == 2).await;

    let id = h.enqueue();
    assert_eq!(h.status(id), TaskStatus::Unassigned);

    let wait = Duration::from_millis(800);
    let take = |mut c: WorkerClient| async move {
        let task = next_task_within(&mut c, wait).await;
        (c, task)
    };
    let ((a, task_a), (b, task_b)) = tokio::join!(take(a), take(b));
    let (mut prover, task) = match (task_a, task_b) {
        (Some(t), None) => (a, t),
        (None, Some(t)) => (b, t),
        other => panic!("expected exactly one assignment, got {other:?}"),
    };
    assert_eq!(task.id, id);
    assert_eq!(task.traces[0].number, 100);

    assert_eq!(h.status(id), TaskStatus::Assigned);
    assert_eq!(h.manager.idle_worker_count(), 1);
    let info = h.manager.get_session_info(id).unwrap();
    assert_eq!(info.status, "Assigned");
    assert_eq!(info.assigned_worker_names.len(), 1);

    let accepted = prover.submit_proof(ProofMsg::ok(id, vec![0xde, 0xad])).await.unwrap();
    assert!(accepted);
    assert_eq!(h.status(id), TaskStatus::Verified);
    assert_eq!(*h.verifier.seen.lock().unwrap(), vec![TaskStatus::Proved]);
    assert_eq!(h.store.get_proof(id).unwrap().unwrap().proof, vec![0xde, 0xad]);

    wait_until("collection", || !h.manager.has_session(id)).await;
    assert!(h.manager.get_session_info(id).is_none());
    assert_eq!(h.status(id), TaskStatus::Verified);

    h.stop().await;
}

#[tokio::test]
async fn test_silent_worker_times_out_to_failed() {
    let h = Harness::start(Duration::from_millis(300), Duration::from_secs(60)).await;
    let mut client = h.connect(5).await;
    wait_until("registration", || h.manager.worker_count() == 1).await;

    let id = h.enqueue();
    let task = next_task_within(&mut client, Duration::from_secs(2)).await.unwrap();
    assert_eq!(task.id, id);

    wait_until("timeout", || h.status(id) == TaskStatus::Failed).await;
    assert!(!h.manager.has_session(id));
    let info = h.manager.get_session_info(id).unwrap();
    assert_eq!(info.status, "Failed");
    assert_eq!(info.assigned_worker_names, vec!["prover-5"]);
    assert_eq!(h.manager.idle_worker_count(), 1);

    // Too late: the session is gone.
    let accepted = client.submit_proof(ProofMsg::ok(id, vec![1])).await.unwrap();
    assert!(!accepted);
    assert_eq!(h.status(id), TaskStatus::Failed);
    assert_eq!(h.verifier.calls.load(Ordering::SeqCst), 0);

    h.stop().await;
}

#[tokio::test]
async fn test_resubmitted_proof_is_verified_once() {
    let h = Harness::start(Duration::from_secs(60), Duration::from_secs(60)).await;
    let mut client = h.connect(6).await;
    wait_until("registration", || h.manager.worker_count() == 1).await;

    let id = h.enqueue();
    next_task_within(&mut client, Duration::from_secs(2)).await.unwrap();

    assert!(client.submit_proof(ProofMsg::ok(id, vec![7])).await.unwrap());
    assert!(client.submit_proof(ProofMsg::ok(id, vec![7])).await.unwrap());
    assert_eq!(h.verifier.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.status(id), TaskStatus::Verified);

    h.stop().await;
}

#[tokio::test]
async fn test_proving_error_is_recorded() {
    let h = Harness::start(Duration::from_secs(60), Duration::from_secs(60)).await;
    let mut client = h.connect(7).await;
    wait_until("registration", || h.manager.worker_count() == 1).await;

    let id = h.enqueue();
    next_task_within(&mut client, Duration::from_secs(2)).await.unwrap();

    let accepted = client
        .submit_proof(ProofMsg::failed(id, "witness generation failed"))
        .await
        .unwrap();
    assert!(accepted);
    assert_eq!(h.status(id), TaskStatus::Failed);
    let info = h.manager.get_session_info(id).unwrap();
    assert_eq!(info.error.as_deref(), Some("witness generation failed"));

    h.stop().await;
}

#[tokio::test]
async fn test_disconnected_worker_is_not_idle() {
    let h = Harness::start(Duration::from_secs(60), Duration::from_secs(60)).await;
    let client = h.connect(8).await;
    wait_until("registration", || h.manager.idle_worker_count() == 1).await;

    client.close().await.unwrap();
    wait_until("disconnect", || h.manager.idle_worker_count() == 0).await;
    let workers = h.manager.list_workers();
    assert_eq!(workers.len(), 1);
    assert!(!workers[0].connected);

    let id = h.enqueue();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.status(id), TaskStatus::Unassigned);

    h.stop().await;
}

#[tokio::test]
async fn test_silent_connection_is_closed_past_deadline() {
    let h = Harness::start_with(
        Duration::from_secs(60),
        Duration::from_secs(60),
        Duration::from_millis(300),
    )
    .await;

    let keypair = Keypair::from_seed(&[10; 32]);
    let identity = WorkerIdentity::new("quiet", keypair.pubkey(), "v0.1.0");
    let envelope = AuthEnvelope::sign(identity, &keypair).unwrap();
    let stream = TcpStream::connect(&h.addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::default());
    framed.send(Frame::Register(envelope)).await.unwrap();
    wait_until("registration", || h.manager.worker_count() == 1).await;

    // Never answer anything; the coordinator should hang up on its own.
    let eof = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match framed.next().await {
                None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(eof.is_ok(), "connection still open past the liveness deadline");

    wait_until("disconnect", || !h.manager.list_workers()[0].connected).await;
    assert_eq!(h.manager.idle_worker_count(), 0);

    h.stop().await;
}

#[tokio::test]
async fn test_replayed_register_frame_is_refused() {
    let h = Harness::start(Duration::from_secs(60), Duration::from_secs(0)).await;

    let keypair = Keypair::from_seed(&[11; 32]);
    let identity = WorkerIdentity::new("replayed", keypair.pubkey(), "v0.1.0");
    let envelope = AuthEnvelope::sign(identity, &keypair).unwrap();

    let first = WorkerClient::connect_with_envelope(&h.addr, envelope.clone())
        .await
        .unwrap();
    wait_until("registration", || h.manager.idle_worker_count() == 1).await;
    first.close().await.unwrap();
    wait_until("disconnect", || h.manager.idle_worker_count() == 0).await;

    let mut replay = WorkerClient::connect_with_envelope(&h.addr, envelope)
        .await
        .unwrap();
    match replay.next_task().await {
        Err(ProtocolError::Rejected(msg)) => assert!(msg.contains("already used")),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(h.manager.idle_worker_count(), 0);

    // A freshly signed envelope from the same key still gets in.
    let _fresh = h.connect(11).await;
    wait_until("re-registration", || h.manager.idle_worker_count() == 1).await;

    h.stop().await;
}
