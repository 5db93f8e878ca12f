use {
    crate::{AuthEnvelope, Frame, FrameCodec, ProofMsg, ProtocolError, TaskMsg, WorkerIdentity},
    futures::{SinkExt, StreamExt},
    std::collections::VecDeque,
    tokio::net::{TcpStream, ToSocketAddrs},
    tokio_util::codec::Framed,
    tracing::debug,
    zelana_keypair::Keypair,
    zelana_pubkey::Pubkey,
};

/// Worker side of a coordinator connection.
pub struct WorkerClient {
    framed: Framed<TcpStream, FrameCodec>,
    pubkey: Pubkey,
    /// Tasks that arrived while waiting for a `SubmitAck`.
    pending: VecDeque<TaskMsg>,
}

impl WorkerClient {
    /// Connects and sends the signed `Register` frame.
    ///
    /// The coordinator does not acknowledge registration. A rejected worker
    /// sees an `Error` frame followed by close on its next read.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        keypair: &Keypair,
        name: &str,
        version: &str,
    ) -> Result<Self, ProtocolError> {
        let identity = WorkerIdentity::new(name, keypair.pubkey(), version);
        let envelope = AuthEnvelope::sign(identity, keypair)?;
        Self::connect_with_envelope(addr, envelope).await
    }

    /// Connects with a prepared envelope. Lets callers send a deliberately
    /// broken one.
    pub async fn connect_with_envelope(
        addr: impl ToSocketAddrs,
        envelope: AuthEnvelope,
    ) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, FrameCodec::default());

        let pubkey = envelope.pubkey();
        framed.send(Frame::Register(envelope)).await?;
        debug!(pubkey = %pubkey, "register sent");

        Ok(Self {
            framed,
            pubkey,
            pending: VecDeque::new(),
        })
    }

    pub fn pubkey(&self) -> Pubkey {
        self.pubkey
    }

    /// Waits for the next pushed task. `Ok(None)` means the coordinator closed
    /// the connection.
    pub async fn next_task(&mut self) -> Result<Option<TaskMsg>, ProtocolError> {
        if let Some(task) = self.pending.pop_front() {
            return Ok(Some(task));
        }
        loop {
            match self.read().await? {
                None => return Ok(None),
                Some(Frame::BlockTrace(task)) => return Ok(Some(task)),
                Some(other) => debug!(kind = other.kind(), "ignoring frame while idle"),
            }
        }
    }

    /// Sends a proof and waits for the coordinator's verdict on the call.
    pub async fn submit_proof(&mut self, proof: ProofMsg) -> Result<bool, ProtocolError> {
        let id = proof.id;
        self.framed.send(Frame::Proof(proof)).await?;

        loop {
            match self.read().await? {
                None => return Err(ProtocolError::Closed),
                Some(Frame::SubmitAck(ack)) if ack.id == id => {
                    if let Some(err) = &ack.error {
                        debug!(task_id = id, error = %err, "proof not accepted");
                    }
                    return Ok(ack.accepted);
                }
                Some(Frame::BlockTrace(task)) => self.pending.push_back(task),
                Some(other) => {
                    return Err(ProtocolError::UnexpectedFrame {
                        expected: "SubmitAck",
                        got: other.kind(),
                    });
                }
            }
        }
    }

    /// Next frame, with pings answered and errors surfaced.
    async fn read(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            match self.framed.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(e),
                Some(Ok(Frame::Ping(n))) => self.framed.send(Frame::Pong(n)).await?,
                Some(Ok(Frame::Error(msg))) => return Err(ProtocolError::Rejected(msg)),
                Some(Ok(frame)) => return Ok(Some(frame)),
            }
        }
    }

    pub async fn close(mut self) -> Result<(), ProtocolError> {
        self.framed.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SubmitAck;
    use tokio::net::TcpListener;

    /// Accepts one worker, reads its register and proof, then answers with
    /// `reply`.
    async fn one_shot_coordinator(reply: Frame) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::default());
            assert!(matches!(framed.next().await, Some(Ok(Frame::Register(_)))));
            assert!(matches!(framed.next().await, Some(Ok(Frame::Proof(_)))));
            framed.send(reply).await.unwrap();
            let _ = framed.next().await;
        });
        addr
    }

    #[tokio::test]
    async fn test_submit_proof_reads_matching_ack() {
        let addr = one_shot_coordinator(Frame::SubmitAck(SubmitAck {
            id: 3,
            accepted: true,
            error: None,
        }))
        .await;
        let keypair = Keypair::from_seed(&[1; 32]);
        let mut client = WorkerClient::connect(&addr, &keypair, "w", "v0").await.unwrap();
        assert!(client.submit_proof(ProofMsg::ok(3, vec![1])).await.unwrap());
    }

    #[tokio::test]
    async fn test_submit_proof_rejects_foreign_ack() {
        let addr = one_shot_coordinator(Frame::SubmitAck(SubmitAck {
            id: 99,
            accepted: true,
            error: None,
        }))
        .await;
        let keypair = Keypair::from_seed(&[1; 32]);
        let mut client = WorkerClient::connect(&addr, &keypair, "w", "v0").await.unwrap();
        let err = client.submit_proof(ProofMsg::ok(3, vec![1])).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedFrame {
                expected: "SubmitAck",
                got: "SubmitAck"
            }
        ));
    }
}
