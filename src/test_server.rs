//! In-memory directory server end for session and client tests.

use crate::connection::{LdapStream, Transport};
use crate::framer::Framer;
use crate::ldap_protocol::{encode_ldap_message, LdapMessage, ProtocolOp};
use std::collections::VecDeque;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub(crate) struct FakeServer {
    stream: Box<dyn Transport>,
    framer: Framer,
    queued: VecDeque<LdapMessage>,
}

/// Client stream plus the server end of the same pipe.
pub(crate) fn pair() -> (LdapStream, FakeServer) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    (LdapStream::plain(client), FakeServer::new(server))
}

impl FakeServer {
    pub(crate) fn new<T: Transport>(io: T) -> Self {
        FakeServer {
            stream: Box::new(io),
            framer: Framer::new(),
            queued: VecDeque::new(),
        }
    }

    /// Next request from the client; `None` once the client end is closed.
    pub(crate) async fn recv(&mut self) -> Option<LdapMessage> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(message) = self.queued.pop_front() {
                return Some(message);
            }
            let n = self.stream.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            for frame in self.framer.push(&buf[..n]).expect("client sent a broken stream") {
                self.queued.push_back(frame.expect("client sent an undecodable envelope"));
            }
        }
    }

    pub(crate) async fn send(&mut self, message: LdapMessage) {
        let bytes = encode_ldap_message(&message).expect("encode response");
        self.send_raw(&bytes).await;
    }

    pub(crate) async fn reply(&mut self, message_id: i32, op: ProtocolOp) {
        self.send(LdapMessage::new(message_id, op)).await;
    }

    pub(crate) async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write to client");
        self.stream.flush().await.expect("flush to client");
    }
}
