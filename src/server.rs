use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::client_api::{self, ApiRequest, ApiResponse, ClientCall};
use crate::command::Command;
use crate::file_storage::{FileStorage, FileStorageError};
use crate::kv::{KvCommand, KvStore};
use crate::runtime::{Event, Runtime, TimerConfig};
use crate::transport::{Transport, TransportError};
use crate::types::{Message, NodeId};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("storage: {0}")]
    Storage(#[from] FileStorageError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("config: {0}")]
    Config(String),
}

pub struct Config {
    pub id: u64,
    pub addr: String,
    pub api_addr: String,
    pub peers: HashMap<String, String>,
    pub data_dir: PathBuf,
}

/// A running consensus node: persistent log on disk, peer RPCs over TCP, a
/// client-facing HTTP API, and the replicated KV store as its state machine.
pub struct Server {
    runtime: Runtime<KvCommand, KvStore, FileStorage<KvCommand>>,
    transport: Transport<KvCommand>,
    api_rx: mpsc::Receiver<ApiRequest>,
    /// HTTP waiters keyed by the request id handed to the runtime.
    waiters: HashMap<u64, oneshot::Sender<ApiResponse>>,
    next_request_id: u64,
}

impl Server {
    /// Open storage, bind the listeners, and restore any persistent state.
    pub fn start(config: Config) -> Result<Self, ServerError> {
        let local_id = NodeId::from(config.id);

        let addr: SocketAddr = config
            .addr
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid addr '{}': {e}", config.addr)))?;
        let api_addr: SocketAddr = config.api_addr.parse().map_err(|e| {
            ServerError::Config(format!("invalid api addr '{}': {e}", config.api_addr))
        })?;

        let peers = parse_peers(&config.peers)?;
        let peer_ids: Vec<NodeId> = peers.keys().copied().collect();

        let storage = FileStorage::open(&config.data_dir)?;
        let runtime = Runtime::from_storage(
            local_id,
            peer_ids,
            KvStore::new(),
            storage,
            TimerConfig::default(),
        )?;

        let transport = Transport::bind(local_id, addr, peers)?;

        let (api_tx, api_rx) = mpsc::channel();
        client_api::start(api_addr, api_tx);

        info!(node = %local_id, %addr, "node listening");

        Ok(Self {
            runtime,
            transport,
            api_rx,
            waiters: HashMap::new(),
            next_request_id: 1,
        })
    }

    /// Run the consensus event loop. Returns only on a storage error, which
    /// is fatal: the supervisor is expected to restart the process.
    pub fn run(&mut self) -> Result<(), ServerError> {
        loop {
            // Drain fired timers before blocking — back-to-back timeouts
            // must not be skipped.
            if let Some(event) = self.runtime.poll_timers() {
                let commands = self.runtime.handle(event)?;
                self.dispatch(commands);
                self.route_replies();
                continue;
            }

            // Client calls arrive on their own channel; serve them between
            // timer checks.
            while let Ok(request) = self.api_rx.try_recv() {
                self.handle_api(request)?;
            }

            // Block until the next timer deadline or an incoming message,
            // whichever comes first.
            let wait = self
                .runtime
                .next_deadline()
                .saturating_duration_since(Instant::now())
                .min(Duration::from_millis(5));

            if let Some((from, message)) = self.transport.recv_timeout(wait) {
                let commands = self.runtime.handle(Event::Message { from, message })?;
                self.dispatch(commands);
                self.route_replies();
            }
        }
    }

    fn handle_api(&mut self, request: ApiRequest) -> Result<(), ServerError> {
        match request.call {
            ClientCall::Leader => {
                let _ = request
                    .resp
                    .send(ApiResponse::Leader(self.runtime.leader()));
            }
            ClientCall::Op(command) => {
                let id = self.next_request_id();
                self.waiters.insert(id, request.resp);
                let commands = self.runtime.submit(id, command)?;
                self.dispatch(commands);
                self.route_replies();
            }
            ClientCall::SetConfig(servers) => {
                let id = self.next_request_id();
                self.waiters.insert(id, request.resp);
                let commands = self.runtime.submit_config(id, servers)?;
                self.dispatch(commands);
                self.route_replies();
            }
        }
        Ok(())
    }

    fn next_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    /// Hand resolved client replies back to their HTTP waiters. A waiter
    /// that gave up (HTTP timeout) is simply gone; the send result is moot.
    fn route_replies(&mut self) {
        for reply in self.runtime.take_replies() {
            if let Some(waiter) = self.waiters.remove(&reply.id) {
                let _ = waiter.send(ApiResponse::Result(reply.result));
            }
        }
    }

    fn dispatch(&self, commands: Vec<Command<KvCommand>>) {
        for command in commands {
            let Command::Send { to, message } = command else {
                continue;
            };
            // Vote requests go out as bounded round trips; everything else
            // is one-shot.
            let result = match message {
                Message::RequestVote(request) => self.transport.request_vote(to, request),
                message => self.transport.send(to, message),
            };
            // A peer added by a membership change may have no address
            // configured yet; drop rather than kill the event loop.
            if let Err(error) = result {
                warn!(%to, %error, "dropping message to unreachable peer");
            }
        }
    }
}

fn parse_peers(raw: &HashMap<String, String>) -> Result<HashMap<NodeId, SocketAddr>, ServerError> {
    raw.iter()
        .map(|(id_str, addr_str)| {
            let id: u64 = id_str
                .parse()
                .map_err(|_| ServerError::Config(format!("invalid peer id: {id_str}")))?;
            let addr: SocketAddr = addr_str
                .parse()
                .map_err(|e| ServerError::Config(format!("invalid peer addr '{addr_str}': {e}")))?;
            Ok((NodeId::from(id), addr))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_peers_accepts_id_addr_pairs() {
        let raw: HashMap<String, String> = [
            ("2".to_string(), "127.0.0.1:7002".to_string()),
            ("3".to_string(), "127.0.0.1:7003".to_string()),
        ]
        .into_iter()
        .collect();

        let peers = parse_peers(&raw).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(
            peers[&NodeId::from(2)],
            "127.0.0.1:7002".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn parse_peers_rejects_bad_id() {
        let raw: HashMap<String, String> =
            [("abc".to_string(), "127.0.0.1:7002".to_string())]
                .into_iter()
                .collect();
        assert!(parse_peers(&raw).is_err());
    }
}
