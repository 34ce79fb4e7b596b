use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{Message, NodeId, RequestVote};

/// Replication ships one entry per AppendEntries, so no legitimate frame
/// comes anywhere near this. A larger length prefix is garbage or abuse and
/// the connection is dropped before allocating for it.
const MAX_FRAME: usize = 1 << 20;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);
/// How long a candidate keeps its connection open waiting for a ballot.
/// Must stay below the election timeout, or a slow voter could answer an
/// election the candidate has already restarted.
const VOTE_ROUND_TRIP_TIMEOUT: Duration = Duration::from_millis(120);
/// How long an inbound connection may take to produce its one frame.
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unknown peer: {0}")]
    UnknownPeer(NodeId),
    #[error("frame of {0} bytes exceeds the single-entry limit")]
    FrameTooLarge(usize),
}

/// Wire envelope: wraps a consensus message with the sender's identity.
#[derive(Serialize, Deserialize)]
struct Envelope<Cmd> {
    from: NodeId,
    message: Message<Cmd>,
}

/// TCP transport for peer RPCs, framed as a 4-byte big-endian length prefix
/// followed by a JSON `Envelope`.
///
/// Two delivery shapes, matching how the consensus core uses the network:
///
/// * AppendEntries traffic and its acks are one-shot and fire-and-forget:
///   each message dials, writes one frame, and hangs up. Failed sends are
///   dropped silently; the leader's heartbeat retries repair losses.
/// * RequestVote is a bounded round trip. `request_vote` holds its
///   connection open and waits up to [`VOTE_ROUND_TRIP_TIMEOUT`] for the
///   ballot, which the voter writes back on that same connection — a
///   candidate can collect votes from peers that do not know how to dial it
///   (e.g. mid-membership-change). On timeout or error nothing reaches the
///   inbox and the election timer decides what happens next.
pub struct Transport<Cmd> {
    local_id: NodeId,
    peers: HashMap<NodeId, SocketAddr>,
    inbox_tx: mpsc::Sender<(NodeId, Message<Cmd>)>,
    inbox_rx: mpsc::Receiver<(NodeId, Message<Cmd>)>,
    /// Connections held open by candidates awaiting our ballot, keyed by
    /// candidate. A newer request from the same candidate replaces the old
    /// stream, which closes and times the stale election out on its side.
    vote_streams: Arc<Mutex<HashMap<NodeId, TcpStream>>>,
    /// Keeping this Arc alive closes the listener when Transport is dropped,
    /// which causes the accept loop to receive an error and exit.
    _listener: Arc<TcpListener>,
}

impl<Cmd> Transport<Cmd>
where
    Cmd: Send + 'static + Serialize + for<'de> Deserialize<'de>,
{
    /// Bind a listener on `addr` and start accepting inbound RPCs.
    pub fn bind(
        local_id: NodeId,
        addr: SocketAddr,
        peers: HashMap<NodeId, SocketAddr>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self::start(local_id, listener, peers))
    }

    fn start(local_id: NodeId, listener: TcpListener, peers: HashMap<NodeId, SocketAddr>) -> Self {
        let listener = Arc::new(listener);
        let (inbox_tx, inbox_rx) = mpsc::channel();
        let vote_streams = Arc::new(Mutex::new(HashMap::new()));

        let listener_bg = Arc::clone(&listener);
        let tx_bg = inbox_tx.clone();
        let streams_bg = Arc::clone(&vote_streams);
        thread::spawn(move || accept_loop::<Cmd>(listener_bg, tx_bg, streams_bg));

        Self {
            local_id,
            peers,
            inbox_tx,
            inbox_rx,
            vote_streams,
            _listener: listener,
        }
    }

    /// Send a one-shot message. Returns immediately; delivery happens on a
    /// background thread and failures are swallowed. A vote response is
    /// written back on the connection its request arrived on when one is
    /// still open, and only falls back to dialing otherwise.
    pub fn send(&self, to: NodeId, message: Message<Cmd>) -> Result<(), TransportError> {
        if matches!(message, Message::RequestVoteResponse(_)) {
            let held = self
                .vote_streams
                .lock()
                .ok()
                .and_then(|mut streams| streams.remove(&to));
            if let Some(mut stream) = held {
                let envelope = Envelope {
                    from: self.local_id,
                    message,
                };
                thread::spawn(move || {
                    if let Err(error) = write_frame(&mut stream, &envelope) {
                        debug!(%to, %error, "ballot lost, candidate will retry");
                    }
                });
                return Ok(());
            }
        }

        let addr = self
            .peers
            .get(&to)
            .copied()
            .ok_or(TransportError::UnknownPeer(to))?;
        let envelope = Envelope {
            from: self.local_id,
            message,
        };
        thread::spawn(move || {
            if let Err(error) = dial_and_send(addr, &envelope) {
                debug!(%to, %addr, %error, "dropping undeliverable message");
            }
        });
        Ok(())
    }

    /// Ask `to` for its vote: dial, write the request, and wait on the same
    /// connection for the ballot, all on a detached thread. The response is
    /// fed into the inbox like any other message; on timeout or error
    /// nothing is posted.
    pub fn request_vote(&self, to: NodeId, request: RequestVote) -> Result<(), TransportError> {
        let addr = self
            .peers
            .get(&to)
            .copied()
            .ok_or(TransportError::UnknownPeer(to))?;
        let from = self.local_id;
        let inbox = self.inbox_tx.clone();
        thread::spawn(move || match vote_round_trip::<Cmd>(addr, from, request) {
            Ok(response) => {
                let _ = inbox.send((to, response));
            }
            Err(error) => debug!(%to, %addr, %error, "vote request went unanswered"),
        });
        Ok(())
    }

    /// Block until a message arrives or `timeout` elapses. Returns `None` on
    /// timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<(NodeId, Message<Cmd>)> {
        self.inbox_rx.recv_timeout(timeout).ok()
    }

    /// The address this transport is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self._listener.local_addr()?)
    }
}

fn accept_loop<Cmd>(
    listener: Arc<TcpListener>,
    tx: mpsc::Sender<(NodeId, Message<Cmd>)>,
    vote_streams: Arc<Mutex<HashMap<NodeId, TcpStream>>>,
) where
    Cmd: Send + 'static + for<'de> Deserialize<'de>,
{
    loop {
        match listener.accept() {
            Ok((mut stream, _)) => {
                let tx = tx.clone();
                let vote_streams = Arc::clone(&vote_streams);
                thread::spawn(move || {
                    let _ = stream.set_read_timeout(Some(READ_TIMEOUT));
                    let Ok(envelope) = read_frame::<Envelope<Cmd>>(&mut stream) else {
                        return;
                    };
                    // A candidate is waiting on this connection for its
                    // ballot; park the stream so send() can answer on it.
                    if matches!(envelope.message, Message::RequestVote(_)) {
                        if let (Ok(held), Ok(mut streams)) =
                            (stream.try_clone(), vote_streams.lock())
                        {
                            streams.insert(envelope.from, held);
                        }
                    }
                    let _ = tx.send((envelope.from, envelope.message));
                });
            }
            // Listener was closed (Transport dropped) or an unrecoverable error.
            Err(_) => break,
        }
    }
}

/// The candidate half of a vote: one connection, write the request, wait
/// briefly for the ballot to come back on it.
fn vote_round_trip<Cmd>(
    addr: SocketAddr,
    from: NodeId,
    request: RequestVote,
) -> Result<Message<Cmd>, TransportError>
where
    Cmd: Serialize + for<'de> Deserialize<'de>,
{
    let mut stream = connect(addr)?;
    stream.set_read_timeout(Some(VOTE_ROUND_TRIP_TIMEOUT))?;
    write_frame(
        &mut stream,
        &Envelope {
            from,
            message: Message::<Cmd>::RequestVote(request),
        },
    )?;
    let reply: Envelope<Cmd> = read_frame(&mut stream)?;
    match reply.message {
        response @ Message::RequestVoteResponse(_) => Ok(response),
        _ => Err(TransportError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "peer answered a vote request with something else",
        ))),
    }
}

fn connect(addr: SocketAddr) -> Result<TcpStream, io::Error> {
    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    Ok(stream)
}

/// Connect, write one frame, and hang up.
fn dial_and_send<Cmd: Serialize>(
    addr: SocketAddr,
    envelope: &Envelope<Cmd>,
) -> Result<(), TransportError> {
    let mut stream = connect(addr)?;
    write_frame(&mut stream, envelope)
}

fn write_frame<T: Serialize>(stream: &mut TcpStream, payload: &T) -> Result<(), TransportError> {
    let bytes = serde_json::to_vec(payload)?;
    if bytes.len() > MAX_FRAME {
        return Err(TransportError::FrameTooLarge(bytes.len()));
    }
    stream.write_all(&(bytes.len() as u32).to_be_bytes())?;
    stream.write_all(&bytes)?;
    stream.flush()?;
    Ok(())
}

fn read_frame<T: for<'de> Deserialize<'de>>(stream: &mut TcpStream) -> Result<T, TransportError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(serde_json::from_slice(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AppendEntries, AppendEntriesResponse, LogEntry, LogIndex, RequestVoteResponse, Term,
    };

    fn vote_request(candidate: u64) -> RequestVote {
        RequestVote {
            term: Term::from(3),
            candidate_id: NodeId::from(candidate),
            last_log_index: LogIndex::default(),
            last_log_term: Term::default(),
        }
    }

    /// a knows b's address; b knows nobody. Any message b gets back to a
    /// must therefore ride a connection a opened.
    fn one_way_pair() -> (Transport<String>, Transport<String>) {
        let listener_a = TcpListener::bind("127.0.0.1:0").unwrap();
        let listener_b = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr_b = listener_b.local_addr().unwrap();

        let a = Transport::start(NodeId::from(1), listener_a, [(NodeId::from(2), addr_b)].into());
        let b = Transport::start(NodeId::from(2), listener_b, HashMap::new());
        (a, b)
    }

    #[test]
    fn ballot_returns_on_the_request_connection() {
        let (a, b) = one_way_pair();

        a.request_vote(NodeId::from(2), vote_request(1)).unwrap();

        let (from, msg) = b.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(from, NodeId::from(1));
        assert!(matches!(msg, Message::RequestVote(_)));

        // b has no address for a, so this can only travel over the held
        // connection.
        b.send(
            NodeId::from(1),
            Message::RequestVoteResponse(RequestVoteResponse {
                term: Term::from(3),
                vote_granted: true,
            }),
        )
        .unwrap();

        let (from, msg) = a.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(from, NodeId::from(2));
        let Message::RequestVoteResponse(resp) = msg else {
            panic!("wrong variant")
        };
        assert!(resp.vote_granted);
    }

    #[test]
    fn ballot_without_held_connection_needs_an_address() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let t: Transport<String> = Transport::start(NodeId::from(2), listener, HashMap::new());

        let result = t.send(
            NodeId::from(1),
            Message::RequestVoteResponse(RequestVoteResponse {
                term: Term::from(1),
                vote_granted: false,
            }),
        );
        assert!(matches!(result, Err(TransportError::UnknownPeer(_))));
    }

    #[test]
    fn replication_messages_are_one_shot_dials() {
        let listener_a = TcpListener::bind("127.0.0.1:0").unwrap();
        let listener_b = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr_a = listener_a.local_addr().unwrap();
        let addr_b = listener_b.local_addr().unwrap();

        let a: Transport<String> =
            Transport::start(NodeId::from(1), listener_a, [(NodeId::from(2), addr_b)].into());
        let b: Transport<String> =
            Transport::start(NodeId::from(2), listener_b, [(NodeId::from(1), addr_a)].into());

        a.send(
            NodeId::from(2),
            Message::AppendEntries(AppendEntries {
                term: Term::from(1),
                leader_id: NodeId::from(1),
                prev_log_index: LogIndex::default(),
                prev_log_term: Term::default(),
                entries: vec![LogEntry::command(Term::from(1), "set".to_string())],
                leader_commit: LogIndex::default(),
            }),
        )
        .unwrap();

        let (from, msg) = b.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(from, NodeId::from(1));
        let Message::AppendEntries(req) = msg else {
            panic!("wrong variant")
        };
        assert_eq!(req.entries.len(), 1);

        b.send(
            NodeId::from(1),
            Message::AppendEntriesResponse(AppendEntriesResponse {
                term: Term::from(1),
                success: true,
                match_index: Some(LogIndex::from(1)),
            }),
        )
        .unwrap();

        let (from, msg) = a.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(from, NodeId::from(2));
        assert!(matches!(msg, Message::AppendEntriesResponse(_)));
    }

    #[test]
    fn oversized_frames_never_arrive() {
        let (a, b) = one_way_pair();

        // Far past MAX_FRAME once serialized; the writer refuses to put it
        // on the wire.
        let huge = "x".repeat(2 * MAX_FRAME);
        a.send(
            NodeId::from(2),
            Message::AppendEntries(AppendEntries {
                term: Term::from(1),
                leader_id: NodeId::from(1),
                prev_log_index: LogIndex::default(),
                prev_log_term: Term::default(),
                entries: vec![LogEntry::command(Term::from(1), huge)],
                leader_commit: LogIndex::default(),
            }),
        )
        .unwrap();

        assert!(b.recv_timeout(Duration::from_millis(300)).is_none());
    }

    #[test]
    fn unanswered_vote_request_posts_nothing() {
        let (a, b) = one_way_pair();

        a.request_vote(NodeId::from(2), vote_request(1)).unwrap();

        // b reads the request but never answers; a's round trip times out
        // silently instead of inventing a message.
        let (_, msg) = b.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(msg, Message::RequestVote(_)));

        let quiet = VOTE_ROUND_TRIP_TIMEOUT + Duration::from_millis(100);
        assert!(a.recv_timeout(quiet).is_none());
    }
}
