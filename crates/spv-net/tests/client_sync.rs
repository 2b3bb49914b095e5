//! End-to-end client tests against scripted loopback peers.
//!
//! Each test binds one or more listeners, points the client at them through
//! `known_peers`, and plays the server side of the protocol by hand. Timer
//! constants are compressed so the timeout paths run in milliseconds.
//!
//! Scripts return their live sessions so sockets stay open through the
//! post-script grace period; a dropped session would look like a peer death
//! and set off the replacement machinery mid-assertion.

use futures::{SinkExt, StreamExt};
use spv_chain::{BlockHeader, Chain, ChainResult, Hash, Network, TipStore};
use spv_net::{
    Client, ClientConfig, ConnectionConfig, Inv, Message, MessageCodec, VersionMessage,
    VersionNetAddr,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;

const NETWORK: Network = Network::Regtest;

fn test_client_config(known_peers: Vec<SocketAddr>) -> ClientConfig {
    ClientConfig {
        known_peers,
        header_timeout: Duration::from_secs(60),
        connection: ConnectionConfig {
            magic: NETWORK.magic(),
            ping_interval: Duration::from_secs(60),
            pong_timeout: Duration::from_secs(60),
            ..Default::default()
        },
        ..ClientConfig::for_network(NETWORK)
    }
}

fn new_client(known_peers: Vec<SocketAddr>, store: Option<Box<dyn TipStore>>) -> Client {
    Client::new(test_client_config(known_peers), Chain::new(NETWORK), store)
}

/// Tip store that counts saves; used to observe sync batches.
struct CountingStore {
    saves: Arc<AtomicUsize>,
}

impl TipStore for CountingStore {
    fn load_tip(&self) -> ChainResult<Option<BlockHeader>> {
        Ok(None)
    }

    fn save_tip(&self, _header: &BlockHeader) -> ChainResult<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as u32
}

/// Build `count` headers chained onto `parent`. Timestamps are old except
/// the last, which is `last_timestamp`.
fn build_headers(parent: &BlockHeader, count: usize, last_timestamp: u32) -> Vec<BlockHeader> {
    let mut headers = Vec::with_capacity(count);
    let mut prev = parent.block_hash;
    for i in 0..count {
        let timestamp = if i + 1 == count {
            last_timestamp
        } else {
            1_400_000_000 + i as u32
        };
        let header = BlockHeader {
            version: 2,
            prev_block: prev,
            merkle_root: Hash([0x22; 32]),
            timestamp,
            bits: 0x207fffff,
            nonce: i as u32,
            height: 0,
            block_hash: Hash::ZERO,
        }
        .seal();
        prev = header.block_hash;
        headers.push(header);
    }
    headers
}

/// Server side of one scripted peer connection.
struct Session {
    framed: Framed<TcpStream, MessageCodec>,
}

impl Session {
    fn wrap(stream: TcpStream) -> Self {
        Session {
            framed: Framed::new(stream, MessageCodec::new(NETWORK.magic())),
        }
    }

    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("client dials within deadline")
            .expect("accept");
        Session::wrap(stream)
    }

    async fn next(&mut self) -> Option<Message> {
        match timeout(Duration::from_secs(5), self.framed.next()).await {
            Ok(Some(Ok(msg))) => Some(msg),
            Ok(Some(Err(e))) => panic!("scripted peer decode error: {}", e),
            Ok(None) => None,
            Err(_) => panic!("scripted peer timed out waiting for a frame"),
        }
    }

    /// Next message with a bounded wait; None on timeout or close.
    async fn try_next(&mut self, wait: Duration) -> Option<Message> {
        match timeout(wait, self.framed.next()).await {
            Ok(Some(Ok(msg))) => Some(msg),
            _ => None,
        }
    }

    async fn send(&mut self, msg: Message) {
        self.framed.send(msg).await.expect("scripted peer send");
    }

    /// Consume the client's `version` and `verack`, answering in kind, and
    /// swallow the `getaddr` that follows.
    async fn handshake(&mut self, start_height: i32) {
        match self.next().await {
            Some(Message::Version(_)) => {}
            other => panic!("expected version, got {:?}", other),
        }
        self.send(Message::Version(VersionMessage {
            version: 70001,
            services: 1,
            timestamp: now_secs() as i64,
            receiver: VersionNetAddr::unspecified(),
            sender: VersionNetAddr::unspecified(),
            nonce: rand::random(),
            user_agent: "/scripted/".to_string(),
            start_height,
            relay: true,
        }))
        .await;
        self.send(Message::Verack).await;
        match self.next().await {
            Some(Message::Verack) => {}
            other => panic!("expected verack, got {:?}", other),
        }
        match self.next().await {
            Some(Message::GetAddr) => {}
            other => panic!("expected getaddr, got {:?}", other),
        }
    }

    /// Wait for a `getheaders`, skipping anything else.
    async fn expect_get_headers(&mut self) -> Vec<Hash> {
        loop {
            match self.next().await {
                Some(Message::GetHeaders(locator)) => return locator.locator,
                Some(_) => continue,
                None => panic!("connection closed while waiting for getheaders"),
            }
        }
    }
}

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Run the client while the script plays out, keep polling the client for a
/// grace period so it digests the script's final messages, and hand the
/// script's output (typically its live sessions) back to the caller.
macro_rules! run_client_against {
    ($client:expr, $script:expr) => {
        tokio::select! {
            _ = $client.run() => panic!("client stopped on its own"),
            out = async {
                let out = $script.await;
                tokio::time::sleep(Duration::from_millis(300)).await;
                out
            } => out,
        }
    };
}

#[tokio::test]
async fn test_handshake_end_to_end() {
    let (listener, addr) = bind().await;
    let mut client = new_client(vec![addr], None);

    let script = async {
        let mut session = Session::accept(&listener).await;
        session.handshake(0).await;
        session
    };

    let _session = run_client_against!(client, script);
    assert_eq!(client.connection_count(), 1);
    assert!(client.need_headers());
}

#[tokio::test]
async fn test_header_sync_to_recent_tip() {
    let (listener, addr) = bind().await;
    let saves = Arc::new(AtomicUsize::new(0));
    let store = CountingStore {
        saves: saves.clone(),
    };
    let mut client = new_client(vec![addr], Some(Box::new(store)));
    let genesis = NETWORK.genesis();
    let headers = build_headers(&genesis, 2500, now_secs());

    let script = async {
        let mut session = Session::accept(&listener).await;
        session.handshake(2500).await;

        let locator = session.expect_get_headers().await;
        assert_eq!(locator.last(), Some(&genesis.block_hash));
        session
            .send(Message::Headers(headers[..2000].to_vec()))
            .await;

        let locator = session.expect_get_headers().await;
        assert_eq!(locator.first(), Some(&headers[1999].block_hash));
        session
            .send(Message::Headers(headers[2000..].to_vec()))
            .await;

        let locator = session.expect_get_headers().await;
        assert_eq!(locator.first(), Some(&headers[2499].block_hash));
        session.send(Message::Headers(Vec::new())).await;

        // Sync is complete; nothing further may be requested.
        assert!(session.try_next(Duration::from_millis(300)).await.is_none());
        session
    };

    let _session = run_client_against!(client, script);
    assert_eq!(client.chain().height(), 2500);
    assert!(!client.need_headers());
    assert_eq!(saves.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_header_timeout_redispatches_to_other_peer() {
    let (listener_a, addr_a) = bind().await;
    let (listener_b, addr_b) = bind().await;
    let mut client = Client::new(
        ClientConfig {
            header_timeout: Duration::from_millis(300),
            ..test_client_config(vec![addr_a, addr_b])
        },
        Chain::new(NETWORK),
        None,
    );

    let serve_silently = |listener: TcpListener| async move {
        let mut session = Session::accept(&listener).await;
        session.handshake(0).await;
        // Accept the header request, never answer it.
        session.expect_get_headers().await;
        session
    };

    let script = async {
        // Both peers see a getheaders: the first from the initial dispatch,
        // the second once the timeout re-targets the other peer.
        tokio::join!(serve_silently(listener_a), serve_silently(listener_b))
    };

    let _sessions = run_client_against!(client, script);
    assert_eq!(client.connection_count(), 2);
    assert!(client.need_headers());
}

#[tokio::test]
async fn test_peer_replacement_after_close() {
    let (listener_a, addr_a) = bind().await;
    let (listener_b, addr_b) = bind().await;
    let (listener_c, addr_c) = bind().await;
    let listeners = [listener_a, listener_b, listener_c];
    let mut client = Client::new(
        ClientConfig {
            max_connections: 2,
            ..test_client_config(vec![addr_a, addr_b, addr_c])
        },
        Chain::new(NETWORK),
        None,
    );

    let script = async {
        // Two of the three candidates get dialed; find out which.
        let mut sessions = Vec::new();
        for listener in &listeners {
            if let Ok(Ok((stream, _))) =
                timeout(Duration::from_millis(500), listener.accept()).await
            {
                let mut session = Session::wrap(stream);
                session.handshake(0).await;
                sessions.push(session);
            }
            if sessions.len() == 2 {
                break;
            }
        }
        assert_eq!(sessions.len(), 2, "client holds two connections");

        // Kill one socket; exactly one replacement dial must follow, on
        // whichever listener the client picks next.
        drop(sessions.remove(0));
        let accepts = listeners.iter().map(|l| Box::pin(l.accept()));
        let (accepted, _, _) = timeout(
            Duration::from_secs(5),
            futures::future::select_all(accepts),
        )
        .await
        .expect("replacement dial within deadline");
        let (stream, _) = accepted.expect("accept replacement");
        let mut replacement = Session::wrap(stream);
        replacement.handshake(0).await;
        sessions.push(replacement);
        sessions
    };

    let _sessions = run_client_against!(client, script);
    assert_eq!(client.connection_count(), 2);
}

#[tokio::test]
async fn test_inv_dedup_and_subsumption() {
    let (listener, addr) = bind().await;
    let mut client = new_client(vec![addr], None);
    let genesis = NETWORK.genesis();
    let headers = build_headers(&genesis, 1, now_secs());
    let block_hash = headers[0].block_hash;

    let script = async {
        let mut session = Session::accept(&listener).await;
        session.handshake(1).await;

        // The client starts header sync immediately; leave it hanging.
        session.expect_get_headers().await;

        // Two identical announcements produce exactly one getdata.
        session
            .send(Message::Inv(vec![Inv::block(block_hash)]))
            .await;
        session
            .send(Message::Inv(vec![Inv::block(block_hash)]))
            .await;
        match session.next().await {
            Some(Message::GetData(entries)) => {
                assert_eq!(entries, vec![Inv::block(block_hash)]);
            }
            other => panic!("expected getdata, got {:?}", other),
        }
        assert!(
            session.try_next(Duration::from_millis(300)).await.is_none(),
            "duplicate inv must not trigger a second getdata"
        );

        // The header reply subsumes the pending announcement...
        session.send(Message::Headers(headers.clone())).await;
        // ...after which a repeat announcement is not needed either, since
        // the block is now in the chain.
        session
            .send(Message::Inv(vec![Inv::block(block_hash)]))
            .await;
        loop {
            match session.try_next(Duration::from_millis(300)).await {
                Some(Message::GetData(_)) => panic!("inv re-fetched after header arrived"),
                Some(_) => continue,
                None => break,
            }
        }
        session
    };

    let _session = run_client_against!(client, script);
    assert!(client.chain().has_block(&block_hash));
    assert_eq!(client.chain().height(), 1);
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let (listener, addr) = bind().await;
    let mut client = new_client(vec![addr], None);

    let script = async {
        let mut session = Session::accept(&listener).await;
        session.handshake(0).await;
        session
    };

    let mut session = run_client_against!(client, script);
    assert_eq!(client.connection_count(), 1);

    client.shutdown().await;
    client.shutdown().await;

    assert_eq!(client.connection_count(), 0);
    // The socket is closed; the scripted peer reads EOF.
    assert!(session.next().await.is_none());
}
