use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::config::{KeepAlivePolicy, Scheme};
use crate::io_util::shutdown_with_timeout;
use crate::proxy::upstream::UpstreamIo;
use crate::util::format_authority;

/// Identity of an origin for connection reuse. The dial address is part of the key so services
/// that reach the same origin through different transports never share connections.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OriginKey {
    pub scheme: Scheme,
    pub host: Arc<str>,
    pub port: u16,
    pub dial_host: Arc<str>,
    pub dial_port: u16,
}

impl fmt::Display for OriginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}",
            self.scheme,
            format_authority(&self.host, self.port, self.scheme.default_port())
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    InUse,
    Draining,
    Closed,
}

/// One persistent connect-side connection together with its read buffer.
pub struct PooledConnection {
    pub(crate) io: BufReader<UpstreamIo>,
    key: OriginKey,
    peer: SocketAddr,
    state: ConnectionState,
    last_activity: Instant,
    idle_deadline: Option<Instant>,
    reused: bool,
}

impl PooledConnection {
    pub fn new(io: UpstreamIo, key: OriginKey, peer: SocketAddr) -> Self {
        Self {
            io: BufReader::new(io),
            key,
            peer,
            state: ConnectionState::InUse,
            last_activity: Instant::now(),
            idle_deadline: None,
            reused: false,
        }
    }

    pub fn key(&self) -> &OriginKey {
        &self.key
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True when this connection came out of the pool rather than being freshly opened.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn mark_draining(&mut self) {
        self.state = ConnectionState::Draining;
    }

    /// Bytes already read from the origin but not consumed by any response.
    pub fn has_buffered_bytes(&self) -> bool {
        !self.io.buffer().is_empty()
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.idle_deadline.is_some_and(|deadline| deadline <= now)
    }

    /// An idle connection must have nothing to read. EOF or unsolicited bytes mean the origin
    /// has closed it or is out of sync.
    async fn is_stale(&mut self) -> bool {
        if self.has_buffered_bytes() {
            return true;
        }
        let mut peek = [0u8; 1];
        match tokio::time::timeout(Duration::ZERO, self.io.get_mut().read(&mut peek)).await {
            Err(_) => false,
            Ok(_) => true,
        }
    }

    pub async fn close(mut self, timeout_dur: Duration) {
        self.state = ConnectionState::Closed;
        if let Err(err) =
            shutdown_with_timeout(self.io.get_mut(), timeout_dur, "closing origin connection").await
        {
            debug!(origin = %self.key, peer = %self.peer, error = %err, "origin connection shutdown failed");
        }
    }
}

#[derive(Default)]
struct PoolBucket {
    idle: VecDeque<PooledConnection>,
}

#[derive(Default)]
struct PoolCounters {
    reused: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub reused_total: u64,
    pub opened_total: u64,
    pub closed_total: u64,
}

/// Idle connect-side connections grouped per origin. Each bucket is a LIFO stack behind its own
/// mutex; the outer map lock is only held to find or create a bucket.
pub struct ConnectionPool {
    buckets: Mutex<HashMap<OriginKey, Arc<Mutex<PoolBucket>>>>,
    counters: PoolCounters,
    shutdown_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            counters: PoolCounters::default(),
            shutdown_timeout,
        }
    }

    fn bucket(&self, key: &OriginKey) -> Arc<Mutex<PoolBucket>> {
        self.buckets.lock().entry(key.clone()).or_default().clone()
    }

    /// Checks out the most recently released live connection for `key`. `None` means the caller
    /// has to open a new one.
    pub async fn acquire(&self, key: &OriginKey) -> Option<PooledConnection> {
        let bucket = self.buckets.lock().get(key).cloned()?;
        loop {
            let popped = bucket.lock().idle.pop_back();
            let Some(mut candidate) = popped else {
                drop(bucket);
                self.prune_bucket(key);
                return None;
            };
            if candidate.is_expired(Instant::now()) {
                self.discard(candidate, "idle deadline passed");
                continue;
            }
            if candidate.is_stale().await {
                self.discard(candidate, "closed by origin while idle");
                continue;
            }
            candidate.state = ConnectionState::InUse;
            candidate.idle_deadline = None;
            candidate.reused = true;
            candidate.touch();
            self.counters.reused.fetch_add(1, Ordering::Relaxed);
            debug!(origin = %key, peer = %candidate.peer, "reusing pooled origin connection");
            return Some(candidate);
        }
    }

    /// Returns a connection after an exchange. It is kept only when it is `reusable`, the policy
    /// allows pooling, and the bucket still has room; otherwise it is closed.
    pub fn release(&self, mut conn: PooledConnection, reusable: bool, policy: &KeepAlivePolicy) {
        if !reusable || !policy.allows_pooling() {
            self.discard(conn, "not reusable");
            return;
        }
        if conn.has_buffered_bytes() {
            self.discard(conn, "unread bytes after response");
            return;
        }
        let now = Instant::now();
        conn.state = ConnectionState::Idle;
        conn.last_activity = now;
        conn.idle_deadline = Some(now + policy.timeout);
        let bucket = self.bucket(&conn.key);
        let rejected = {
            let mut guard = bucket.lock();
            if guard.idle.len() < policy.max_idle {
                debug!(origin = %conn.key, peer = %conn.peer, idle = guard.idle.len() + 1, "origin connection returned to pool");
                guard.idle.push_back(conn);
                None
            } else {
                Some(conn)
            }
        };
        if let Some(conn) = rejected {
            self.discard(conn, "pool bucket full");
        }
    }

    /// Closes every idle connection whose deadline has passed. Returns how many were closed.
    pub fn evict_expired(&self) -> usize {
        let buckets: Vec<_> = self.buckets.lock().values().cloned().collect();
        let now = Instant::now();
        let mut expired = Vec::new();
        for bucket in buckets {
            let mut guard = bucket.lock();
            let idle: Vec<_> = guard.idle.drain(..).collect();
            for conn in idle {
                if conn.is_expired(now) {
                    expired.push(conn);
                } else {
                    guard.idle.push_back(conn);
                }
            }
        }
        let count = expired.len();
        for conn in expired {
            self.discard(conn, "idle timeout");
        }
        self.prune_empty_buckets();
        count
    }

    /// Forgets buckets with no idle connections that nobody else holds. Origin keys come from
    /// redirect targets too, so the map must not keep every key it has ever seen.
    fn prune_empty_buckets(&self) {
        self.buckets
            .lock()
            .retain(|_, bucket| Arc::strong_count(bucket) > 1 || !bucket.lock().idle.is_empty());
    }

    fn prune_bucket(&self, key: &OriginKey) {
        let mut buckets = self.buckets.lock();
        if let Some(bucket) = buckets.get(key)
            && Arc::strong_count(bucket) == 1
            && bucket.lock().idle.is_empty()
        {
            buckets.remove(key);
        }
    }

    /// Counts a newly opened connection.
    pub fn record_opened(&self) {
        self.counters.opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Closes a connection that never enters the pool, such as one that failed mid-exchange.
    pub fn discard(&self, conn: PooledConnection, reason: &'static str) {
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        debug!(origin = %conn.key, peer = %conn.peer, reason, "closing origin connection");
        let timeout_dur = self.shutdown_timeout;
        tokio::spawn(conn.close(timeout_dur));
    }

    pub fn stats(&self) -> PoolStats {
        let buckets: Vec<_> = self.buckets.lock().values().cloned().collect();
        let idle = buckets.iter().map(|bucket| bucket.lock().idle.len()).sum();
        PoolStats {
            idle,
            reused_total: self.counters.reused.load(Ordering::Relaxed),
            opened_total: self.counters.opened.load(Ordering::Relaxed),
            closed_total: self.counters.closed.load(Ordering::Relaxed),
        }
    }
}

/// Periodically evicts expired idle connections until the pool is dropped.
pub fn spawn_reaper(pool: &Arc<ConnectionPool>, interval: Duration) -> JoinHandle<()> {
    let weak: Weak<ConnectionPool> = Arc::downgrade(pool);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(pool) = weak.upgrade() else {
                break;
            };
            let evicted = pool.evict_expired();
            if evicted > 0 {
                debug!(evicted, "reaped idle origin connections");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    fn key(port: u16) -> OriginKey {
        OriginKey {
            scheme: Scheme::Http,
            host: Arc::from("127.0.0.1"),
            port,
            dial_host: Arc::from("127.0.0.1"),
            dial_port: port,
        }
    }

    fn policy(max_idle: usize, timeout: Duration) -> KeepAlivePolicy {
        KeepAlivePolicy {
            enabled: true,
            timeout,
            max_idle,
        }
    }

    /// Opens a client connection and keeps the accepted server half so the test controls it.
    async fn open(listener: &TcpListener) -> Result<(PooledConnection, TcpStream)> {
        let addr = listener.local_addr()?;
        let client = TcpStream::connect(addr).await?;
        let (server, _) = listener.accept().await?;
        let conn = PooledConnection::new(UpstreamIo::Plain(client), key(addr.port()), addr);
        Ok((conn, server))
    }

    #[tokio::test]
    async fn reuses_most_recent_connection_first() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let pool = ConnectionPool::new(Duration::from_secs(1));
        let (first, _s1) = open(&listener).await?;
        let (second, _s2) = open(&listener).await?;
        let first_local = first.io.get_ref_local();
        let second_local = second.io.get_ref_local();
        let keep = policy(4, Duration::from_secs(30));
        pool.release(first, true, &keep);
        pool.release(second, true, &keep);
        assert_eq!(pool.stats().idle, 2);

        let conn = pool.acquire(&key(port)).await.expect("pooled connection");
        assert!(conn.is_reused());
        assert_eq!(conn.state(), ConnectionState::InUse);
        assert_eq!(conn.io.get_ref_local(), second_local);
        assert_ne!(conn.io.get_ref_local(), first_local);
        assert_eq!(pool.stats().reused_total, 1);
        Ok(())
    }

    #[tokio::test]
    async fn full_bucket_closes_excess() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let pool = ConnectionPool::new(Duration::from_secs(1));
        let keep = policy(1, Duration::from_secs(30));
        let (a, _sa) = open(&listener).await?;
        let (b, _sb) = open(&listener).await?;
        pool.release(a, true, &keep);
        pool.release(b, true, &keep);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.closed_total, 1);
        Ok(())
    }

    #[tokio::test]
    async fn non_reusable_and_disabled_are_closed() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let pool = ConnectionPool::new(Duration::from_secs(1));
        let (a, _sa) = open(&listener).await?;
        let (b, _sb) = open(&listener).await?;
        pool.release(a, false, &policy(4, Duration::from_secs(30)));
        pool.release(b, true, &KeepAlivePolicy::disabled());
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.closed_total, 2);
        Ok(())
    }

    #[tokio::test]
    async fn expired_connections_are_not_reused() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let pool = ConnectionPool::new(Duration::from_secs(1));
        let (conn, _server) = open(&listener).await?;
        pool.release(conn, true, &policy(4, Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(pool.acquire(&key(port)).await.is_none());
        assert_eq!(pool.stats().closed_total, 1);
        Ok(())
    }

    #[tokio::test]
    async fn reaper_evicts_expired_connections() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let pool = Arc::new(ConnectionPool::new(Duration::from_secs(1)));
        let (conn, _server) = open(&listener).await?;
        pool.release(conn, true, &policy(4, Duration::from_millis(20)));
        let reaper = spawn_reaper(&pool, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.stats().idle, 0);
        drop(pool);
        tokio::time::timeout(Duration::from_secs(1), reaper).await??;
        Ok(())
    }

    #[tokio::test]
    async fn emptied_buckets_leave_the_map() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let pool = ConnectionPool::new(Duration::from_secs(1));
        let mut servers = Vec::new();
        for offset in 0..50u16 {
            let client = TcpStream::connect(addr).await?;
            let (server, _) = listener.accept().await?;
            servers.push(server);
            let conn = PooledConnection::new(UpstreamIo::Plain(client), key(20_000 + offset), addr);
            pool.release(conn, true, &policy(4, Duration::from_millis(20)));
        }
        assert_eq!(pool.buckets.lock().len(), 50);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pool.evict_expired(), 50);
        assert!(pool.buckets.lock().is_empty());

        let (conn, _server) = open(&listener).await?;
        pool.release(conn, true, &policy(4, Duration::from_secs(30)));
        assert!(pool.acquire(&key(addr.port())).await.is_some());
        assert_eq!(pool.buckets.lock().len(), 1);
        assert!(pool.acquire(&key(addr.port())).await.is_none());
        assert!(pool.buckets.lock().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn origin_closed_connection_is_discarded_on_acquire() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let pool = ConnectionPool::new(Duration::from_secs(1));
        let (conn, server) = open(&listener).await?;
        pool.release(conn, true, &policy(4, Duration::from_secs(30)));
        drop(server);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool.acquire(&key(port)).await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn unsolicited_bytes_make_connection_stale() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let pool = ConnectionPool::new(Duration::from_secs(1));
        let (conn, mut server) = open(&listener).await?;
        pool.release(conn, true, &policy(4, Duration::from_secs(30)));
        server.write_all(b"HTTP/1.1 408 Request Timeout\r\n\r\n").await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool.acquire(&key(port)).await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn healthy_idle_connection_is_not_stale() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let pool = ConnectionPool::new(Duration::from_secs(1));
        let (conn, _server) = open(&listener).await?;
        pool.release(conn, true, &policy(4, Duration::from_secs(30)));
        assert!(pool.acquire(&key(port)).await.is_some());
        Ok(())
    }

    trait LocalAddr {
        fn get_ref_local(&self) -> SocketAddr;
    }

    impl LocalAddr for BufReader<UpstreamIo> {
        fn get_ref_local(&self) -> SocketAddr {
            match self.get_ref() {
                UpstreamIo::Plain(stream) => stream.local_addr().unwrap(),
                UpstreamIo::Tls(stream) => stream.get_ref().0.local_addr().unwrap(),
            }
        }
    }
}
