use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::core::error::CacheError;

// ---------------------------------------------------------------------------
// MemcacheClient trait
// ---------------------------------------------------------------------------

/// The subset of memcache the metadata cache needs.
pub trait MemcacheClient: Send + Sync + 'static {
    /// Batch get. Keys that are absent are omitted from the result.
    fn get_multi(
        &self,
        keys: &[String],
    ) -> impl Future<Output = Result<HashMap<String, Bytes>, CacheError>> + Send;

    /// Store only if absent. `CacheError::AlreadyExists` when the key is set.
    fn add(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Store unconditionally.
    fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;
}

// ---------------------------------------------------------------------------
// InMemoryMemcache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry {
    data: Bytes,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

/// In-process memcache stand-in: LRU bounded by entry count, TTL per entry.
pub struct InMemoryMemcache {
    cache: Mutex<LruCache<String, CacheEntry>>,
}

impl InMemoryMemcache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Look up a live entry, dropping it if its TTL has passed.
    fn live(cache: &mut LruCache<String, CacheEntry>, key: &str) -> Option<Bytes> {
        let expired = cache.get(key)?.is_expired();
        if expired {
            cache.pop(key);
            trace!(key, "cache entry expired");
            return None;
        }
        cache.get(key).map(|e| e.data.clone())
    }

    fn insert(&self, key: &str, value: Bytes, ttl: Duration) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(
            key.to_string(),
            CacheEntry {
                data: value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryMemcache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl MemcacheClient for InMemoryMemcache {
    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Bytes>, CacheError> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        Ok(keys
            .iter()
            .filter_map(|k| Self::live(&mut cache, k).map(|v| (k.clone(), v)))
            .collect())
    }

    async fn add(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if Self::live(&mut cache, key).is_some() {
                return Err(CacheError::AlreadyExists {
                    key: key.to_string(),
                });
            }
        }
        self.insert(key, value, ttl);
        Ok(())
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.insert(key, value, ttl);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemcachedClient (ASCII protocol)
// ---------------------------------------------------------------------------

/// Largest item memcached accepts by default.
const MAX_VALUE_BYTES: usize = 1024 * 1024;

/// Longest key memcached accepts.
const MAX_KEY_BYTES: usize = 250;

/// Expirations above this many seconds are read by memcached as unix timestamps.
const RELATIVE_EXPIRY_LIMIT_SECS: u64 = 60 * 60 * 24 * 30;

/// Client for a memcached server speaking the ASCII protocol.
///
/// Holds one connection, opened lazily and dropped after any I/O or
/// protocol error so the next call reconnects.
pub struct MemcachedClient {
    addr: String,
    io_timeout: Duration,
    conn: tokio::sync::Mutex<Option<BufStream<TcpStream>>>,
}

impl MemcachedClient {
    pub fn new(addr: &str, io_timeout: Duration) -> Self {
        Self {
            addr: addr.to_string(),
            io_timeout,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    async fn connection<'a>(
        &self,
        slot: &'a mut Option<BufStream<TcpStream>>,
    ) -> Result<&'a mut BufStream<TcpStream>, CacheError> {
        if slot.is_none() {
            let stream = tokio::time::timeout(self.io_timeout, TcpStream::connect(&self.addr))
                .await
                .map_err(|_| timed_out("connect"))??;
            stream.set_nodelay(true)?;
            debug!(addr = %self.addr, "connected to memcached");
            *slot = Some(BufStream::new(stream));
        }
        slot.as_mut().ok_or_else(|| CacheError::Protocol {
            reason: "connection unavailable".to_string(),
        })
    }

    /// Apply the I/O timeout and drop the connection on failure.
    fn finish<T>(
        &self,
        slot: &mut Option<BufStream<TcpStream>>,
        result: Result<Result<T, CacheError>, tokio::time::error::Elapsed>,
    ) -> Result<T, CacheError> {
        let result = result.unwrap_or_else(|_| Err(timed_out("request")));
        if let Err(e) = &result {
            if !matches!(e, CacheError::AlreadyExists { .. }) {
                warn!(addr = %self.addr, error = %e, "memcached request failed, dropping connection");
                *slot = None;
            }
        }
        result
    }

    async fn store(
        &self,
        verb: &str,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        validate_key(key)?;
        let exptime = exptime_for(ttl, chrono::Utc::now().timestamp() as u64);
        let mut guard = self.conn.lock().await;
        let conn = self.connection(&mut guard).await?;
        let result = tokio::time::timeout(self.io_timeout, async {
            write_store_command(conn, verb, key, &value, exptime).await?;
            read_store_response(conn, key).await
        })
        .await;
        self.finish(&mut guard, result)
    }
}

impl MemcacheClient for MemcachedClient {
    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Bytes>, CacheError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        for key in keys {
            validate_key(key)?;
        }
        let mut guard = self.conn.lock().await;
        let conn = self.connection(&mut guard).await?;
        let result = tokio::time::timeout(self.io_timeout, async {
            write_get_command(conn, keys).await?;
            read_get_response(conn).await
        })
        .await;
        self.finish(&mut guard, result)
    }

    async fn add(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.store("add", key, value, ttl).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.store("set", key, value, ttl).await
    }
}

fn timed_out(op: &str) -> CacheError {
    CacheError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("memcached {} timed out", op),
    ))
}

fn protocol(reason: impl Into<String>) -> CacheError {
    CacheError::Protocol {
        reason: reason.into(),
    }
}

fn validate_key(key: &str) -> Result<(), CacheError> {
    if key.is_empty()
        || key.len() > MAX_KEY_BYTES
        || key.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control())
    {
        return Err(protocol(format!("invalid key {:?}", key)));
    }
    Ok(())
}

/// memcached reads exptime above 30 days as an absolute unix time.
fn exptime_for(ttl: Duration, now_unix: u64) -> u64 {
    let secs = ttl.as_secs();
    if secs <= RELATIVE_EXPIRY_LIMIT_SECS {
        secs
    } else {
        now_unix + secs
    }
}

async fn write_get_command<W>(w: &mut W, keys: &[String]) -> Result<(), CacheError>
where
    W: AsyncWrite + Unpin,
{
    let mut cmd = String::from("get");
    for key in keys {
        cmd.push(' ');
        cmd.push_str(key);
    }
    cmd.push_str("\r\n");
    w.write_all(cmd.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

async fn write_store_command<W>(
    w: &mut W,
    verb: &str,
    key: &str,
    value: &[u8],
    exptime: u64,
) -> Result<(), CacheError>
where
    W: AsyncWrite + Unpin,
{
    if value.len() > MAX_VALUE_BYTES {
        return Err(protocol(format!("value of {} bytes too large", value.len())));
    }
    let header = format!("{} {} 0 {} {}\r\n", verb, key, exptime, value.len());
    w.write_all(header.as_bytes()).await?;
    w.write_all(value).await?;
    w.write_all(b"\r\n").await?;
    w.flush().await?;
    Ok(())
}

async fn read_line<R>(r: &mut R) -> Result<String, CacheError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = r.read_line(&mut line).await?;
    if n == 0 {
        return Err(CacheError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "memcached closed the connection",
        )));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Map the generic error replies shared by every command.
fn error_reply(line: &str) -> Option<CacheError> {
    if line == "ERROR" {
        Some(protocol("server rejected command"))
    } else if let Some(msg) = line.strip_prefix("CLIENT_ERROR ") {
        Some(protocol(msg))
    } else {
        line.strip_prefix("SERVER_ERROR ").map(|msg| CacheError::Server {
            reason: msg.to_string(),
        })
    }
}

async fn read_get_response<R>(r: &mut R) -> Result<HashMap<String, Bytes>, CacheError>
where
    R: AsyncBufRead + Unpin,
{
    let mut out = HashMap::new();
    loop {
        let line = read_line(r).await?;
        if line == "END" {
            return Ok(out);
        }
        if let Some(err) = error_reply(&line) {
            return Err(err);
        }

        // VALUE <key> <flags> <bytes> [<cas unique>]
        let mut parts = line.split_ascii_whitespace();
        if parts.next() != Some("VALUE") {
            return Err(protocol(format!("unexpected line {:?}", line)));
        }
        let key = parts
            .next()
            .ok_or_else(|| protocol("VALUE without key"))?
            .to_string();
        let _flags = parts.next();
        let len: usize = parts
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| protocol(format!("bad VALUE line {:?}", line)))?;
        if len > MAX_VALUE_BYTES {
            return Err(protocol(format!("value of {} bytes too large", len)));
        }

        let mut data = vec![0u8; len + 2];
        r.read_exact(&mut data).await?;
        if !data.ends_with(b"\r\n") {
            return Err(protocol("value not terminated by CRLF"));
        }
        data.truncate(len);
        out.insert(key, Bytes::from(data));
    }
}

async fn read_store_response<R>(r: &mut R, key: &str) -> Result<(), CacheError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(r).await?;
    match line.as_str() {
        "STORED" => Ok(()),
        "NOT_STORED" | "EXISTS" => Err(CacheError::AlreadyExists {
            key: key.to_string(),
        }),
        other => Err(error_reply(other)
            .unwrap_or_else(|| protocol(format!("unexpected reply {:?}", other)))),
    }
}

// ---------------------------------------------------------------------------
// Runtime selection
// ---------------------------------------------------------------------------

/// Memcache client chosen at startup.
pub enum MemcacheBackend {
    InMemory(InMemoryMemcache),
    Memcached(MemcachedClient),
}

impl MemcacheClient for MemcacheBackend {
    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Bytes>, CacheError> {
        match self {
            MemcacheBackend::InMemory(c) => c.get_multi(keys).await,
            MemcacheBackend::Memcached(c) => c.get_multi(keys).await,
        }
    }

    async fn add(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        match self {
            MemcacheBackend::InMemory(c) => c.add(key, value, ttl).await,
            MemcacheBackend::Memcached(c) => c.add(key, value, ttl).await,
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        match self {
            MemcacheBackend::InMemory(c) => c.set(key, value, ttl).await,
            MemcacheBackend::Memcached(c) => c.set(key, value, ttl).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;
    use tokio::net::TcpListener;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_in_memory_add_does_not_overwrite() {
        let cache = InMemoryMemcache::new(16);
        cache.add("k", Bytes::from("a"), TTL).await.unwrap();
        let err = cache.add("k", Bytes::from("b"), TTL).await.unwrap_err();
        assert!(matches!(err, CacheError::AlreadyExists { .. }));

        let got = cache.get_multi(&["k".to_string()]).await.unwrap();
        assert_eq!(got["k"], Bytes::from("a"));

        cache.set("k", Bytes::from("c"), TTL).await.unwrap();
        let got = cache.get_multi(&["k".to_string()]).await.unwrap();
        assert_eq!(got["k"], Bytes::from("c"));
    }

    #[tokio::test]
    async fn test_in_memory_ttl_expiry() {
        let cache = InMemoryMemcache::new(16);
        cache
            .set("k", Bytes::from("a"), Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.get_multi(&["k".to_string()]).await.unwrap().is_empty());
        // Expired entries do not block add.
        cache.add("k", Bytes::from("b"), TTL).await.unwrap();
    }

    #[tokio::test]
    async fn test_in_memory_lru_eviction() {
        let cache = InMemoryMemcache::new(2);
        cache.set("a", Bytes::from("1"), TTL).await.unwrap();
        cache.set("b", Bytes::from("2"), TTL).await.unwrap();
        cache.set("c", Bytes::from("3"), TTL).await.unwrap();
        assert_eq!(cache.len(), 2);
        let got = cache
            .get_multi(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert!(!got.contains_key("a"));
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn test_parse_get_response() {
        let raw: &[u8] = b"VALUE mediaproxy:a 0 5\r\nhello\r\nVALUE mediaproxy:b 0 0 17\r\n\r\nEND\r\n";
        let mut r = BufReader::new(raw);
        let got = read_get_response(&mut r).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got["mediaproxy:a"], Bytes::from("hello"));
        assert_eq!(got["mediaproxy:b"], Bytes::new());
    }

    #[tokio::test]
    async fn test_parse_errors() {
        let mut r = BufReader::new(&b"SERVER_ERROR out of memory\r\n"[..]);
        assert!(matches!(
            read_get_response(&mut r).await.unwrap_err(),
            CacheError::Server { .. }
        ));

        let mut r = BufReader::new(&b"VALUE k 0 3\r\nabcdEND\r\n"[..]);
        assert!(read_get_response(&mut r).await.is_err());

        let mut r = BufReader::new(&b"NOT_STORED\r\n"[..]);
        assert!(matches!(
            read_store_response(&mut r, "k").await.unwrap_err(),
            CacheError::AlreadyExists { .. }
        ));

        let mut r = BufReader::new(&b""[..]);
        assert!(matches!(read_store_response(&mut r, "k").await.unwrap_err(), CacheError::Io(_)));
    }

    #[tokio::test]
    async fn test_store_command_format() {
        let mut out = Vec::new();
        write_store_command(&mut out, "add", "mediaproxy:a", b"{}", 604800)
            .await
            .unwrap();
        assert_eq!(out, b"add mediaproxy:a 0 604800 2\r\n{}\r\n");
    }

    #[test]
    fn test_exptime() {
        assert_eq!(exptime_for(Duration::from_secs(604_800), 1_000), 604_800);
        assert_eq!(
            exptime_for(Duration::from_secs(RELATIVE_EXPIRY_LIMIT_SECS + 1), 1_000),
            1_000 + RELATIVE_EXPIRY_LIMIT_SECS + 1
        );
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("mediaproxy:_q-DEX7MXsZYYDz63Ycwtw").is_ok());
        assert!(validate_key("has space").is_err());
        assert!(validate_key("").is_err());
        assert!(validate_key(&"k".repeat(251)).is_err());
    }

    /// Minimal memcached speaking enough of the ASCII protocol for the client.
    async fn fake_memcached() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = BufStream::new(socket);
            let mut items: HashMap<String, Vec<u8>> = HashMap::new();
            loop {
                let Ok(line) = read_line(&mut stream).await else {
                    return;
                };
                let parts: Vec<&str> = line.split(' ').collect();
                match parts[0] {
                    "get" => {
                        for key in &parts[1..] {
                            if let Some(v) = items.get(*key) {
                                let header = format!("VALUE {} 0 {}\r\n", key, v.len());
                                stream.write_all(header.as_bytes()).await.unwrap();
                                stream.write_all(v).await.unwrap();
                                stream.write_all(b"\r\n").await.unwrap();
                            }
                        }
                        stream.write_all(b"END\r\n").await.unwrap();
                    }
                    verb @ ("set" | "add") => {
                        let len: usize = parts[4].parse().unwrap();
                        let mut data = vec![0u8; len + 2];
                        stream.read_exact(&mut data).await.unwrap();
                        data.truncate(len);
                        let key = parts[1].to_string();
                        if verb == "add" && items.contains_key(&key) {
                            stream.write_all(b"NOT_STORED\r\n").await.unwrap();
                        } else {
                            items.insert(key, data);
                            stream.write_all(b"STORED\r\n").await.unwrap();
                        }
                    }
                    _ => stream.write_all(b"ERROR\r\n").await.unwrap(),
                }
                stream.flush().await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_memcached_client_against_fake_server() {
        let addr = fake_memcached().await;
        let client = MemcachedClient::new(&addr, Duration::from_secs(2));

        client.set("a", Bytes::from("one"), TTL).await.unwrap();
        client.add("b", Bytes::from("two"), TTL).await.unwrap();
        let err = client.add("a", Bytes::from("x"), TTL).await.unwrap_err();
        assert!(matches!(err, CacheError::AlreadyExists { .. }));

        let got = client
            .get_multi(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got["a"], Bytes::from("one"));
        assert_eq!(got["b"], Bytes::from("two"));
    }

    #[tokio::test]
    async fn test_memcached_client_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = MemcachedClient::new(&addr, Duration::from_millis(500));
        assert!(client.get_multi(&["a".to_string()]).await.is_err());
    }
}
