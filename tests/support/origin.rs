use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const READ_TIMEOUT: StdDuration = StdDuration::from_secs(5);

/// A request as it arrived at the origin, body de-chunked.
#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub chunked: bool,
    pub peer: Option<SocketAddr>,
    /// Zero-based index of the origin connection that carried the request.
    pub connection: usize,
}

impl OriginRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .collect()
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }
}

/// What a scripted origin does with one request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Writes the bytes and keeps the connection for the next request.
    Respond(Vec<u8>),
    /// Writes the bytes and closes the connection.
    RespondAndClose(Vec<u8>),
    /// Never answers; the connection stays open until the test ends.
    Silent,
    /// Closes the connection without writing anything.
    Close,
}

/// Builds a complete response with a Content-Length body.
pub fn http_response(status: u16, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {status} {}\r\n", reason(status));
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

fn reason(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        307 => "Temporary Redirect",
        401 => "Unauthorized",
        404 => "Not Found",
        _ => "Status",
    }
}

pub struct TestOrigin {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<OriginRequest>>>,
    handle: JoinHandle<()>,
}

impl TestOrigin {
    /// Serves every connection with `handler`, one request at a time.
    pub async fn spawn<F>(handler: F) -> Result<Self>
    where
        F: Fn(&OriginRequest) -> Reply + Send + Sync + 'static,
    {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(handler);
        let log = requests.clone();
        Self::spawn_inner(requests, move |stream, peer, connection| {
            let handler = handler.clone();
            let log = log.clone();
            async move {
                let _ = serve_scripted(stream, peer, connection, handler, log).await;
            }
        })
        .await
    }

    /// Hands each accepted connection to `handler` untouched.
    pub async fn spawn_raw<F, Fut>(handler: F) -> Result<Self>
    where
        F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn_inner(Arc::new(Mutex::new(Vec::new())), move |stream, _, _| {
            handler(stream)
        })
        .await
    }

    async fn spawn_inner<F, Fut>(requests: Arc<Mutex<Vec<OriginRequest>>>, handler: F) -> Result<Self>
    where
        F: Fn(TcpStream, SocketAddr, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let connection = counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handler(stream, peer, connection));
            }
        });
        Ok(Self {
            addr,
            accepted,
            requests,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn uri(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Number of TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<OriginRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    pub fn last_request(&self) -> Option<OriginRequest> {
        self.requests().pop()
    }
}

impl Drop for TestOrigin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_scripted<F>(
    stream: TcpStream,
    peer: SocketAddr,
    connection: usize,
    handler: Arc<F>,
    log: Arc<Mutex<Vec<OriginRequest>>>,
) -> Result<()>
where
    F: Fn(&OriginRequest) -> Reply + Send + Sync + 'static,
{
    let mut reader = BufReader::new(stream);
    while let Some(mut request) = read_origin_request(&mut reader).await? {
        request.peer = Some(peer);
        request.connection = connection;
        let reply = handler(&request);
        log.lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(request);
        match reply {
            Reply::Respond(bytes) => {
                reader.get_mut().write_all(&bytes).await?;
                reader.get_mut().flush().await?;
            }
            Reply::RespondAndClose(bytes) => {
                reader.get_mut().write_all(&bytes).await?;
                reader.get_mut().shutdown().await?;
                return Ok(());
            }
            Reply::Silent => {
                tokio::time::sleep(StdDuration::from_secs(60)).await;
                return Ok(());
            }
            Reply::Close => return Ok(()),
        }
    }
    Ok(())
}

async fn read_line<S>(reader: &mut BufReader<S>) -> Result<Option<String>>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let read = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .context("timed out reading request line")??;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

/// Reads one request; `None` when the peer closed cleanly between requests.
pub async fn read_origin_request<S>(reader: &mut BufReader<S>) -> Result<Option<OriginRequest>>
where
    S: AsyncRead + Unpin,
{
    let Some(request_line) = read_line(reader).await? else {
        return Ok(None);
    };
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        bail!("malformed request line '{request_line}'");
    };

    let mut headers = Vec::new();
    loop {
        let line = read_line(reader)
            .await?
            .ok_or_else(|| anyhow!("connection closed inside request head"))?;
        if line == "\r\n" {
            break;
        }
        let (name, value) = line
            .trim_end()
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed header line '{line}'"))?;
        headers.push((name.to_string(), value.trim().to_string()));
    }

    let mut request = OriginRequest {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
        body: Vec::new(),
        chunked: false,
        peer: None,
        connection: 0,
    };

    if request
        .header("transfer-encoding")
        .is_some_and(|value| value.eq_ignore_ascii_case("chunked"))
    {
        request.chunked = true;
        loop {
            let size_line = read_line(reader)
                .await?
                .ok_or_else(|| anyhow!("connection closed inside chunked body"))?;
            let size = usize::from_str_radix(size_line.trim().split(';').next().unwrap_or(""), 16)
                .with_context(|| format!("bad chunk size '{size_line}'"))?;
            if size == 0 {
                while read_line(reader).await?.is_some_and(|line| line != "\r\n") {}
                break;
            }
            let mut chunk = vec![0u8; size + 2];
            timeout(READ_TIMEOUT, reader.read_exact(&mut chunk)).await??;
            request.body.extend_from_slice(&chunk[..size]);
        }
    } else if let Some(length) = request.header("content-length") {
        let length: usize = length.parse()?;
        let mut body = vec![0u8; length];
        timeout(READ_TIMEOUT, reader.read_exact(&mut body)).await??;
        request.body = body;
    }
    Ok(Some(request))
}
