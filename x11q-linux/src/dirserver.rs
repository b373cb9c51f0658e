//! Directory HTTP service: `PUT`, `GET` and `DELETE /v1/records/{key}` over a
//! [`MemoryDirectory`] with server-side expiry. One request per connection.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use x11q_core::directory::RecordError;
use x11q_core::{LookupKey, NodeId, SignatureBytes};

use crate::cancel::CancelToken;
use crate::directory::{Directory, DirectoryError, MemoryDirectory, RecordBody};

const MAX_HEAD: usize = 16 * 1024;
const MAX_BODY: usize = 64 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DirectoryServer {
    listener: TcpListener,
    store: MemoryDirectory,
}

impl DirectoryServer {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            store: MemoryDirectory::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, cancel: CancelToken) {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "directory listening");
        loop {
            let (stream, remote) = tokio::select! {
                _ = cancel.cancelled() => break,
                a = self.listener.accept() => match a {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };
            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(stream, store).await {
                    tracing::debug!(%remote, error = %e, "directory request failed");
                }
            });
        }
    }
}

struct Request {
    method: String,
    path: String,
    body: Vec<u8>,
}

async fn handle_client(mut stream: TcpStream, store: MemoryDirectory) -> io::Result<()> {
    let request = match tokio::time::timeout(READ_TIMEOUT, read_request(&mut stream)).await {
        Ok(r) => r?,
        Err(_) => return Ok(()),
    };
    let (status, body) = match request {
        Some(req) => route(&store, req).await,
        None => (400, Vec::new()),
    };
    stream.write_all(&response(status, &body)).await?;
    stream.shutdown().await
}

/// `None` for a request that does not parse.
async fn read_request(stream: &mut TcpStream) -> io::Result<Option<Request>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        let head_len = match req.parse(&buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) if buf.len() < MAX_HEAD => continue,
            _ => return Ok(None),
        };
        let content_length = req
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("Content-Length"))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if content_length > MAX_BODY {
            return Ok(None);
        }
        let (Some(method), Some(path)) = (req.method, req.path) else {
            return Ok(None);
        };
        let (method, path) = (method.to_string(), path.to_string());

        let mut body = buf.split_off(head_len);
        while body.len() < content_length {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(content_length);
        return Ok(Some(Request { method, path, body }));
    }
}

async fn route(store: &MemoryDirectory, req: Request) -> (u16, Vec<u8>) {
    let (path, query) = req.path.split_once('?').unwrap_or((req.path.as_str(), ""));
    let Some(key) = path
        .strip_prefix("/v1/records/")
        .and_then(|k| k.parse::<LookupKey>().ok())
    else {
        return (404, Vec::new());
    };
    match req.method.as_str() {
        "PUT" => {
            let record = serde_json::from_slice::<RecordBody>(&req.body)
                .ok()
                .and_then(|b| b.into_record(key).ok());
            match record {
                Some(record) => match store.publish(&record).await {
                    Ok(()) => (204, Vec::new()),
                    Err(DirectoryError::Record(RecordError::Full)) => (503, Vec::new()),
                    Err(_) => (400, Vec::new()),
                },
                None => (400, Vec::new()),
            }
        }
        "GET" => match store.lookup(&key).await {
            Ok(Some(record)) => match serde_json::to_vec(&RecordBody::from_record(&record)) {
                Ok(body) => (200, body),
                Err(_) => (500, Vec::new()),
            },
            _ => (404, Vec::new()),
        },
        "DELETE" => {
            let owner = query_param(query, "owner").and_then(|v| v.parse::<NodeId>().ok());
            let signature = query_param(query, "sig").and_then(|v| {
                let mut bytes = [0u8; 64];
                hex::decode_to_slice(v, &mut bytes).ok()?;
                Some(SignatureBytes::from_bytes(bytes))
            });
            match (owner, signature) {
                (Some(owner), Some(signature)) => {
                    match store.withdraw(&key, &owner, &signature).await {
                        Ok(()) => (204, Vec::new()),
                        Err(_) => (403, Vec::new()),
                    }
                }
                _ => (400, Vec::new()),
            }
        }
        _ => (405, Vec::new()),
    }
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .find_map(|kv| kv.strip_prefix(name)?.strip_prefix('='))
}

fn response(status: u16, body: &[u8]) -> Vec<u8> {
    let reason = match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    };
    let mut out = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}
