use std::net::SocketAddr;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::{RawResponse, read_response};

/// A raw client connection to the proxy's accept socket.
pub struct ProxyClient {
    reader: BufReader<TcpStream>,
}

impl ProxyClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Ok(Self {
            reader: BufReader::new(TcpStream::connect(addr).await?),
        })
    }

    pub async fn send(&mut self, request: impl AsRef<[u8]>) -> Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(request.as_ref()).await?;
        stream.flush().await?;
        Ok(())
    }

    pub async fn get(&mut self, path: &str) -> Result<RawResponse> {
        self.send(format!("GET {path} HTTP/1.1\r\nHost: gateway.test\r\n\r\n"))
            .await?;
        self.read_response().await
    }

    pub async fn read_response(&mut self) -> Result<RawResponse> {
        read_response(&mut self.reader, false).await
    }

    pub async fn read_head_response(&mut self) -> Result<RawResponse> {
        read_response(&mut self.reader, true).await
    }

    /// Reads until the proxy closes the connection.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut rest = Vec::new();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            self.reader.read_to_end(&mut rest),
        )
        .await??;
        Ok(rest)
    }

    pub async fn shutdown(mut self) {
        self.reader.get_mut().shutdown().await.ok();
    }

    pub fn reader_mut(&mut self) -> &mut BufReader<TcpStream> {
        &mut self.reader
    }
}
