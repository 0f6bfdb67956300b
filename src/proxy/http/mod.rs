mod body;
pub(crate) mod codec;
mod dispatch;
mod exchange;
mod respond;
mod upgrade;

pub use dispatch::serve_connection;

#[cfg(feature = "fuzzing")]
pub mod fuzzing {
    use std::net::SocketAddr;
    use std::time::Duration;

    use anyhow::Result;
    use tokio::io::{AsyncRead, BufReader};

    use super::body::{BodyDecoder, BodyDirection, BodyEncoder, Framing, relay_body};

    /// Parses a request head and runs the same validation the connection loop applies.
    pub async fn parse_request_head<S>(
        reader: &mut BufReader<S>,
        peer: SocketAddr,
        timeout: Duration,
        max_header_bytes: usize,
    ) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        if let Some(head) =
            super::codec::read_request_head(reader, peer, timeout, timeout, max_header_bytes)
                .await?
        {
            let _ = head.headers.validate_framing();
            let _ = crate::proxy::request::parse_http1_request(
                head.method.clone(),
                &head.target,
                head.version,
                &head.headers,
            );
        }
        Ok(())
    }

    pub async fn parse_response_head<S>(
        reader: &mut BufReader<S>,
        timeout: Duration,
        peer: SocketAddr,
        max_header_bytes: usize,
    ) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        let _ = super::codec::read_response_head(reader, timeout, peer, max_header_bytes).await?;
        Ok(())
    }

    /// Decodes a chunked body and re-encodes it chunked into a sink.
    pub async fn rechunk_body<S>(
        reader: &mut BufReader<S>,
        peer: SocketAddr,
        timeout: Duration,
    ) -> Result<u64>
    where
        S: AsyncRead + Unpin,
    {
        let mut decoder = BodyDecoder::new(Framing::Chunked, BodyDirection::Request, peer, timeout);
        let mut sink = tokio::io::sink();
        relay_body(reader, &mut decoder, &mut sink, BodyEncoder::Chunked, timeout).await
    }
}
