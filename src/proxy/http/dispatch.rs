use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::debug;

use crate::proxy::AppContext;
use crate::proxy::forward_error::{IoTimeout, MalformedRequest};
use crate::proxy::service::ServiceTable;

use super::codec::read_request_head;
use super::exchange::{ClientDisposition, handle_exchange, reject_request_head};
use super::respond::shutdown_stream;

/// Serves one accepted client connection: requests are read and forwarded one at a time until
/// either side asks to close or the connection goes idle.
pub async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    table: Arc<ServiceTable>,
    app: AppContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let settings = app.settings.clone();
    let mut reader = BufReader::new(stream);

    loop {
        let start = Instant::now();
        let head = match read_request_head(
            &mut reader,
            peer,
            settings.client_idle_timeout(),
            settings.client_timeout(),
            settings.max_request_header_size,
        )
        .await
        {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(err) if err.is::<IoTimeout>() => {
                debug!(peer = %peer, error = %err, "client stalled while sending request head");
                break;
            }
            Err(err) if err.is::<MalformedRequest>() => {
                reject_request_head(&mut reader, peer, &app, err, start).await;
                break;
            }
            Err(err) => {
                debug!(peer = %peer, error = %format!("{err:#}"), "failed to read request head");
                break;
            }
        };

        match handle_exchange(&mut reader, peer, &table, &app, head, start).await {
            ClientDisposition::KeepAlive => continue,
            ClientDisposition::Close => break,
        }
    }

    shutdown_stream(reader.get_mut(), settings.client_timeout()).await
}
