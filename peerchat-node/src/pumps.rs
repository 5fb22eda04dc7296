//! Per-connection read pump and the single outbound pump.

use std::io;

use peerchat_core::post::is_blank_frame;
use peerchat_core::{ChatPost, Event, PeerId};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bus::Shutdown;
use crate::registry::StreamRegistry;

/// Read one newline-terminated frame of at most `max_len` bytes (terminator included).
/// `Ok(None)` means the stream ended; a partial trailing frame is discarded.
pub async fn read_frame<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(max_len as u64)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() >= max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame exceeds maximum line length",
            ));
        }
        return Ok(None);
    }
    Ok(Some(buf))
}

/// Per-connection read settings.
pub(crate) struct ReadLimits {
    pub max_line_len: usize,
    /// Set for streams we dialed: a clean EOF before this instant waits for a replacement
    /// stream from the same peer instead of retiring the connection straight away.
    pub settle_until: Option<Instant>,
}

/// Forward frames from one connection onto the bus until the stream fails, the registry
/// retires the connection (`stop` fires), or shutdown.
pub(crate) async fn read_pump<R: AsyncBufRead + Unpin>(
    registry: StreamRegistry,
    peer: PeerId,
    generation: u64,
    mut reader: R,
    mut stop: oneshot::Receiver<()>,
    mut shutdown: Shutdown,
    limits: ReadLimits,
) {
    loop {
        let frame = tokio::select! {
            _ = &mut stop => return,
            _ = shutdown.triggered() => return,
            frame = read_frame(&mut reader, limits.max_line_len) => frame,
        };
        let line = match frame {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(peer = %peer, "stream closed by peer");
                if let Some(until) = limits.settle_until {
                    // Retirement happens through `stop` if the peer's stream replaces ours.
                    tokio::select! {
                        _ = &mut stop => return,
                        _ = shutdown.triggered() => return,
                        _ = tokio::time::sleep_until(until) => {}
                    }
                }
                break;
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "read failed");
                break;
            }
        };
        if is_blank_frame(&line) {
            continue;
        }
        match ChatPost::try_decode(&line) {
            Ok(post) => registry.events().emit(Event::MessageReceived(post)),
            Err(e) => {
                warn!(peer = %peer, error = %e, "dropping malformed frame");
                registry.events().log(format!(
                    "Dropped a malformed message from {}.",
                    peer.display_id()
                ));
            }
        }
    }
    registry.close_connection(peer, generation).await;
}

/// Broadcast every locally authored post. One instance per process.
pub(crate) async fn outbound_pump(
    registry: StreamRegistry,
    mut outgoing: mpsc::UnboundedReceiver<ChatPost>,
    mut shutdown: Shutdown,
) {
    loop {
        let post = tokio::select! {
            _ = shutdown.triggered() => break,
            post = outgoing.recv() => match post {
                Some(post) => post,
                None => break,
            },
        };
        let delivered = registry.broadcast(&post.encode()).await;
        debug!(delivered, "post broadcast");
    }
}
