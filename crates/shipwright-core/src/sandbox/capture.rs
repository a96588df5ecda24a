//! Bounded capture of child output streams.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

/// Bytes captured from one stream.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

/// Read `reader` to EOF keeping at most `cap` bytes.
///
/// Input past the cap is drained and discarded so the writer never blocks on
/// a full pipe.
pub(crate) async fn read_capped<R>(mut reader: R, cap: usize) -> std::io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(captured.bytes.len());
        if n > room {
            captured.bytes.extend_from_slice(&buf[..room]);
            captured.truncated = true;
        } else {
            captured.bytes.extend_from_slice(&buf[..n]);
        }
    }
    Ok(captured)
}

/// Spawn a capture task for an optional pipe.
pub(crate) fn spawn_capture<R>(reader: Option<R>, cap: usize) -> JoinHandle<Captured>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match reader {
            Some(r) => read_capped(r, cap).await.unwrap_or_default(),
            None => Captured::default(),
        }
    })
}

/// Wait for a capture task, giving up after `limit`.
///
/// A grandchild that escaped the process group can hold the pipe open; in
/// that case whatever was read so far is lost and the stream is reported as
/// truncated.
pub(crate) async fn collect(task: JoinHandle<Captured>, limit: Duration) -> Captured {
    let abort = task.abort_handle();
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(_join_err)) => Captured {
            bytes: Vec::new(),
            truncated: true,
        },
        Err(_elapsed) => {
            abort.abort();
            Captured {
                bytes: Vec::new(),
                truncated: true,
            }
        }
    }
}
