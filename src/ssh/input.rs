// ABOUTME: Local stdin shared by every interactive session of the process.
// ABOUTME: Read on a dedicated thread so a pending read never holds up runtime shutdown.

use std::io::{ErrorKind, Read};
use std::sync::OnceLock;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

const CHUNK_SIZE: usize = 4096;

/// Chunks read ahead of the session consuming them.
const BACKLOG: usize = 16;

type Chunks = Mutex<mpsc::Receiver<Vec<u8>>>;

/// Chunks read from this process's stdin. The reader thread starts on first
/// use and is never joined; it ends with the process.
fn local_stdin() -> &'static Chunks {
    static STDIN: OnceLock<Chunks> = OnceLock::new();
    STDIN.get_or_init(|| {
        let (tx, rx) = mpsc::channel(BACKLOG);
        let spawned = std::thread::Builder::new()
            .name("hostwire-stdin".to_string())
            .spawn(move || pump(std::io::stdin().lock(), tx));
        if let Err(e) = spawned {
            tracing::warn!("cannot start stdin reader: {e}");
        }
        Mutex::new(rx)
    })
}

/// Move `source` into `tx` until EOF, a read error, or nobody is listening.
fn pump(mut source: impl Read, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!("stdin read failed: {e}");
                break;
            }
        }
    }
}

/// Copy chunks into `remote` until the input ends, then close its write side.
async fn forward<W>(input: &mut mpsc::Receiver<Vec<u8>>, remote: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = input.recv().await {
        remote.write_all(&chunk).await?;
    }
    remote.shutdown().await
}

/// Forward local stdin into `remote` until the returned task is aborted.
/// One session holds stdin at a time; others wait for it.
pub(crate) fn forward_stdin<W>(mut remote: W) -> JoinHandle<()>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut input = local_stdin().lock().await;
        if let Err(e) = forward(&mut input, &mut remote).await {
            tracing::debug!("stdin forwarding stopped: {e}");
        }
    })
}
