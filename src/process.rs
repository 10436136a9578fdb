use parking_lot::Mutex;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// How long to wait for pipe readers after the child has exited or been killed.
/// Grandchildren may keep a pipe open, so the readers are abandoned after this.
const READER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct CapturedOutput {
    /// `None` when the process was killed or terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stdout followed by stderr, the way probe drivers interleave their logging.
    pub fn combined(&self) -> String {
        let mut combined = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        combined.push_str(&self.stdout);
        if !self.stdout.is_empty() && !self.stdout.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&self.stderr);
        combined
    }
}

/// Run `command` to completion or until `timeout`, whichever comes first.
/// On timeout the child is hard-killed and whatever it printed so far is kept.
/// Dropping the returned future also kills the child.
pub async fn run_with_timeout(mut command: Command, timeout: Duration) -> io::Result<CapturedOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!("Spawning {:?} (timeout {:?})", command.as_std(), timeout);
    let start = Instant::now();
    let mut child = command.spawn()?;

    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));
    let readers = [
        child.stdout.take().map(|pipe| drain(pipe, stdout_buf.clone())),
        child.stderr.take().map(|pipe| drain(pipe, stderr_buf.clone())),
    ];

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (status?.code(), false),
        Err(_) => {
            tracing::warn!("Process exceeded {:?}, killing it", timeout);
            let _ = child.start_kill();
            let _ = child.wait().await;
            (None, true)
        }
    };

    for reader in readers.into_iter().flatten() {
        let abort = reader.abort_handle();
        if tokio::time::timeout(READER_GRACE, reader).await.is_err() {
            abort.abort();
        }
    }

    let stdout = String::from_utf8_lossy(&stdout_buf.lock()).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_buf.lock()).into_owned();

    Ok(CapturedOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        elapsed: start.elapsed(),
    })
}

fn drain<R>(mut pipe: R, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
            }
        }
    })
}
