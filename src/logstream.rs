//! Forwards a running instance's output to its sink as lines arrive.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::output::{SharedSink, StreamKind};

pub type OutputReader = Box<dyn AsyncRead + Send + Unpin>;

/// Live output of one instance.
///
/// `guard` is a helper process (e.g. `docker logs -f`) whose lifetime bounds
/// the readers; it is spawned with `kill_on_drop` and released on detach.
#[derive(Default)]
pub struct OutputStream {
    pub readers: Vec<(StreamKind, OutputReader)>,
    pub guard: Option<Child>,
}

impl OutputStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reader(
        mut self,
        stream: StreamKind,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        self.readers.push((stream, Box::new(reader)));
        self
    }

    pub fn with_guard(mut self, child: Child) -> Self {
        self.guard = Some(child);
        self
    }
}

/// Reader tasks for one instance. Dropping this does not stop them; call `detach`.
pub struct Attachment {
    tasks: Vec<JoinHandle<()>>,
}

impl Attachment {
    pub fn detach(self) {
        for task in self.tasks {
            task.abort();
        }
    }

    /// Waits up to `limit` for every reader to reach end of stream, then
    /// aborts whatever is still open. Returns whether everything drained.
    pub async fn drain(mut self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        let mut drained = true;
        for task in self.tasks.iter_mut() {
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                drained = false;
                break;
            }
        }
        if !drained {
            self.detach();
        }
        drained
    }
}

/// Spawns one reader task per stream and returns immediately.
pub fn attach(project: &str, output: OutputStream, sink: SharedSink) -> Attachment {
    let mut tasks = Vec::with_capacity(output.readers.len() + 1);
    for (stream, reader) in output.readers {
        let sink = sink.clone();
        let project = project.to_string();
        tasks.push(tokio::spawn(async move {
            read_stream(stream, reader, &sink).await;
            debug!(project = %project, ?stream, "output stream closed");
        }));
    }
    if let Some(mut guard) = output.guard {
        tasks.push(tokio::spawn(async move {
            let _ = guard.wait().await;
        }));
    }
    Attachment { tasks }
}

async fn read_stream<R>(stream: StreamKind, reader: R, sink: &SharedSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                sink.append(stream, line.trim_end_matches(['\r', '\n']));
            }
            Err(err) => {
                debug!(error = %err, "output read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use super::*;
    use crate::output::MemorySink;

    #[tokio::test]
    async fn forwards_lines_in_order() {
        let sink = Arc::new(MemorySink::default());
        let output = OutputStream::new()
            .with_reader(StreamKind::Stdout, Cursor::new(b"one\ntwo\r\nthree".to_vec()));
        assert!(attach("api", output, sink.clone()).drain(Duration::from_secs(5)).await);
        assert_eq!(sink.texts(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let sink = Arc::new(MemorySink::default());
        let output = OutputStream::new()
            .with_reader(StreamKind::Stderr, Cursor::new(b"bad \xff byte\n".to_vec()));
        attach("api", output, sink.clone()).drain(Duration::from_secs(5)).await;
        assert_eq!(sink.lines(), vec![(StreamKind::Stderr, "bad \u{fffd} byte".to_string())]);
    }

    #[tokio::test]
    async fn attach_does_not_block_on_open_stream() {
        let sink = Arc::new(MemorySink::default());
        let (mut writer, reader) = tokio::io::duplex(64);
        let attachment = attach(
            "api",
            OutputStream::new().with_reader(StreamKind::Stdout, reader),
            sink.clone(),
        );

        tokio::io::AsyncWriteExt::write_all(&mut writer, b"hello\n")
            .await
            .unwrap();
        for _ in 0..50 {
            if !sink.texts().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.texts(), vec!["hello"]);
        attachment.detach();
    }

    #[tokio::test]
    async fn drain_gives_up_on_a_stream_that_stays_open() {
        let sink = Arc::new(MemorySink::default());
        let (mut writer, reader) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut writer, b"last words\n")
            .await
            .unwrap();
        let attachment = attach(
            "api",
            OutputStream::new().with_reader(StreamKind::Stdout, reader),
            sink.clone(),
        );
        assert!(!attachment.drain(Duration::from_millis(200)).await);
        assert_eq!(sink.texts(), vec!["last words"]);
    }
}
