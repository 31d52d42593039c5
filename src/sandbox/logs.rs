//! Prefixed copying of container output to the local terminal.

use std::io::Write;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::runtime::OutputStream;

/// Writes complete lines to `out`, each starting with `prefix`.
pub struct PrefixWriter<W: Write> {
    prefix: &'static str,
    pending: Vec<u8>,
    out: W,
}

impl<W: Write> PrefixWriter<W> {
    pub fn new(prefix: &'static str, out: W) -> Self {
        Self {
            prefix,
            pending: Vec::new(),
            out,
        }
    }

    pub fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.out.write_all(self.prefix.as_bytes())?;
            self.out.write_all(&line)?;
        }
        self.out.flush()
    }

    /// Emit any trailing partial line.
    pub fn finish(mut self) -> std::io::Result<W> {
        if !self.pending.is_empty() {
            self.out.write_all(self.prefix.as_bytes())?;
            self.out.write_all(&self.pending)?;
            self.out.write_all(b"\n")?;
            self.pending.clear();
        }
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Copy `stream` to stderr with `prefix` until it ends or `token` fires.
pub fn spawn_tail(
    mut stream: OutputStream,
    prefix: &'static str,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut writer = PrefixWriter::new(prefix, std::io::stderr());
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if writer.write_chunk(&bytes).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!("Log stream for '{}' ended: {}", prefix.trim_end(), e);
                        break;
                    }
                    None => break,
                },
            }
        }
        let _ = writer.finish();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixes_each_line() {
        let mut writer = PrefixWriter::new("proxy | ", Vec::new());
        writer.write_chunk(b"first\nsec").unwrap();
        writer.write_chunk(b"ond\nthi").unwrap();
        let out = writer.finish().unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "proxy | first\nproxy | second\nproxy | thi\n"
        );
    }

    #[test]
    fn test_empty_finish_writes_nothing() {
        let writer = PrefixWriter::new("updater | ", Vec::new());
        assert!(writer.finish().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tail_stops_on_cancel() {
        let token = CancellationToken::new();
        let stream: OutputStream = futures::stream::pending().boxed();
        let handle = spawn_tail(stream, "proxy | ", token.clone());
        token.cancel();
        handle.await.unwrap();
    }
}
