//! Serial console taps.
//!
//! Each enabled serial socket is drained into a log file with a short
//! per-read timeout; draining stops after 50 consecutive idle reads
//! (about half a second of silence) or EOF.

use std::path::Path;
use std::time::Duration;

use log::debug;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

const READ_TIMEOUT: Duration = Duration::from_millis(10);
const MAX_IDLE_READS: u32 = 50;

/// One open console tap: a connected stream socket and its log file.
pub struct SerialTap {
    stream: UnixStream,
    logfile: File,
}

impl SerialTap {
    /// Connects to the serial socket and creates (truncates) the log file.
    pub async fn open<P: AsRef<Path>, Q: AsRef<Path>>(
        socket_path: P,
        logfile_path: Q,
    ) -> std::io::Result<Self> {
        let stream = UnixStream::connect(socket_path.as_ref()).await?;
        let logfile = File::create(logfile_path.as_ref()).await?;
        Ok(SerialTap { stream, logfile })
    }

    /// Reads until the console has been silent for
    /// `MAX_IDLE_READS * READ_TIMEOUT`.
    pub async fn drain(&mut self) -> std::io::Result<()> {
        let mut buffer = [0u8; 8192];
        let mut idle_reads = 0;
        while idle_reads < MAX_IDLE_READS {
            match tokio::time::timeout(READ_TIMEOUT, self.stream.read(&mut buffer)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    self.logfile.write_all(&buffer[..n]).await?;
                    idle_reads = 0;
                }
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) => {
                    idle_reads += 1;
                }
            }
        }
        debug!("serial drain finished");
        Ok(())
    }

    /// Flushes the log file and closes the tap.
    pub async fn close(mut self) -> std::io::Result<()> {
        self.logfile.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drains_console_bytes_into_the_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("serial0.sock");
        let log = dir.path().join("console0.log");

        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"OpenSBI v1.4\nKernel panic\n").await.unwrap();
            // keep the socket open; the tap must stop on idleness
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let mut tap = SerialTap::open(&socket, &log).await.unwrap();
        tap.drain().await.unwrap();
        tap.close().await.unwrap();
        server.abort();

        let contents = std::fs::read_to_string(&log).unwrap();
        assert!(contents.contains("OpenSBI v1.4"));
        assert!(contents.contains("Kernel panic"));
    }

    #[tokio::test]
    async fn drain_stops_on_eof() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("serial0.sock");
        let log = dir.path().join("console0.log");

        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"bye").await.unwrap();
            // dropping the stream closes the connection
        });

        let mut tap = SerialTap::open(&socket, &log).await.unwrap();
        tap.drain().await.unwrap();
        tap.close().await.unwrap();
        server.await.unwrap();

        assert_eq!(std::fs::read(&log).unwrap(), b"bye");
    }
}
