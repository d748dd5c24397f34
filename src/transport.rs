//! Host end of the VM's serial port.
//!
//! VirtualBox exposes a UART in host-pipe server mode as a Unix domain socket;
//! the harness connects to it once per boot attempt.
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum TransportError {
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },
    ConnectTimeout {
        path: PathBuf,
        timeout: Duration,
    },
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Connect { path, source } => {
                write!(f, "failed to connect to serial socket {}: {}", path.display(), source)
            }
            TransportError::ConnectTimeout { path, timeout } => write!(
                f,
                "timed out after {}s connecting to serial socket {}",
                timeout.as_secs_f64(),
                path.display()
            ),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Connect { source, .. } => Some(source),
            TransportError::ConnectTimeout { .. } => None,
        }
    }
}

/// Where and how to reach the serial socket.
#[derive(Debug, Clone)]
pub struct SerialEndpoint {
    pub path: PathBuf,
    pub connect_timeout: Duration,
}

impl SerialEndpoint {
    pub fn new(path: impl Into<PathBuf>, connect_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            connect_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Connect, giving up after `connect_timeout`.
    ///
    /// The socket only appears once the VM has opened its serial port, so a
    /// missing or not yet listening socket is retried until the timeout.
    pub async fn connect(&self) -> Result<UnixStream, TransportError> {
        match tokio::time::timeout(self.connect_timeout, self.connect_when_ready()).await {
            Ok(Ok(stream)) => {
                tracing::debug!(path = %self.path.display(), "serial socket connected");
                Ok(stream)
            }
            Ok(Err(e)) => Err(TransportError::Connect {
                path: self.path.clone(),
                source: e,
            }),
            Err(_) => Err(TransportError::ConnectTimeout {
                path: self.path.clone(),
                timeout: self.connect_timeout,
            }),
        }
    }

    async fn connect_when_ready(&self) -> std::io::Result<UnixStream> {
        loop {
            match UnixStream::connect(&self.path).await {
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    tracing::trace!(path = %self.path.display(), error = %e, "serial socket not ready");
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_connect_to_listening_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serial.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let guest = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(b"hello\n").await.unwrap();
        });

        let endpoint = SerialEndpoint::new(&path, Duration::from_secs(3));
        let mut stream = endpoint.connect().await.unwrap();
        let mut buf = String::new();
        stream.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "hello\n");
        guest.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_missing_socket_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint =
            SerialEndpoint::new(dir.path().join("absent.sock"), Duration::from_millis(300));
        let started = std::time::Instant::now();
        let err = endpoint.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectTimeout { .. }));
        assert!(err.to_string().contains("absent.sock"));
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_connect_waits_for_late_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serial.sock");

        let late_path = path.clone();
        let guest = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let listener = UnixListener::bind(&late_path).unwrap();
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(b"freeldr\n").await.unwrap();
        });

        let endpoint = SerialEndpoint::new(&path, Duration::from_secs(3));
        let mut stream = endpoint.connect().await.unwrap();
        let mut buf = String::new();
        stream.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "freeldr\n");
        guest.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_other_errors_are_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the socket's parent directory should be.
        let plain = dir.path().join("plain");
        std::fs::write(&plain, "").unwrap();
        let path = plain.join("serial.sock");
        let endpoint = SerialEndpoint::new(&path, Duration::from_secs(3));
        let err = endpoint.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
