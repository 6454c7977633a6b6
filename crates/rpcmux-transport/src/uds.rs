use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::events::{Disposable, DriverEvents};
use crate::traits::{CloseCallback, ErrorCallback, MessageCallback, TransportDriver};

/// Default maximum message size carried by the socket driver: 16 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Listening unix domain socket that yields [`UnixSocketDriver`]s.
///
/// The socket file is created with owner-only permissions and removed on
/// drop, unless the path was replaced by something else in the meantime.
pub struct UnixSocketListener {
    listener: tokio::net::UnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
    max_message_size: usize,
}

impl UnixSocketListener {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on a filesystem-path unix domain socket.
    ///
    /// A stale socket file at `path` is removed first; any other kind of file
    /// makes the bind fail. Must be called inside a tokio runtime.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if !metadata.file_type().is_socket() {
                return Err(TransportError::Bind {
                    path,
                    source: std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                });
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(|e| TransportError::Bind {
                path: path.clone(),
                source: e,
            })?;
        }

        let listener =
            tokio::net::UnixListener::bind(&path).map_err(|e| TransportError::Bind {
                path: path.clone(),
                source: e,
            })?;

        std::fs::set_permissions(
            &path,
            std::fs::Permissions::from_mode(Self::DEFAULT_SOCKET_MODE),
        )
        .map_err(|e| TransportError::Bind {
            path: path.clone(),
            source: e,
        })?;
        let created = std::fs::symlink_metadata(&path).map_err(|e| TransportError::Bind {
            path: path.clone(),
            source: e,
        })?;

        info!(?path, "listening on unix domain socket");

        Ok(Self {
            listener,
            path,
            created_inode: Some((created.dev(), created.ino())),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        })
    }

    /// Override the maximum message size of accepted drivers.
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> Result<UnixSocketDriver> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "accepted connection");
        Ok(UnixSocketDriver::from_stream(stream, self.max_message_size))
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UnixSocketListener {
    fn drop(&mut self) {
        let Some((expected_dev, expected_ino)) = self.created_inode else {
            return;
        };
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == expected_dev
                && metadata.ino() == expected_ino
            {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(path = ?self.path, "socket path identity changed; skipping cleanup");
            }
        }
    }
}

/// Message driver over a connected unix domain socket.
///
/// Messages are delimited on the byte stream with a length prefix. A reader
/// task fires message callbacks; a writer task drains the outbound queue so
/// `send` never blocks the caller.
pub struct UnixSocketDriver {
    events: Arc<DriverEvents>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    max_message_size: usize,
}

impl UnixSocketDriver {
    /// Connect to a listening socket.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| TransportError::Connect {
                path: path.to_path_buf(),
                source: e,
            })?;
        debug!(?path, "connected to unix domain socket");
        Ok(Self::from_stream(stream, DEFAULT_MAX_MESSAGE_SIZE))
    }

    /// Create a connected pair of drivers over an anonymous socket pair.
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = UnixStream::pair()?;
        Ok((
            Self::from_stream(left, DEFAULT_MAX_MESSAGE_SIZE),
            Self::from_stream(right, DEFAULT_MAX_MESSAGE_SIZE),
        ))
    }

    /// Wrap a connected stream. Must be called inside a tokio runtime.
    pub fn from_stream(stream: UnixStream, max_message_size: usize) -> Self {
        let events = Arc::new(DriverEvents::new());
        let (read_half, write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

        let codec = || {
            LengthDelimitedCodec::builder()
                .max_frame_length(max_message_size)
                .new_codec()
        };

        let reader_events = Arc::clone(&events);
        let mut framed_read = FramedRead::new(read_half, codec());
        let reader = tokio::spawn(async move {
            while let Some(item) = framed_read.next().await {
                match item {
                    Ok(message) => reader_events.fire_message(message.freeze()),
                    Err(err) => {
                        warn!(%err, "unix socket read failed");
                        reader_events.fire_error(&TransportError::Io(err));
                        break;
                    }
                }
            }
            reader_events.fire_close();
        });

        let writer_events = Arc::clone(&events);
        let mut framed_write = FramedWrite::new(write_half, codec());
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(err) = framed_write.send(message).await {
                    warn!(%err, "unix socket write failed");
                    writer_events.fire_error(&TransportError::Io(err));
                    break;
                }
            }
            let _ = SinkExt::<Bytes>::close(&mut framed_write).await;
            writer_events.fire_close();
        });

        Self {
            events,
            outbound: Mutex::new(Some(tx)),
            reader: Mutex::new(Some(reader)),
            max_message_size,
        }
    }
}

impl TransportDriver for UnixSocketDriver {
    fn send(&self, message: Bytes) -> Result<()> {
        if message.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: message.len(),
                max: self.max_message_size,
            });
        }
        if self.events.is_closed() {
            return Err(TransportError::Closed);
        }
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(tx) => tx.send(message).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    fn on_message(&self, callback: MessageCallback) -> Disposable {
        self.events.on_message(callback)
    }

    fn on_close(&self, callback: CloseCallback) -> Disposable {
        self.events.on_close(callback)
    }

    fn on_error(&self, callback: ErrorCallback) -> Disposable {
        self.events.on_error(callback)
    }

    fn close(&self) {
        // Dropping the sender lets the writer flush queued messages and shut
        // down the write half.
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }
        if self.events.fire_close() {
            debug!("unix socket driver closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    fn name(&self) -> &'static str {
        "unix-domain-socket"
    }
}

impl Drop for UnixSocketDriver {
    fn drop(&mut self) {
        self.close();
    }
}
