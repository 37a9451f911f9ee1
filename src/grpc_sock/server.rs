//! The server side of a plugin's Unix socket. Binding a [`PluginSocket`]
//! also owns the filesystem lifecycle of the socket: the socket directory is
//! created if it does not exist, a stale socket left behind by a previous
//! run of the plugin is removed before binding, and the socket file is
//! cleaned up again when the bound socket is dropped. The socket yields
//! accepted connections as a stream, suitable for
//! `Server::serve_with_incoming`.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tonic::transport::server::Connected;
use tracing::debug;

/// A listening Unix socket serving the plugin API.
pub struct PluginSocket {
    path: PathBuf,
    listener: tokio::net::UnixListener,
}

impl PluginSocket {
    /// Binds the plugin socket at the given path. The parent directory is
    /// created when missing, and a stale socket from an earlier run of the
    /// plugin is removed first so rebinding after a crash just works.
    pub async fn bind<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(socket = %path.display(), "removed stale plugin socket"),
            Err(err) if matches!(err.kind(), std::io::ErrorKind::NotFound) => (),
            Err(err) => return Err(err.into()),
        }
        let listener = tokio::net::UnixListener::bind(&path)?;
        Ok(PluginSocket { path, listener })
    }

    /// The path the socket is bound at.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PluginSocket {
    fn drop(&mut self) {
        // The socket file is meaningless once the listener is gone; a failed
        // removal only means the next bind clears it instead.
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Stream for PluginSocket {
    type Item = std::io::Result<PluginConnection>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.listener.poll_accept(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok((stream, _addr))) => {
                Poll::Ready(Some(Ok(PluginConnection(stream))))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Some(Err(err))),
        }
    }
}

/// A single accepted connection to the plugin socket. This mostly exists to
/// satisfy tonic, which wants its connections to implement [`Connected`];
/// Unix sockets carry no connection info worth reporting.
#[derive(Debug)]
pub struct PluginConnection(tokio::net::UnixStream);

impl Connected for PluginConnection {
    type ConnectInfo = ();

    fn connect_info(&self) -> Self::ConnectInfo {}
}

impl AsyncRead for PluginConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for PluginConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_creates_the_socket_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("plugin.sock");
        let socket = PluginSocket::bind(&path).await.unwrap();
        assert_eq!(socket.path(), path);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn bind_replaces_a_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin.sock");
        // A previous run that was killed leaves its socket file behind.
        let stale = PluginSocket::bind(&path).await.unwrap();
        std::mem::forget(stale);
        assert!(path.exists());

        let socket = PluginSocket::bind(&path).await.unwrap();
        assert!(socket.path().exists());
    }

    #[tokio::test]
    async fn drop_removes_the_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin.sock");
        let socket = PluginSocket::bind(&path).await.unwrap();
        assert!(path.exists());
        drop(socket);
        assert!(!path.exists());
    }
}
