//! Live [`ServiceOps`] backed by the local machine.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ptm_common::{PtmError, PtmResult};
use ptm_network::{CommandOutput, CommandRunner, ExecContext, SystemRunner};
use rustix::io::Errno;
use rustix::mount::{MountPropagationFlags, UnmountFlags, mount_bind, mount_change, unmount};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::ServiceOps;

/// Default bound on a single readiness exchange.
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands, files, mounts and sockets on this machine.
#[derive(Debug, Clone)]
pub struct HostSystem {
    runner: Arc<dyn CommandRunner>,
    io_timeout: Duration,
}

impl Default for HostSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSystem {
    /// Run commands as real child processes.
    #[must_use]
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemRunner))
    }

    /// Use a custom command runner.
    #[must_use]
    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            io_timeout: IO_TIMEOUT,
        }
    }

    /// Bound each TCP exchange.
    #[must_use]
    pub const fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    async fn exchange<T, F>(&self, addr: SocketAddr, io: F) -> PtmResult<T>
    where
        F: Future<Output = io::Result<T>> + Send,
    {
        let socket_error = |message: String| PtmError::Socket {
            address: addr.to_string(),
            message,
        };
        tokio::time::timeout(self.io_timeout, io)
            .await
            .map_err(|_| socket_error(format!("no answer within {:?}", self.io_timeout)))?
            .map_err(|e| socket_error(e.to_string()))
    }
}

#[async_trait]
impl ServiceOps for HostSystem {
    async fn run(&self, ctx: &ExecContext, argv: &[String]) -> PtmResult<CommandOutput> {
        self.runner.run(ctx, argv).await
    }

    async fn write_file(&self, path: &Path, contents: &str) -> PtmResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        tracing::trace!(path = %path.display(), bytes = contents.len(), "Wrote file");
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> PtmResult<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_dir(&self, path: &Path) -> PtmResult<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn bind_mount(&self, source: &Path, target: &Path) -> PtmResult<()> {
        tokio::fs::create_dir_all(target).await?;
        tracing::debug!(
            source = %source.display(),
            target = %target.display(),
            "Creating bind mount"
        );
        mount_bind(source, target).map_err(|e| PtmError::Io(e.into()))?;
        mount_change(target, MountPropagationFlags::PRIVATE)
            .map_err(|e| PtmError::Io(e.into()))?;
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> PtmResult<()> {
        tracing::debug!(target = %target.display(), "Unmounting");
        match unmount(target, UnmountFlags::DETACH) {
            Ok(()) | Err(Errno::INVAL | Errno::NOENT) => Ok(()),
            Err(e) => Err(PtmError::Io(e.into())),
        }
    }

    async fn tcp_request(&self, addr: SocketAddr, request: &str) -> PtmResult<String> {
        self.exchange(addr, async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.write_all(request.as_bytes()).await?;
            stream.shutdown().await?;
            let mut reply = String::new();
            stream.read_to_string(&mut reply).await?;
            Ok(reply)
        })
        .await
    }

    async fn tcp_connect(&self, addr: SocketAddr) -> PtmResult<()> {
        self.exchange(addr, async {
            TcpStream::connect(addr).await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sys = HostSystem::new();
        let path = dir.path().join("etc/zookeeper/zoo.cfg");

        assert_eq!(sys.read_file(&path).await.unwrap(), None);
        sys.write_file(&path, "tickTime=2000\n").await.unwrap();
        assert_eq!(
            sys.read_file(&path).await.unwrap().as_deref(),
            Some("tickTime=2000\n")
        );

        let nested = dir.path().join("var/lib/cassandra/data");
        sys.create_dir(&nested).await.unwrap();
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn four_letter_word_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = String::new();
            socket.read_to_string(&mut request).await.unwrap();
            assert_eq!(request, "ruok");
            socket.write_all(b"imok").await.unwrap();
        });

        let reply = HostSystem::new().tcp_request(addr, "ruok").await.unwrap();
        assert_eq!(reply, "imok");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_socket_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = HostSystem::new().tcp_connect(addr).await.unwrap_err();
        assert!(matches!(err, PtmError::Socket { .. }));
    }

    #[tokio::test]
    async fn runs_commands() {
        let out = HostSystem::new()
            .run(&ExecContext::Root, &ptm_network::argv(&["sh", "-c", "echo hi"]))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hi");
    }
}
