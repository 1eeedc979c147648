use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::NetworkError;

/// Any byte stream a socket can run over.
pub trait Conn: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static> Conn for T {}

pub type BoxedConn = Pin<Box<dyn Conn>>;

/// Socket address in URI form: `tcp://host:port` or `ipc:///path/to.sock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Ipc(PathBuf),
}

impl FromStr for Endpoint {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            if addr.rsplit_once(':').is_none() {
                return Err(NetworkError::Endpoint(format!("'{s}' has no port")));
            }
            Ok(Self::Tcp(addr.to_string()))
        } else if let Some(path) = s.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(NetworkError::Endpoint(format!("'{s}' has no path")));
            }
            Ok(Self::Ipc(PathBuf::from(path)))
        } else {
            Err(NetworkError::Endpoint(format!(
                "'{s}' must start with tcp:// or ipc://"
            )))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

impl Endpoint {
    /// Local-transport endpoint for `name` inside a socket directory.
    pub fn ipc_in(dir: &std::path::Path, name: &str) -> Self {
        Self::Ipc(dir.join(format!("{name}.sock")))
    }

    pub async fn bind(&self) -> Result<Listener, NetworkError> {
        match self {
            Self::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| NetworkError::Transport(format!("bind {self}: {e}")))?;
                Ok(Listener::Tcp(listener))
            }
            Self::Ipc(path) => {
                match path.parent() {
                    Some(dir) if !dir.as_os_str().is_empty() && !dir.is_dir() => {
                        return Err(NetworkError::Transport(format!(
                            "socket directory {} does not exist",
                            dir.display()
                        )));
                    }
                    _ => {}
                }
                // A previous run may have left its socket file behind.
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)
                    .map_err(|e| NetworkError::Transport(format!("bind {self}: {e}")))?;
                Ok(Listener::Ipc(listener, path.clone()))
            }
        }
    }

    pub async fn connect(&self) -> Result<BoxedConn, NetworkError> {
        match self {
            Self::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| NetworkError::Transport(format!("connect {self}: {e}")))?;
                stream.set_nodelay(true)?;
                Ok(Box::pin(stream))
            }
            Self::Ipc(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(|e| NetworkError::Transport(format!("connect {self}: {e}")))?;
                Ok(Box::pin(stream))
            }
        }
    }
}

pub enum Listener {
    Tcp(TcpListener),
    Ipc(UnixListener, PathBuf),
}

impl Listener {
    pub async fn accept(&self) -> std::io::Result<BoxedConn> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::pin(stream))
            }
            Self::Ipc(listener, _) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::pin(stream))
            }
        }
    }

    /// The bound address, with the real port when binding to port 0.
    pub fn local_endpoint(&self) -> Result<Endpoint, NetworkError> {
        match self {
            Self::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            Self::Ipc(_, path) => Ok(Endpoint::Ipc(path.clone())),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Self::Ipc(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(
            "tcp://127.0.0.1:5555".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:5555".into())
        );
        assert_eq!(
            "ipc:///tmp/sw/router.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Ipc(PathBuf::from("/tmp/sw/router.sock"))
        );
        assert!("udp://1.2.3.4:5".parse::<Endpoint>().is_err());
        assert!("tcp://nohost".parse::<Endpoint>().is_err());
        assert!("ipc://".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for uri in ["tcp://0.0.0.0:7000", "ipc:///run/switchyard/workers.sock"] {
            assert_eq!(uri.parse::<Endpoint>().unwrap().to_string(), uri);
        }
    }

    #[tokio::test]
    async fn test_ipc_bind_requires_directory() {
        let ep = Endpoint::Ipc(PathBuf::from("/nonexistent-switchyard-dir/x.sock"));
        assert!(matches!(ep.bind().await, Err(NetworkError::Transport(_))));
    }

    #[tokio::test]
    async fn test_tcp_port_zero_reports_real_port() {
        let listener = Endpoint::Tcp("127.0.0.1:0".into()).bind().await.unwrap();
        let Endpoint::Tcp(addr) = listener.local_endpoint().unwrap() else {
            panic!("expected tcp endpoint");
        };
        assert!(!addr.ends_with(":0"));
    }
}
