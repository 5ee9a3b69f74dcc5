//! TCP dialer for `host:port` endpoint ids

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::pool::{Dial, DialError};

/// Settings for [`TcpDialer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpDialerConfig {
    /// Upper bound on one connect attempt, resolution included
    pub connect_timeout: Duration,

    /// Enable TCP keep-alive on established sockets
    pub keepalive: bool,
}

impl Default for TcpDialerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            keepalive: true,
        }
    }
}

/// Dials endpoint ids of the form `host:port`
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    config: TcpDialerConfig,
}

impl TcpDialer {
    pub fn new(config: TcpDialerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TcpDialerConfig {
        &self.config
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts
pub(crate) fn split_endpoint(endpoint_id: &str) -> Result<(&str, u16), DialError> {
    let (host, port) = endpoint_id
        .rsplit_once(':')
        .ok_or_else(|| DialError::Resolve(format!("missing port in {:?}", endpoint_id)))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(DialError::Resolve(format!("missing host in {:?}", endpoint_id)));
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| DialError::Resolve(format!("invalid port in {:?}", endpoint_id)))?;

    Ok((host, port))
}

#[async_trait]
impl Dial for TcpDialer {
    type Connection = TcpStream;

    async fn dial(&self, endpoint_id: &str) -> Result<TcpStream, DialError> {
        let (host, port) = split_endpoint(endpoint_id)?;

        debug!(
            endpoint_id = %endpoint_id,
            host = %host,
            port = %port,
            "Dialing"
        );

        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| DialError::Timeout(self.config.connect_timeout))??;

        if !self.config.keepalive {
            return Ok(stream);
        }

        let socket = socket2::Socket::from(stream.into_std()?);
        socket.set_keepalive(true)?;
        let std_stream: std::net::TcpStream = socket.into();
        std_stream.set_nonblocking(true)?;
        Ok(TcpStream::from_std(std_stream)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_split_endpoint() {
        assert_eq!(split_endpoint("localhost:9000").unwrap(), ("localhost", 9000));
        assert_eq!(split_endpoint("[::1]:80").unwrap(), ("::1", 80));
        assert!(split_endpoint("localhost").is_err());
        assert!(split_endpoint(":80").is_err());
        assert!(split_endpoint("host:http").is_err());
    }

    #[tokio::test]
    async fn test_dial_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|(_, peer)| peer) });

        let dialer = TcpDialer::default();
        let stream = dialer.dial(&addr.to_string()).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);

        let peer = accept.await.unwrap().unwrap();
        assert_eq!(peer, stream.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_dial_closed_port_fails() {
        // Bind then drop to obtain a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = TcpDialer::new(TcpDialerConfig {
            connect_timeout: Duration::from_secs(2),
            keepalive: false,
        });
        assert!(dialer.dial(&addr.to_string()).await.is_err());
    }
}
