//! Zero-configuration client setup responder
//!
//! Serves one static Mozilla-style `clientConfig` document describing
//! the local SMTP/IMAP bridge endpoints, so stock mail clients can
//! discover the engine without manual setup. The document is served at
//! the conventional autoconfig paths; everything else is a 404.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::types::error::{Result, TideError};

/// Default loopback port for the responder
pub const DEFAULT_AUTOCONFIG_PORT: u16 = 11080;

/// Paths mail clients probe for autoconfiguration
const AUTOCONFIG_PATHS: [&str; 3] = [
    "/mail/config-v1.1.xml",
    "/.well-known/autoconfig/mail/config-v1.1.xml",
    "/config-v1.1.xml",
];

/// Handle to a running responder; dropping it does not stop the task,
/// call [`AutoconfigResponder::stop`]
pub struct AutoconfigResponder {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl AutoconfigResponder {
    /// Bind the loopback listener and start serving
    ///
    /// Port `0` picks an ephemeral port.
    pub async fn start(port: u16, smtp_address: &str, imap_address: &str) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| TideError::Io(format!("bind autoconfig responder: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TideError::Io(e.to_string()))?;

        let document = render_client_config(smtp_address, imap_address);
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("Autoconfig request from {}", peer);
                            if let Err(err) = serve_request(stream, &document).await {
                                debug!("Autoconfig request failed: {}", err);
                            }
                        }
                        Err(err) => {
                            warn!("Autoconfig accept failed: {}", err);
                            break;
                        }
                    },
                }
            }
            debug!("Autoconfig responder exited");
        });

        info!("Autoconfig responder listening on {}", local_addr);
        Ok(Self {
            local_addr,
            shutdown,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the accept loop and wait for it, releasing the port
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

async fn serve_request(stream: TcpStream, document: &str) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    let path = path.split('?').next().unwrap_or(path);

    let mut stream = reader.into_inner();
    if AUTOCONFIG_PATHS.contains(&path) {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/xml; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            document.len(),
            document
        );
        stream.write_all(response.as_bytes()).await?;
    } else {
        stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
    }
    stream.shutdown().await
}

/// Build the provider-discovery document for the local bridge
fn render_client_config(smtp_address: &str, imap_address: &str) -> String {
    let (imap_host, imap_port) = split_host_port(imap_address, 1143);
    let (smtp_host, smtp_port) = split_host_port(smtp_address, 1025);
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<clientConfig version="1.1">
  <emailProvider id="tidemail.local">
    <domain>tidemail.local</domain>
    <displayName>Tidemail</displayName>
    <displayShortName>Tidemail</displayShortName>
    <incomingServer type="imap">
      <hostname>{imap_host}</hostname>
      <port>{imap_port}</port>
      <socketType>plain</socketType>
      <authentication>password-cleartext</authentication>
      <username>%EMAILADDRESS%</username>
    </incomingServer>
    <outgoingServer type="smtp">
      <hostname>{smtp_host}</hostname>
      <port>{smtp_port}</port>
      <socketType>plain</socketType>
      <authentication>password-cleartext</authentication>
      <username>%EMAILADDRESS%</username>
    </outgoingServer>
  </emailProvider>
</clientConfig>
"#
    )
}

fn split_host_port(address: &str, default_port: u16) -> (String, u16) {
    match address.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse().unwrap_or(default_port),
        ),
        None => (address.to_string(), default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn fetch(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serves_client_config_on_conventional_paths() {
        let responder = AutoconfigResponder::start(0, "127.0.0.1:1025", "127.0.0.1:1143")
            .await
            .unwrap();
        let addr = responder.local_addr();

        for path in AUTOCONFIG_PATHS {
            let response = fetch(addr, path).await;
            assert!(response.starts_with("HTTP/1.1 200 OK"), "path {}", path);
            assert!(response.contains("<clientConfig version=\"1.1\">"));
            assert!(response.contains("<port>1143</port>"));
            assert!(response.contains("<port>1025</port>"));
        }

        responder.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let responder = AutoconfigResponder::start(0, "127.0.0.1:1025", "127.0.0.1:1143")
            .await
            .unwrap();
        let response = fetch(responder.local_addr(), "/index.html").await;
        assert!(response.starts_with("HTTP/1.1 404"));
        responder.stop().await;
    }

    #[tokio::test]
    async fn test_stop_releases_the_port() {
        let responder = AutoconfigResponder::start(0, "127.0.0.1:1025", "127.0.0.1:1143")
            .await
            .unwrap();
        let addr = responder.local_addr();
        responder.stop().await;

        // The port must be bindable again right away
        let rebound = TcpListener::bind(addr).await;
        assert!(rebound.is_ok());
    }
}
