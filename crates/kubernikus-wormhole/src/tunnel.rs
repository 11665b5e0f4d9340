//! One persistent tunnel to one node: a mutually-authenticated TLS
//! connection multiplexed with yamux. A local listener accepts the
//! iptables-redirected connections and proxies each one over a fresh
//! yamux stream. The tunnel re-dials with backoff until cancelled.

use std::{
    future,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    task::Poll,
    time::Duration,
};

use snafu::{OptionExt, ResultExt, Snafu};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};
use tokio_util::{
    compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

/// Remote port the node-side tunnel server listens on.
pub const TUNNEL_PORT: u16 = 9090;

const INITIAL_REDIAL_DELAY: Duration = Duration::from_secs(2);
const MAX_REDIAL_DELAY: Duration = Duration::from_secs(60);

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cannot read {path:?}"))]
    ReadPem {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("{path:?} carries no usable PEM material"))]
    EmptyPem { path: PathBuf },

    #[snafu(display("TLS configuration rejected"))]
    Tls { source: tokio_rustls::rustls::Error },

    #[snafu(display("cannot bind the local tunnel listener"))]
    Bind { source: std::io::Error },
}

/// PEM locations for the client certificate, its key and the CA pool.
#[derive(Clone, Debug)]
pub struct TlsFiles {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Client config enforcing mutual authentication against the node CA.
pub fn load_client_config(files: &TlsFiles) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(&files.ca)? {
        roots.add(cert).context(TlsSnafu)?;
    }

    let certs = read_certs(&files.cert)?;
    let key_pem = std::fs::read(&files.key).context(ReadPemSnafu { path: &files.key })?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .ok()
        .flatten()
        .context(EmptyPemSnafu { path: &files.key })?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .context(TlsSnafu)?;
    Ok(Arc::new(config))
}

fn read_certs(
    path: &Path,
) -> Result<Vec<tokio_rustls::rustls::pki_types::CertificateDer<'static>>> {
    let pem = std::fs::read(path).context(ReadPemSnafu { path })?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
        .filter_map(std::result::Result::ok)
        .collect();
    if certs.is_empty() {
        return EmptyPemSnafu { path }.fail();
    }
    Ok(certs)
}

/// Redial delay after `attempt` consecutive failed sessions.
pub fn redial_delay(attempt: u32) -> Duration {
    INITIAL_REDIAL_DELAY
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(MAX_REDIAL_DELAY)
}

/// A running tunnel client. Dropping the handle does not stop it; call
/// [`Tunnel::stop`].
pub struct Tunnel {
    /// Local listener port the iptables rules redirect to.
    pub port: u16,
    cancel: CancellationToken,
}

impl Tunnel {
    /// Binds the local listener and starts the dial loop in the
    /// background. Dial failures are retried internally, so a tunnel to a
    /// node that is still booting settles once the node comes up.
    pub async fn open(
        tls: Arc<ClientConfig>,
        remote: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.context(BindSnafu)?;
        let port = listener.local_addr().context(BindSnafu)?.port();
        let token = cancel.clone();
        tokio::spawn(async move {
            dial_loop(tls, remote, listener, token).await;
        });
        Ok(Self { port, cancel })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn dial_loop(
    tls: Arc<ClientConfig>,
    remote: SocketAddr,
    listener: TcpListener,
    cancel: CancellationToken,
) {
    let connector = TlsConnector::from(tls);
    let mut attempt = 0u32;
    while !cancel.is_cancelled() {
        match session(&connector, remote, &listener, &cancel).await {
            Ok(()) => {
                info!(%remote, "tunnel session closed");
                attempt = 1;
            }
            Err(err) => {
                attempt = attempt.saturating_add(1);
                debug!(%remote, error = %err, attempt, "tunnel session failed");
            }
        }
        let delay = redial_delay(attempt);
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// One TLS + yamux session. Returns when the remote closes or on error.
async fn session(
    connector: &TlsConnector,
    remote: SocketAddr,
    listener: &TcpListener,
    cancel: &CancellationToken,
) -> std::io::Result<()> {
    let tcp = TcpStream::connect(remote).await?;
    tcp.set_nodelay(true)?;
    let tls = connector
        .connect(ServerName::from(remote.ip()), tcp)
        .await?;
    info!(%remote, "tunnel established");

    let mut connection = yamux::Connection::new(
        tls.compat(),
        yamux::Config::default(),
        yamux::Mode::Client,
    );

    // Single driver polling listener accepts, outbound stream opening and
    // the connection's inbound side. yamux requires poll_next_inbound to
    // be driven for any progress, so everything lives in one poll loop.
    let mut pending: Option<TcpStream> = None;
    let drive = future::poll_fn(|cx| {
        loop {
            match connection.poll_next_inbound(cx) {
                // The server never opens streams towards us; drop them.
                Poll::Ready(Some(Ok(inbound))) => {
                    drop(inbound);
                    continue;
                }
                Poll::Ready(Some(Err(err))) => {
                    return Poll::Ready(Err(std::io::Error::other(err)));
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => {}
            }

            if pending.is_some() {
                match connection.poll_new_outbound(cx) {
                    Poll::Ready(Ok(stream)) => {
                        if let Some(tcp) = pending.take() {
                            tokio::spawn(proxy(tcp, stream));
                        }
                        continue;
                    }
                    Poll::Ready(Err(err)) => {
                        return Poll::Ready(Err(std::io::Error::other(err)));
                    }
                    Poll::Pending => {}
                }
            } else {
                match listener.poll_accept(cx) {
                    Poll::Ready(Ok((tcp, peer))) => {
                        debug!(%peer, "redirected connection accepted");
                        pending = Some(tcp);
                        continue;
                    }
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                    Poll::Pending => {}
                }
            }
            return Poll::Pending;
        }
    });

    tokio::select! {
        () = cancel.cancelled() => Ok(()),
        result = drive => result,
    }
}

async fn proxy(mut tcp: TcpStream, stream: yamux::Stream) {
    let mut stream = stream.compat();
    match tokio::io::copy_bidirectional(&mut tcp, &mut stream).await {
        Ok((up, down)) => debug!(up, down, "proxied connection finished"),
        Err(err) => warn!(error = %err, "proxied connection aborted"),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    #[case(5, 32)]
    #[case(6, 60)]
    #[case(40, 60)]
    fn redial_delay_doubles_and_caps(#[case] attempt: u32, #[case] expected_secs: u64) {
        assert_eq!(redial_delay(attempt), Duration::from_secs(expected_secs));
    }

    #[tokio::test]
    async fn open_binds_an_ephemeral_local_port() {
        let config = ClientConfig::builder()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        let tunnel = Tunnel::open(
            Arc::new(config),
            "127.0.0.1:1".parse().expect("addr"),
            CancellationToken::new(),
        )
        .await
        .expect("open");
        assert_ne!(tunnel.port, 0);
        tunnel.stop();
    }
}
