//! Command line configuration for the wormhole binary.

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use ipnet::Ipv4Net;

use crate::tunnel::{self, TlsFiles};

#[derive(Debug, Parser)]
#[command(name = "wormhole", about = "Reverse-tunnel fabric for kubernikus worker nodes", version)]
pub struct Options {
    /// Service CIDR whose traffic is redirected through the tunnels.
    #[arg(long)]
    pub service_cidr: Ipv4Net,

    /// Port the node-side tunnel servers listen on.
    #[arg(long, default_value_t = tunnel::TUNNEL_PORT)]
    pub tunnel_port: u16,

    /// CA bundle the node certificates are verified against.
    #[arg(long, env = "WORMHOLE_CA")]
    pub ca: PathBuf,

    /// Client certificate presented to the nodes.
    #[arg(long, env = "WORMHOLE_CERT")]
    pub cert: PathBuf,

    /// Key for the client certificate.
    #[arg(long, env = "WORMHOLE_KEY")]
    pub key: PathBuf,

    /// Full resync period for the node watch.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5m")]
    pub resync_period: Duration,
}

impl Options {
    pub fn tls_files(&self) -> TlsFiles {
        TlsFiles {
            ca: self.ca.clone(),
            cert: self.cert.clone(),
            key: self.key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_minimal_invocation() {
        let options = Options::parse_from([
            "wormhole",
            "--service-cidr",
            "198.18.128.0/17",
            "--ca",
            "/etc/wormhole/ca.crt",
            "--cert",
            "/etc/wormhole/client.crt",
            "--key",
            "/etc/wormhole/client.key",
        ]);
        assert_eq!(options.tunnel_port, 9090);
        assert_eq!(options.resync_period, Duration::from_secs(300));
        assert_eq!(options.service_cidr.prefix_len(), 17);
    }
}
