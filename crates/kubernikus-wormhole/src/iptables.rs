//! NAT redirection rules steering apiserver-to-node traffic into the
//! local tunnel listeners. The whole chain is regenerated from the route
//! table on every resync and applied atomically with `iptables-restore`.

use std::{net::Ipv4Addr, process::Stdio};

use async_trait::async_trait;
use ipnet::Ipv4Net;
use snafu::{ResultExt, Snafu, ensure};
use tokio::{io::AsyncWriteExt, process::Command, sync::Mutex};
use tracing::debug;

/// The chain owned by wormhole in the nat table.
pub const CHAIN: &str = "WORMHOLE-REDIRECTS";
/// Comment tagging the OUTPUT jump so it can be recognized across restarts.
const JUMP_COMMENT: &str = "kubernikus:wormhole";
/// Seconds to wait on the xtables advisory lock.
const XTABLES_WAIT: &str = "5";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to run {command}"))]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[snafu(display("{command} exited with {status}: {stderr}"))]
    CommandFailed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// One tracked node's redirection targets.
#[derive(Clone, Debug)]
pub struct NodeRedirect {
    pub node_ip: Ipv4Addr,
    pub pod_cidr: Option<Ipv4Net>,
    /// Local tunnel listener port the traffic is redirected to.
    pub port: u16,
}

/// The complete `iptables-restore` payload for the chain. Three REDIRECT
/// rules per node: its address, its pod CIDR and the service CIDR. The
/// service-CIDR rule of the first listed node shadows the others, so any
/// single tunnel carries service traffic.
pub fn render_rules(service_cidr: Ipv4Net, nodes: &[NodeRedirect]) -> String {
    let mut out = String::new();
    out.push_str("*nat\n");
    out.push_str(&format!(":{CHAIN} - [0:0]\n"));
    // --noflush leaves declared chains alone, so stale rules are dropped
    // explicitly before the regenerated body.
    out.push_str(&format!("-F {CHAIN}\n"));
    for node in nodes {
        out.push_str(&format!(
            "-A {CHAIN} -d {}/32 -p tcp -j REDIRECT --to-ports {}\n",
            node.node_ip, node.port
        ));
        if let Some(pod_cidr) = node.pod_cidr {
            out.push_str(&format!(
                "-A {CHAIN} -d {pod_cidr} -p tcp -j REDIRECT --to-ports {}\n",
                node.port
            ));
        }
        out.push_str(&format!(
            "-A {CHAIN} -d {service_cidr} -p tcp -j REDIRECT --to-ports {}\n",
            node.port
        ));
    }
    out.push_str("COMMIT\n");
    out
}

/// Something that accepts a rendered rule set. The production impl shells
/// out to iptables; tests record the payloads.
#[async_trait]
pub trait Firewall: Send + Sync {
    async fn apply(&self, rules: &str) -> Result<()>;
}

/// Applies rule sets with `iptables-restore --noflush --counters`.
/// Applications are serialized so concurrent resyncs cannot interleave.
pub struct IptablesRestore {
    lock: Mutex<()>,
}

impl IptablesRestore {
    pub fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }

    /// Creates the chain and the comment-tagged OUTPUT jump if missing.
    /// Existing rules and counters are left untouched.
    pub async fn ensure_chain(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        // -N fails when the chain exists, which is fine.
        let _ = run(&["-t", "nat", "-w", XTABLES_WAIT, "-N", CHAIN]).await;
        let jump = [
            "-t", "nat", "-w", XTABLES_WAIT,
            "-C", "OUTPUT",
            "-m", "comment", "--comment", JUMP_COMMENT,
            "-j", CHAIN,
        ];
        if run(&jump).await.is_err() {
            let mut add = jump;
            add[4] = "-A";
            run(&add).await?;
        }
        Ok(())
    }
}

impl Default for IptablesRestore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Firewall for IptablesRestore {
    async fn apply(&self, rules: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        debug!(bytes = rules.len(), "applying nat rules");
        restore(rules).await
    }
}

async fn run(args: &[&str]) -> Result<()> {
    let command = format!("iptables {}", args.join(" "));
    let output = Command::new("iptables")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .context(SpawnSnafu { command: command.clone() })?;
    ensure!(
        output.status.success(),
        CommandFailedSnafu {
            command,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    );
    Ok(())
}

async fn restore(rules: &str) -> Result<()> {
    let command = "iptables-restore --noflush --counters".to_owned();
    let mut child = Command::new("iptables-restore")
        .args(["--noflush", "--counters", "--wait", XTABLES_WAIT])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .context(SpawnSnafu { command: command.clone() })?;
    if let Some(mut pipe) = child.stdin.take() {
        pipe.write_all(rules.as_bytes())
            .await
            .context(SpawnSnafu { command: command.clone() })?;
    }
    let output = child
        .wait_with_output()
        .await
        .context(SpawnSnafu { command: command.clone() })?;
    ensure!(
        output.status.success(),
        CommandFailedSnafu {
            command,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    );
    Ok(())
}
