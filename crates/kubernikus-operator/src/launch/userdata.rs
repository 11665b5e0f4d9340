//! Renders the ignition userdata a new node boots with. Pure data
//! templating from kluster and bootstrap-secret fields.

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use snafu::{ResultExt, Snafu};

use crate::{
    client::{self, secret_key},
    kluster::{Kluster, NodePool},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("bootstrap secret is incomplete"))]
    IncompleteSecret { source: client::Error },

    #[snafu(display("bootstrap secret field is not UTF-8"))]
    NotUtf8 { source: std::string::FromUtf8Error },

    #[snafu(display("failed to serialize ignition config"))]
    Serialize { source: serde_json::Error },
}

/// Ignition v3 config wiring the kubelet to the kluster's API server via
/// TLS bootstrapping.
pub fn render(kluster: &Kluster, pool: &NodePool, secret: &Secret) -> Result<Vec<u8>> {
    let token = field(secret, "bootstrap-token")?;
    let apiserver_url = field(secret, "apiserver-url")?;
    let ca = field(secret, "tls-ca.crt")?;

    let bootstrap_kubeconfig = format!(
        concat!(
            "apiVersion: v1\n",
            "kind: Config\n",
            "clusters:\n",
            "- name: {kluster}\n",
            "  cluster:\n",
            "    server: {url}\n",
            "    certificate-authority: /etc/kubernetes/ca.crt\n",
            "users:\n",
            "- name: kubelet-bootstrap\n",
            "  user:\n",
            "    token: {token}\n",
            "contexts:\n",
            "- name: default\n",
            "  context: {{ cluster: {kluster}, user: kubelet-bootstrap }}\n",
            "current-context: default\n",
        ),
        kluster = kluster.name_any(),
        url = apiserver_url,
        token = token,
    );

    let config = serde_json::json!({
        "ignition": { "version": "3.0.0" },
        "storage": { "files": [
            ignition_file("/etc/kubernetes/ca.crt", &ca),
            ignition_file("/etc/kubernetes/bootstrap-kubeconfig", &bootstrap_kubeconfig),
            ignition_file(
                "/etc/kubernetes/kubelet-labels",
                &format!("ccloud.sap.com/nodepool={}\n", pool.name),
            ),
        ]},
    });
    serde_json::to_vec(&config).context(SerializeSnafu)
}

fn ignition_file(path: &str, contents: &str) -> serde_json::Value {
    serde_json::json!({
        "path": path,
        "mode": 0o600,
        "contents": {
            "source": format!("data:,{}", urlencode(contents)),
        },
    })
}

fn field(secret: &Secret, key: &str) -> Result<String> {
    let raw = secret_key(secret, key).context(IncompleteSecretSnafu)?;
    String::from_utf8(raw).context(NotUtf8Snafu)
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
