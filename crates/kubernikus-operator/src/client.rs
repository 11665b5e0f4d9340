//! Typed access to the authoritative Kluster store and to the satellite
//! clusters. Wraps an underlying [`kube::Client`] and provides the CAS and
//! finalizer helpers the controllers rely on.

use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, ResourceExt,
    api::{ListParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
};
use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::kluster::Kluster;

pub type Result<T, E = Error> = std::result::Result<T, E>;

const FIELD_MANAGER: &str = "kubernikus";
const CONFLICT_RETRIES: usize = 5;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("kubernetes API request failed"))]
    Kube { source: kube::Error },

    #[snafu(display("conflicting write to {namespace}/{name} persisted across retries"))]
    Conflict { namespace: String, name: String },

    #[snafu(display("kluster {namespace}/{name} has no secret {secret}"))]
    MissingSecret {
        namespace: String,
        name: String,
        secret: String,
    },

    #[snafu(display("secret {secret} has no key {key}"))]
    MissingSecretKey { secret: String, key: String },

    #[snafu(display("kubeconfig for the satellite cluster does not parse"))]
    MalformedKubeconfig { source: serde_yaml::Error },

    #[snafu(display("cannot build a client for the satellite cluster"))]
    TenantConfig { source: kube::config::KubeconfigError },

    #[snafu(display("cannot construct the satellite client"))]
    TenantClient { source: kube::Error },
}

/// True for the optimistic-concurrency conflict the authoritative store
/// raises on stale writes. Callers re-fetch and retry.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}

/// True for the "unexpected server error" / "server timeout" class used by
/// the deorbiter's APIUnavailable self-destruct check.
pub fn is_unexpected_server_error(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code >= 500)
}

#[derive(Clone)]
pub struct Client {
    kube: kube::Client,
}

impl Client {
    pub fn new(kube: kube::Client) -> Self {
        Self { kube }
    }

    pub fn as_kube_client(&self) -> kube::Client {
        self.kube.clone()
    }

    pub fn klusters(&self, namespace: &str) -> Api<Kluster> {
        Api::namespaced(self.kube.clone(), namespace)
    }

    pub fn all_klusters(&self) -> Api<Kluster> {
        Api::all(self.kube.clone())
    }

    pub async fn get_kluster(&self, namespace: &str, name: &str) -> Result<Kluster> {
        self.klusters(namespace).get(name).await.context(KubeSnafu)
    }

    /// Every kluster across all namespaces. The sweep-style controllers
    /// work from this list rather than a watch.
    pub async fn list_klusters(&self) -> Result<Vec<Kluster>> {
        let list = self
            .all_klusters()
            .list(&ListParams::default())
            .await
            .context(KubeSnafu)?;
        Ok(list.items)
    }

    /// CAS replace of the whole kluster. Fails with a 409-backed error
    /// when the object changed since it was read.
    pub async fn update_kluster(&self, kluster: &Kluster) -> Result<Kluster> {
        let api = self.klusters(&namespace_of(kluster));
        api.replace(&kluster.name_any(), &PostParams::default(), kluster)
            .await
            .context(KubeSnafu)
    }

    /// CAS status write: fails with a 409-backed error when the kluster
    /// changed since it was read. The caller's retry path re-fetches.
    pub async fn update_kluster_status(&self, kluster: &Kluster) -> Result<Kluster> {
        let api = self.klusters(&namespace_of(kluster));
        let data = serde_json::to_vec(kluster).map_err(kube::Error::SerdeError).context(KubeSnafu)?;
        api.replace_status(&kluster.name_any(), &PostParams::default(), data)
            .await
            .context(KubeSnafu)
    }

    /// Idempotent finalizer add with read-modify-write retry on conflict.
    pub async fn add_finalizer(&self, kluster: &Kluster, finalizer: &str) -> Result<Kluster> {
        self.mutate_finalizers(kluster, |finalizers| {
            if finalizers.iter().any(|f| f == finalizer) {
                false
            } else {
                finalizers.push(finalizer.to_owned());
                true
            }
        })
        .await
    }

    pub async fn remove_finalizer(&self, kluster: &Kluster, finalizer: &str) -> Result<Kluster> {
        self.mutate_finalizers(kluster, |finalizers| {
            let before = finalizers.len();
            finalizers.retain(|f| f != finalizer);
            finalizers.len() != before
        })
        .await
    }

    async fn mutate_finalizers(
        &self,
        kluster: &Kluster,
        mutate: impl Fn(&mut Vec<String>) -> bool,
    ) -> Result<Kluster> {
        let namespace = namespace_of(kluster);
        let api = self.klusters(&namespace);
        let name = kluster.name_any();
        let mut current = kluster.clone();
        for _ in 0..CONFLICT_RETRIES {
            let mut finalizers = current.finalizers().to_vec();
            if !mutate(&mut finalizers) {
                return Ok(current);
            }
            let patch = json!({ "metadata": {
                "finalizers": finalizers,
                "resourceVersion": current.resource_version(),
            }});
            match api
                .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                .await
            {
                Ok(updated) => return Ok(updated),
                Err(err) if is_conflict(&err) => {
                    current = api.get(&name).await.context(KubeSnafu)?;
                }
                Err(err) => return Err(Error::Kube { source: err }),
            }
        }
        ConflictSnafu { namespace, name }.fail()
    }

    /// Parsed minor version of the management API server. Suffixes like
    /// `"32+"` on managed offerings are tolerated.
    pub async fn server_minor_version(&self) -> Result<u32> {
        let info = self.kube.apiserver_version().await.context(KubeSnafu)?;
        Ok(info
            .minor
            .trim_end_matches(|c: char| !c.is_ascii_digit())
            .parse()
            .unwrap_or(0))
    }

    /// The per-kluster bootstrap secret holding node bootstrap material and
    /// the satellite kubeconfig.
    pub async fn kluster_secret(&self, kluster: &Kluster) -> Result<Secret> {
        let namespace = namespace_of(kluster);
        let name = format!("{}-secret", kluster.name_any());
        let api: Api<Secret> = Api::namespaced(self.kube.clone(), &namespace);
        match api.get(&name).await {
            Ok(secret) => Ok(secret),
            Err(kube::Error::Api(response)) if response.code == 404 => MissingSecretSnafu {
                namespace,
                name: kluster.name_any(),
                secret: name,
            }
            .fail(),
            Err(source) => Err(Error::Kube { source }),
        }
    }

    /// Builds a client for the kluster's own API server from the kubeconfig
    /// stored in its secret.
    pub async fn tenant_client(&self, kluster: &Kluster) -> Result<kube::Client> {
        let secret = self.kluster_secret(kluster).await?;
        let kubeconfig = secret_key(&secret, "kubeconfig")?;
        let kubeconfig: Kubeconfig =
            serde_yaml::from_slice(&kubeconfig).context(MalformedKubeconfigSnafu)?;
        let config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context(TenantConfigSnafu)?;
        kube::Client::try_from(config).context(TenantClientSnafu)
    }
}

pub fn secret_key(secret: &Secret, key: &str) -> Result<Vec<u8>> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|v| v.0.clone())
        .context(MissingSecretKeySnafu {
            secret: secret.name_any(),
            key,
        })
}

fn namespace_of(kluster: &Kluster) -> String {
    kluster.namespace().unwrap_or_else(|| "default".to_owned())
}

/// `namespace/name` queue key for a kluster.
pub fn key_of(kluster: &Kluster) -> String {
    format!("{}/{}", namespace_of(kluster), kluster.name_any())
}

/// Splits a queue key back into namespace and name.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_classification() {
        let conflict = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "conflict".into(),
            reason: "Conflict".into(),
            code: 409,
        });
        assert!(is_conflict(&conflict));
        assert!(!is_unexpected_server_error(&conflict));

        let timeout = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "timeout".into(),
            reason: "ServerTimeout".into(),
            code: 504,
        });
        assert!(is_unexpected_server_error(&timeout));
    }

    #[test]
    fn keys_round_trip() {
        assert_eq!(split_key("qa/d-qa-1"), Some(("qa", "d-qa-1")));
        assert_eq!(split_key("broken"), None);
    }
}
