//! reqwest-based implementation of the [`CloudProvider`] façade against
//! Keystone, Nova and Neutron.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use kube::ResourceExt;
use serde::Deserialize;
use serde_json::json;
use snafu::{OptionExt, ResultExt};
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    ApiSnafu, AuthSnafu, CloudNode, CloudProvider, Error, HttpSnafu, MalformedResponseSnafu,
    MissingEndpointSnafu, NodeState, Result, RouterRoute,
};
use crate::kluster::Kluster;

#[derive(Clone, Debug)]
pub struct AuthOptions {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub user_domain: String,
    pub project_id: String,
}

#[derive(Clone)]
struct Token {
    value: String,
    compute_url: String,
    network_url: String,
    identity_url: String,
}

pub struct OpenStack {
    http: reqwest::Client,
    auth: AuthOptions,
    token: RwLock<Option<Token>>,
}

impl OpenStack {
    pub fn new(auth: AuthOptions) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth,
            token: RwLock::new(None),
        }
    }

    async fn token(&self) -> Result<Token> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        let token = self.authenticate().await?;
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn authenticate(&self) -> Result<Token> {
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": { "user": {
                        "name": self.auth.username,
                        "domain": { "name": self.auth.user_domain },
                        "password": self.auth.password,
                    }},
                },
                "scope": { "project": { "id": self.auth.project_id } },
            }
        });
        let response = self
            .http
            .post(format!("{}/auth/tokens", self.auth.auth_url))
            .json(&body)
            .send()
            .await
            .context(HttpSnafu)?;
        if !response.status().is_success() {
            return AuthSnafu {
                message: format!("keystone returned {}", response.status()),
            }
            .fail();
        }
        let value = response
            .headers()
            .get("x-subject-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .context(AuthSnafu {
                message: "response carried no x-subject-token header",
            })?;

        #[derive(Deserialize)]
        struct TokenBody {
            token: Catalog,
        }
        #[derive(Deserialize)]
        struct Catalog {
            catalog: Vec<Service>,
        }
        #[derive(Deserialize)]
        struct Service {
            #[serde(rename = "type")]
            type_: String,
            endpoints: Vec<Endpoint>,
        }
        #[derive(Deserialize)]
        struct Endpoint {
            interface: String,
            url: String,
        }

        let body: TokenBody = response.json().await.context(HttpSnafu)?;
        let endpoint = |wanted: &str| -> Result<String> {
            body.token
                .catalog
                .iter()
                .find(|s| s.type_ == wanted)
                .and_then(|s| s.endpoints.iter().find(|e| e.interface == "public"))
                .map(|e| e.url.trim_end_matches('/').to_owned())
                .context(MissingEndpointSnafu { endpoint: wanted })
        };

        Ok(Token {
            compute_url: endpoint("compute")?,
            network_url: endpoint("network")?,
            identity_url: endpoint("identity")?,
            value,
        })
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: String,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let token = self.token().await?;
        let mut request = self
            .http
            .request(method, &url)
            .header("x-auth-token", &token.value);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.context(HttpSnafu)?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            // Token expired, force a fresh authentication on the next call.
            *self.token.write().await = None;
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return ApiSnafu {
                status: status.as_u16(),
                message,
            }
            .fail();
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(serde_json::Value::Null);
        }
        response.json().await.context(HttpSnafu)
    }

    async fn servers_with_prefix(&self, prefix: &str) -> Result<Vec<serde_json::Value>> {
        let token = self.token().await?;
        let body = self
            .request(
                reqwest::Method::GET,
                format!("{}/servers/detail?name=^{}", token.compute_url, prefix),
                None,
            )
            .await?;
        body.get("servers")
            .and_then(|s| s.as_array())
            .cloned()
            .context(MalformedResponseSnafu { what: "server list" })
    }

    async fn server_group_id(&self, name: &str) -> Result<Option<String>> {
        let token = self.token().await?;
        let body = self
            .request(
                reqwest::Method::GET,
                format!("{}/os-server-groups", token.compute_url),
                None,
            )
            .await?;
        let groups = body
            .get("server_groups")
            .and_then(|g| g.as_array())
            .cloned()
            .context(MalformedResponseSnafu {
                what: "server group list",
            })?;
        Ok(groups
            .iter()
            .find(|g| g.get("name").and_then(|n| n.as_str()) == Some(name))
            .and_then(|g| g.get("id").and_then(|i| i.as_str()))
            .map(str::to_owned))
    }
}

fn node_prefix(kluster: &Kluster, pool: &str) -> String {
    format!("{}-{pool}-", kluster.name_any())
}

fn classify(server: &serde_json::Value) -> NodeState {
    let status = server.get("status").and_then(|s| s.as_str()).unwrap_or("");
    let task_state = server
        .get("OS-EXT-STS:task_state")
        .and_then(|s| s.as_str())
        .unwrap_or("");
    if task_state == "deleting" {
        return NodeState::Stopping;
    }
    match status {
        "ACTIVE" => NodeState::Running,
        "BUILD" | "REBUILD" | "UNKNOWN" => NodeState::Starting,
        _ => NodeState::Stopping,
    }
}

#[async_trait]
impl CloudProvider for OpenStack {
    async fn get_nodes(&self, kluster: &Kluster, pool: &str) -> Result<Vec<CloudNode>> {
        let servers = self.servers_with_prefix(&node_prefix(kluster, pool)).await?;
        Ok(servers
            .iter()
            .filter_map(|server| {
                let id = server.get("id")?.as_str()?.to_owned();
                let name = server.get("name")?.as_str()?.to_owned();
                Some(CloudNode {
                    state: classify(server),
                    id,
                    name,
                })
            })
            .collect())
    }

    async fn create_node(&self, kluster: &Kluster, pool: &str, userdata: &[u8]) -> Result<String> {
        let token = self.token().await?;
        let spec = kluster
            .spec
            .node_pools
            .iter()
            .find(|p| p.name == pool)
            .context(MalformedResponseSnafu { what: "node pool" })?;
        let name = format!(
            "{}{}",
            node_prefix(kluster, pool),
            &uuid::Uuid::new_v4().simple().to_string()[..10]
        );
        let body = json!({
            "server": {
                "name": name,
                "imageRef": spec.image,
                "flavorRef": spec.flavor,
                "user_data": BASE64.encode(userdata),
                "networks": [{ "uuid": kluster.spec.openstack.network_id }],
                "security_groups": [{ "name": kluster.spec.openstack.security_group_name }],
            }
        });
        let response = self
            .request(
                reqwest::Method::POST,
                format!("{}/servers", token.compute_url),
                Some(body),
            )
            .await?;
        debug!(server = %name, "created instance");
        response
            .get("server")
            .and_then(|s| s.get("id"))
            .and_then(|i| i.as_str())
            .map(str::to_owned)
            .context(MalformedResponseSnafu { what: "server" })
    }

    async fn delete_node(&self, _kluster: &Kluster, id: &str) -> Result<()> {
        let token = self.token().await?;
        self.request(
            reqwest::Method::DELETE,
            format!("{}/servers/{id}", token.compute_url),
            None,
        )
        .await?;
        Ok(())
    }

    async fn delete_pool(&self, kluster: &Kluster, pool: &str) -> Result<()> {
        let name = format!("{}-{pool}", kluster.name_any());
        let Some(id) = self.server_group_id(&name).await? else {
            return Ok(());
        };
        let token = self.token().await?;
        self.request(
            reqwest::Method::DELETE,
            format!("{}/os-server-groups/{id}", token.compute_url),
            None,
        )
        .await?;
        Ok(())
    }

    async fn delete_user(&self, name: &str, domain: &str) -> Result<()> {
        let token = self.token().await?;
        let body = self
            .request(
                reqwest::Method::GET,
                format!("{}/users?name={name}&domain_id={domain}", token.identity_url),
                None,
            )
            .await?;
        let Some(id) = body
            .get("users")
            .and_then(|u| u.as_array())
            .and_then(|u| u.first())
            .and_then(|u| u.get("id"))
            .and_then(|i| i.as_str())
        else {
            return Ok(());
        };
        self.request(
            reqwest::Method::DELETE,
            format!("{}/users/{id}", token.identity_url),
            None,
        )
        .await?;
        Ok(())
    }

    async fn list_instance_ips(&self, kluster: &Kluster) -> Result<Vec<Ipv4Addr>> {
        let servers = self
            .servers_with_prefix(&format!("{}-", kluster.name_any()))
            .await?;
        let mut ips = Vec::new();
        for server in &servers {
            let Some(networks) = server.get("addresses").and_then(|a| a.as_object()) else {
                continue;
            };
            for addresses in networks.values() {
                let Some(addresses) = addresses.as_array() else {
                    continue;
                };
                for address in addresses {
                    if let Some(ip) = address
                        .get("addr")
                        .and_then(|a| a.as_str())
                        .and_then(|a| a.parse().ok())
                    {
                        ips.push(ip);
                    }
                }
            }
        }
        Ok(ips)
    }

    async fn get_router_routes(&self, router_id: &str) -> Result<Vec<RouterRoute>> {
        let token = self.token().await?;
        let body = self
            .request(
                reqwest::Method::GET,
                format!("{}/v2.0/routers/{router_id}", token.network_url),
                None,
            )
            .await?;
        let routes = body
            .get("router")
            .and_then(|r| r.get("routes"))
            .and_then(|r| r.as_array())
            .cloned()
            .context(MalformedResponseSnafu { what: "router" })?;
        Ok(routes
            .iter()
            .filter_map(|route| {
                Some(RouterRoute {
                    destination: route.get("destination")?.as_str()?.parse().ok()?,
                    nexthop: route.get("nexthop")?.as_str()?.parse().ok()?,
                })
            })
            .collect())
    }

    async fn set_router_routes(&self, router_id: &str, routes: &[RouterRoute]) -> Result<()> {
        let token = self.token().await?;
        let routes: Vec<_> = routes
            .iter()
            .map(|r| {
                json!({
                    "destination": r.destination.to_string(),
                    "nexthop": r.nexthop.to_string(),
                })
            })
            .collect();
        self.request(
            reqwest::Method::PUT,
            format!("{}/v2.0/routers/{router_id}", token.network_url),
            Some(json!({ "router": { "routes": routes } })),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_states_collapse_to_three_phases() {
        let classify_json = |status: &str, task: Option<&str>| {
            let mut server = json!({ "status": status });
            if let Some(task) = task {
                server["OS-EXT-STS:task_state"] = json!(task);
            }
            classify(&server)
        };
        assert_eq!(classify_json("ACTIVE", None), NodeState::Running);
        assert_eq!(classify_json("BUILD", None), NodeState::Starting);
        assert_eq!(classify_json("ACTIVE", Some("deleting")), NodeState::Stopping);
        assert_eq!(classify_json("SHUTOFF", None), NodeState::Stopping);
    }
}
