//! The observatory keeps one watch on every running kluster's node list
//! and nudges the launch queue when a node's health or schedulability
//! flips. Without it the launch controller would only notice dying nodes
//! on the slow periodic resync.

use std::{
    collections::HashMap,
    pin::pin,
    sync::Arc,
    time::Duration,
};

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::{
    Api, ResourceExt,
    runtime::{WatchStreamExt, watcher},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    client::{Client, Result, key_of},
    kluster::{Kluster, KlusterPhase},
    queue::WorkQueue,
};

/// How often the set of watched klusters is reconciled against the store.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(60);
/// Pause before re-dialing a satellite whose watch collapsed.
const REDIAL_DELAY: Duration = Duration::from_secs(30);

/// The node facts a flip of which warrants a reconcile pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeFacts {
    pub ready: bool,
    pub unschedulable: bool,
}

pub fn node_facts(node: &Node) -> NodeFacts {
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == "Ready"))
        .is_some_and(|c| c.status == "True");
    NodeFacts {
        ready,
        unschedulable: node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false),
    }
}

pub struct Observatory {
    pub client: Client,
    pub queue: Arc<WorkQueue>,
}

impl Observatory {
    /// Runs until cancelled, keeping one node watch per running kluster.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut watches: HashMap<String, CancellationToken> = HashMap::new();
        let mut ticker = tokio::time::interval(SYNC_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.sync_watches(&mut watches, &cancel).await {
                warn!(error = %snafu::Report::from_error(err), "observatory sync failed");
            }
        }
        for token in watches.values() {
            token.cancel();
        }
    }

    async fn sync_watches(
        &self,
        watches: &mut HashMap<String, CancellationToken>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let klusters = self.client.list_klusters().await?;
        let mut wanted = HashMap::new();
        for kluster in klusters {
            if kluster.phase() == KlusterPhase::Running && !kluster.disabled() {
                wanted.insert(key_of(&kluster), kluster);
            }
        }

        watches.retain(|key, token| {
            let keep = wanted.contains_key(key);
            if !keep {
                info!(kluster = %key, "stopping node watch");
                token.cancel();
            }
            keep
        });

        for (key, kluster) in wanted {
            if watches.contains_key(&key) {
                continue;
            }
            info!(kluster = %key, "starting node watch");
            let token = cancel.child_token();
            watches.insert(key.clone(), token.clone());
            let client = self.client.clone();
            let queue = Arc::clone(&self.queue);
            tokio::spawn(async move {
                watch_nodes(client, kluster, key, queue, token).await;
            });
        }
        Ok(())
    }
}

/// Watches one satellite's nodes until cancelled, re-dialing after
/// failures. Enqueues the kluster key whenever a node's facts flip or a
/// node disappears.
async fn watch_nodes(
    client: Client,
    kluster: Kluster,
    key: String,
    queue: Arc<WorkQueue>,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        let tenant = match client.tenant_client(&kluster).await {
            Ok(tenant) => tenant,
            Err(err) => {
                debug!(kluster = %key, error = %err, "satellite API not reachable");
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(REDIAL_DELAY) => continue,
                }
            }
        };

        let api: Api<Node> = Api::all(tenant);
        let mut seen: HashMap<String, NodeFacts> = HashMap::new();
        let mut stream = pin!(watcher(api, watcher::Config::default()).default_backoff());
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return,
                event = stream.try_next() => event,
            };
            match event {
                Ok(Some(watcher::Event::Apply(node) | watcher::Event::InitApply(node))) => {
                    let facts = node_facts(&node);
                    if seen.insert(node.name_any(), facts) != Some(facts) {
                        debug!(kluster = %key, node = %node.name_any(), ?facts, "node facts changed");
                        queue.add(&key);
                    }
                }
                Ok(Some(watcher::Event::Delete(node))) => {
                    seen.remove(&node.name_any());
                    queue.add(&key);
                }
                Ok(Some(watcher::Event::Init | watcher::Event::InitDone)) => {}
                Ok(None) => break,
                Err(err) => {
                    warn!(kluster = %key, error = %err, "node watch hiccup");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{NodeCondition, NodeSpec, NodeStatus};

    use super::*;

    fn node(ready: &str, unschedulable: Option<bool>) -> Node {
        Node {
            spec: Some(NodeSpec {
                unschedulable,
                ..NodeSpec::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: ready.into(),
                    ..NodeCondition::default()
                }]),
                ..NodeStatus::default()
            }),
            ..Node::default()
        }
    }

    #[test]
    fn facts_projection() {
        assert_eq!(
            node_facts(&node("True", None)),
            NodeFacts { ready: true, unschedulable: false }
        );
        assert_eq!(
            node_facts(&node("Unknown", Some(true))),
            NodeFacts { ready: false, unschedulable: true }
        );
        assert_eq!(
            node_facts(&Node::default()),
            NodeFacts { ready: false, unschedulable: false }
        );
    }
}
