//! Kubernikus: manages the full lifecycle of OpenStack-backed Kubernetes
//! clusters ("klusters") declared as custom resources, from booting node
//! pools to garbage-collecting the cloud resources of deleted clusters.

pub mod client;
pub mod cloud;
pub mod config;
pub mod controller;
pub mod deorbit;
pub mod hammertime;
pub mod kluster;
pub mod launch;
pub mod metrics;
pub mod observatory;
pub mod queue;
pub mod routegc;
