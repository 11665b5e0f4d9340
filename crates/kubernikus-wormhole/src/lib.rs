//! Wormhole: reverse tunnels from the kubernikus control plane to its
//! worker nodes, plus the NAT redirection that makes the apiserver's
//! node-bound traffic use them.

pub mod config;
pub mod controller;
pub mod iptables;
pub mod tunnel;
