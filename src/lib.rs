//! Quay - a multi-protocol redirecting proxy for container fleets.
//!
//! Quay intercepts outbound connection requests (HTTP forward, HTTP
//! reverse, SOCKS v5, DNS) and rewrites the destination hostname
//! according to a per-account, regular-expression routing table. The
//! table is assembled from two sources of truth - the Docker Remote API
//! and an etcd configuration tree - and rebuilt automatically whenever
//! either side changes.
//!
//! # Architecture
//! The crate follows a hexagonal layout. `core` holds the routing
//! domain: the route model and matcher, the snapshot builder, the
//! lock-free snapshot registry and the debounced reload coordinator.
//! `ports` defines the traits at the I/O seams, `adapters` implements
//! them (etcd, Docker) alongside the four protocol front-ends. The
//! front-ends only ever touch the core through [`Registry::get`] and
//! [`core::RouteList::replace`](core::route::RouteList::replace).
//!
//! # Consistency model
//! Snapshots are immutable and replaced wholesale by atomic pointer
//! swap. A failed rebuild leaves the previous snapshot in place; a
//! request that resolved an account keeps a self-consistent view for
//! its whole lifetime. After one quiet second following the last
//! upstream change, the published table reflects that change.
pub mod adapters;
pub mod core;
pub mod ports;
pub mod tracing_setup;

pub use crate::{
    adapters::{DnsServer, DockerClient, EtcdClient, HttpProxy, RevHttpProxy, SocksProxy},
    core::{Registry, Reloader},
};
