//! TSGW - a host-header reverse proxy gateway for a private overlay network
//!
//! One embedded overlay node hosts a named service per configured route.
//! This library provides the pieces the binary assembles:
//! - Brings the overlay node to `Running`, issuing auth keys on demand
//! - Reconciles advertised service names and per-service serve config
//!   with the declared routes
//! - Terminates each service's traffic on a loopback listener and reverse
//!   proxies it to the route's private backend with pooled transports
//! - Redirects the plain-HTTP side of every service to HTTPS
//! - Shuts everything down inside a bounded deadline

pub mod authkey;
pub mod config;
pub mod error;
pub mod gateway;
pub mod localapi;
pub mod node;
pub mod reconcile;
pub mod route_proxy;
pub mod runtime;
pub mod transport;
