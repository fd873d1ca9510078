//! Faasgate - a gateway that turns container images into ephemeral services
//!
//! This library provides a function-as-a-service gateway that:
//! - Routes HTTP traffic by the first path segment to a named function
//! - Launches a container for the function on demand when traffic arrives
//! - Polls the container runtime for a reachable host port before serving
//! - Proxies requests through with streamed bodies in both directions
//! - Coalesces concurrent requests for a function onto one instance
//! - Removes the container as soon as no request is using it

pub mod admin;
pub mod config;
pub mod docker;
pub mod error;
pub mod forward;
pub mod invoker;
pub mod probe;
pub mod proxy;
pub mod registry;
pub mod runner;
