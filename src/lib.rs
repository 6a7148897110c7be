//! Proxydeck - fleet control plane for heterogeneous reverse proxies
//!
//! This library drives NGINX, Traefik, Caddy and HAProxy servers through one
//! capability set:
//! - Health, metrics, configuration read/write, reload and live log tails
//! - Pooled remote-shell sessions for shell-managed servers
//! - Event fan-out to dashboard observers with per-server interest filtering
//! - Encrypted-at-rest credentials, decrypted only for the call that needs them

pub mod adapter;
pub mod admin;
pub mod config;
pub mod error;
pub mod factory;
pub mod hub;
pub mod model;
pub mod monitor;
pub mod pool;
pub mod service;
pub mod transport;
pub mod vault;
