//! Embeddable MQTT v3.1.1 broker core.
//!
//! Speaks QoS 0 and QoS 1: wildcard subscriptions, retained messages, will
//! messages, keep-alive supervision and exponential-backoff retransmission
//! of unacknowledged deliveries. Framing is pluggable through
//! [`transport::Codec`]; authentication, authorization, persistence and
//! lifecycle observation through [`hook::Hook`]; cross-broker fan-out
//! through [`fanout::Bus`].
//!
//! Build a [`context::ServerContext`], hand it to [`server::MqttServer`]
//! and call `serve`. Sessions can also be driven without TCP by feeding a
//! [`transport::PacketStream`] straight into [`session::process`].

#![deny(unsafe_code)]

pub mod context;
pub mod error;
pub mod fanout;
pub mod hook;
pub mod inflight;
pub mod packet;
pub mod retain;
pub mod retry;
pub mod router;
pub mod server;
pub mod session;
pub mod settings;
pub mod shared;
pub mod topic;
pub mod transport;
pub mod trie;
pub mod types;
pub mod utils;

pub use crate::error::{Error, MqttError, Result};
