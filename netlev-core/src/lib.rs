//! RDMA-backed shuffle transport: credit-flow-controlled fetch of map-output bytes
//! from a supplier process into a reducer's registered buffers.
//!
//! `client`/`server` are the two engines a MapReduce task process embeds; everything
//! else is shared machinery built up from the wire format outward: `wire` (codec),
//! `verbs` (device/completion vocabulary), `device` (completion queue), `reactor`
//! (event loop), `connection` (lifecycle + credit protocol), `pool` (registered
//! buffers), `collaborators` (merge manager / MOF store contracts), `commands` (host
//! control channel grammar).

pub mod client;
pub mod collaborators;
pub mod commands;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod pool;
pub mod reactor;
pub mod server;
pub mod verbs;
pub mod wire;

pub use config::ShuffleConfig;
pub use error::{Error, Result};
