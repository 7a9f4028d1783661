//! # Iroh mirror peering
//!
//! This crate keeps locally owned replicated logs ("cores") and multi-writer
//! groups of them ("autobases") continuously mirrored on a small, stable set
//! of always-on mirror peers. Each resource is mapped onto the mirrors
//! closest to it in XOR space, so every device sharing a resource picks the
//! same mirrors without coordinating.
//!
//! The crate is split into a handful of modules that can be reused
//! independently:
//!
//! - [`core`]: keys, XOR distance and closest-mirror selection.
//! - [`backoff`]: the jittered retry delays used by the reconnect loop.
//! - [`encoding`] and [`protocol`]: the compact wire records exchanged with
//!   mirrors.
//! - [`framing`]: length-prefixed frames on a byte stream.
//! - [`transport`] and [`resource`]: the seams the orchestrator is generic
//!   over.
//! - [`peer`] and [`registry`]: reconnecting sessions and their shared,
//!   garbage-collected pool.
//! - [`peering`]: the [`MirrorPeering`] orchestrator itself.
//! - [`net`] and [`server`]: the iroh-based client and mirror sides.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use anyhow::Result;
//! use iroh::Endpoint;
//! use iroh_mirror_peering::{
//!     AddCoreOptions, Core, IrohTransport, MirrorPeering, PeeringConfig, MIRROR_ALPN,
//! };
//!
//! # async fn launch(endpoint: Endpoint, core: Arc<dyn Core>) -> Result<()> {
//! let config = PeeringConfig::from_json(r#"{ "core_mirrors": ["<hex mirror key>"] }"#)?;
//! let peering = MirrorPeering::builder(IrohTransport::new(endpoint))
//!     .config(config)
//!     .build();
//! peering.add_core(core, None, AddCoreOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod core;
pub mod encoding;
pub mod framing;
pub mod net;
pub mod peer;
pub mod peering;
pub mod protocol;
pub mod registry;
pub mod resource;
pub mod server;
pub mod transport;

pub use crate::backoff::{Backoff, Wake, DEFAULT_BACKOFF};
pub use crate::config::{PeeringConfig, DEFAULT_MAX_AUTOBASE_WRITERS, DEFAULT_PICK};
pub use crate::core::{closest, closest_one, distance_cmp, xor_distance, Key, Keyed};
pub use crate::encoding::DecodeError;
pub use crate::net::{IrohSession, IrohTransport, MIRROR_ALPN};
pub use crate::peer::{PeerConnection, PeerOptions, PeerStatus, DEFAULT_REQUEST_ATTEMPTS};
pub use crate::peering::{
    AddAutobaseOptions, AddCoreOptions, DeleteCoreOptions, MirrorPeering, NetworkChange,
    PeeringBuilder,
};
pub use crate::protocol::{
    AddCoreRequest, DeleteCoreRequest, MailboxRequest, Method, MirrorAddr, MirrorRequest, Response,
};
pub use crate::registry::{GcPolicy, PeerLease, Registry};
pub use crate::resource::{Autobase, AutobaseDescriptor, AutobaseEvent, Core};
pub use crate::server::{dispatch, handle_connection, MirrorProtocolHandler, MirrorService};
pub use crate::transport::{MirrorSession, MirrorTransport, Replicator, RequestError};
