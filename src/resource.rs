//! Capabilities the orchestrator needs from the things it mirrors.
//!
//! Hosts implement [`Core`] for their replicated logs and [`Autobase`] for
//! multi-writer groups. The orchestrator only needs an identifier, a
//! readiness and close lifecycle, and for groups a feed of writer-set
//! changes.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::core::Key;

/// A single replicated log.
#[async_trait]
pub trait Core: Send + Sync + 'static {
    fn key(&self) -> Key;

    /// Resolve once the core has finished opening.
    async fn ready(&self) -> Result<()>;

    /// Whether the core has started closing.
    fn is_closing(&self) -> bool;

    /// Resolve once the core is closing or closed. Must resolve immediately
    /// if that already happened.
    async fn closed(&self);

    /// A static core has no active signers and will never grow again.
    fn is_static(&self) -> bool {
        false
    }
}

/// Writer-set changes published by an [`Autobase`].
#[derive(Clone)]
pub enum AutobaseEvent {
    /// A writer core joined the group.
    Writer(Arc<dyn Core>),
    /// The group's storage was reshuffled; keys of its cores may have moved.
    Migrate,
}

impl fmt::Debug for AutobaseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutobaseEvent::Writer(core) => f
                .debug_tuple("Writer")
                .field(&hex::encode(core.key()))
                .finish(),
            AutobaseEvent::Migrate => f.write_str("Migrate"),
        }
    }
}

/// System core details that older mirrors expect next to the local writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AutobaseDescriptor {
    pub key: Key,
    pub block_encryption_key: Option<Key>,
}

/// A multi-writer group of cores.
#[async_trait]
pub trait Autobase: Send + Sync + 'static {
    /// The group's key, used as `referrer` for every member core.
    fn key(&self) -> Key;

    async fn ready(&self) -> Result<()>;

    fn is_closing(&self) -> bool;

    async fn closed(&self);

    /// The writer core owned by this device, if it is a writer.
    fn local_writer(&self) -> Option<Arc<dyn Core>>;

    /// All writer cores currently known.
    fn writers(&self) -> Vec<Arc<dyn Core>>;

    fn subscribe(&self) -> broadcast::Receiver<AutobaseEvent>;

    fn descriptor(&self) -> Option<AutobaseDescriptor> {
        None
    }
}
