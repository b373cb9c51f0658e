//! Strategies that fail on purpose, for forcing the fallback chain.

use std::time::Duration;

use async_trait::async_trait;
use x11q_core::PathKind;
use x11q_linux::establish::Target;
use x11q_linux::{BoxedLink, LinkError, Strategy};

/// Gives up at once.
pub struct Failing(pub PathKind);

#[async_trait]
impl Strategy for Failing {
    fn kind(&self) -> PathKind {
        self.0
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn attempt(&self, _: &Target) -> Result<BoxedLink, LinkError> {
        Err(LinkError::Unavailable)
    }
}

/// Never answers; the establisher cuts it off after `timeout`.
pub struct Hanging {
    pub kind: PathKind,
    pub timeout: Duration,
}

#[async_trait]
impl Strategy for Hanging {
    fn kind(&self) -> PathKind {
        self.kind
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, target: &Target) -> Result<BoxedLink, LinkError> {
        tracing::trace!(kind = %self.kind, node = %target.node_id.short(), "swallowing attempt");
        std::future::pending().await
    }
}
