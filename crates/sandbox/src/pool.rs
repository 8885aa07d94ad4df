use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Result, SandboxError};
use crate::launcher::IsolateLauncher;
use crate::sandbox::IsolateBox;
use crate::{BoxId, IsolateConfig};

/// Allocator of `isolate` box ids. Cloning yields another handle to the same pool.
#[derive(Debug, Clone)]
pub struct BoxPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    launcher: IsolateLauncher,
    // Held across the isolate invocations so init/cleanup of one id never races.
    in_use: Mutex<BTreeSet<BoxId>>,
}

impl BoxPool {
    /// Probes `isolate --version` and returns an empty pool.
    pub async fn new(config: IsolateConfig) -> Result<Self> {
        let pool = Self::unprobed(config);
        pool.version().await?;
        Ok(pool)
    }

    pub fn unprobed(config: IsolateConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                launcher: IsolateLauncher::new(config),
                in_use: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    pub async fn version(&self) -> Result<String> {
        self.inner.launcher.version().await
    }

    pub fn config(&self) -> &IsolateConfig {
        self.inner.launcher.config()
    }

    pub(crate) fn launcher(&self) -> &IsolateLauncher {
        &self.inner.launcher
    }

    /// Leases the lowest free id, after a cleanup-then-init of its root.
    /// On failure the id stays free.
    pub async fn allocate(&self) -> Result<IsolateBox> {
        let mut in_use = self.inner.in_use.lock().await;
        let box_id = lowest_free(&in_use);
        self.inner.launcher.cleanup(box_id).await?;
        let root = self.inner.launcher.init(box_id).await?;
        in_use.insert(box_id);
        info!(box_id, root = %root.display(), "created box");
        Ok(IsolateBox::new(self.clone(), box_id, root))
    }

    /// Cleans up `box_id` and frees it. The id is freed even if cleanup fails.
    pub async fn release(&self, box_id: BoxId) -> Result<()> {
        let mut in_use = self.inner.in_use.lock().await;
        if !in_use.contains(&box_id) {
            return Err(SandboxError::BoxNotInUse(box_id));
        }
        let cleanup = self.inner.launcher.cleanup(box_id).await;
        in_use.remove(&box_id);
        match &cleanup {
            Ok(()) => info!(box_id, "released box"),
            Err(err) => warn!(box_id, error = %err, "box cleanup failed; id freed anyway"),
        }
        cleanup
    }

    pub async fn in_use(&self) -> Vec<BoxId> {
        self.inner.in_use.lock().await.iter().copied().collect()
    }
}

fn lowest_free(in_use: &BTreeSet<BoxId>) -> BoxId {
    (0..)
        .find(|candidate| !in_use.contains(candidate))
        .unwrap_or(BoxId::MAX)
}
