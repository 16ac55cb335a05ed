//! One active recording per page handle.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use pagereel_core::{PageId, RecorderError, Result};

/// Pages that currently have a starting or running recording.
#[derive(Debug, Default)]
pub struct ActivePages {
    pages: DashMap<PageId, ()>,
}

static GLOBAL: OnceLock<Arc<ActivePages>> = OnceLock::new();

impl ActivePages {
    /// Process-wide registry used by default.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(Arc::default))
    }

    /// Claim `page`. Fails with `AlreadyActive` if it is already claimed.
    pub fn acquire(self: &Arc<Self>, page: &PageId) -> Result<PageLease> {
        match self.pages.entry(page.clone()) {
            Entry::Occupied(_) => Err(RecorderError::AlreadyActive {
                page: page.to_string(),
            }),
            Entry::Vacant(slot) => {
                let _ = slot.insert(());
                Ok(PageLease {
                    registry: Arc::clone(self),
                    page: page.clone(),
                })
            }
        }
    }

    /// Whether `page` is claimed.
    pub fn is_active(&self, page: &PageId) -> bool {
        self.pages.contains_key(page)
    }
}

/// Claim on a page; released on drop.
#[derive(Debug)]
pub struct PageLease {
    registry: Arc<ActivePages>,
    page: PageId,
}

impl Drop for PageLease {
    fn drop(&mut self) {
        let _ = self.registry.pages.remove(&self.page);
    }
}
