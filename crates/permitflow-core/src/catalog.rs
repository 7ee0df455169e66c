//! Work-order catalog backed by a static JSON file.
//!
//! The catalog is an explicit object owned by its caller: it loads lazily,
//! serves the cached list afterwards, and only re-reads the file after
//! [`WorkOrderCatalog::invalidate`].

use crate::{Result, WorkOrder, WorkOrderStatus};
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const ITEMS_PER_PAGE: usize = 10;
const TITLE_CHARS: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogFile {
    work_orders: Vec<WorkOrder>,
}

#[derive(Debug)]
pub struct WorkOrderCatalog {
    path: PathBuf,
    cached: Option<Vec<WorkOrder>>,
}

impl WorkOrderCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.cached.is_some()
    }

    pub fn load(&mut self) -> Result<&[WorkOrder]> {
        if self.cached.is_none() {
            let raw = fs::read_to_string(&self.path).with_context(|| {
                format!("failed to read work orders from {}", self.path.display())
            })?;
            let file: CatalogFile = serde_json::from_str(&raw)
                .with_context(|| format!("invalid work order file {}", self.path.display()))?;
            let orders = file
                .work_orders
                .into_iter()
                .map(|mut wo| {
                    wo.title = Some(derive_title(&wo.description));
                    wo
                })
                .collect();
            self.cached = Some(orders);
        }
        Ok(self.cached.as_deref().unwrap_or_default())
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    pub fn find(&mut self, work_order_id: &str) -> Result<Option<WorkOrder>> {
        Ok(self
            .load()?
            .iter()
            .find(|wo| wo.work_order_id == work_order_id)
            .cloned())
    }
}

/// First 100 characters of the description, with `...` when truncated.
pub fn derive_title(description: &str) -> String {
    let mut chars = description.chars();
    let head: String = chars.by_ref().take(TITLE_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkOrderFilter {
    pub search: Option<String>,
    pub status: Option<WorkOrderStatus>,
}

impl WorkOrderFilter {
    /// Case-insensitive search over id, title and location, plus an exact status match.
    pub fn matches(&self, wo: &WorkOrder) -> bool {
        let matches_search = match self.search.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(term) => {
                let term = term.to_lowercase();
                wo.work_order_id.to_lowercase().contains(&term)
                    || wo
                        .title
                        .as_deref()
                        .is_some_and(|t| t.to_lowercase().contains(&term))
                    || wo.location.to_lowercase().contains(&term)
            }
        };
        let matches_status = self.status.is_none_or(|status| wo.status == status);
        matches_search && matches_status
    }
}

/// One-based page of `ITEMS_PER_PAGE` items; out-of-range pages are empty.
pub fn paginate<T>(items: &[T], page: usize) -> &[T] {
    let start = page.saturating_sub(1).saturating_mul(ITEMS_PER_PAGE);
    if start >= items.len() {
        return &[];
    }
    let end = (start + ITEMS_PER_PAGE).min(items.len());
    &items[start..end]
}
