use anyhow::Result;
use permitflow_core::{
    AppConfig, WorkOrder, WorkOrderCatalog, WorkOrderStatus, effective_status,
};
use permitflow_errors::errors;
use permitflow_observe::Observer;
use permitflow_store::Store;
use std::path::Path;
use std::sync::Arc;

/// Everything a command needs, loaded once per invocation.
pub(crate) struct AppContext {
    pub cfg: AppConfig,
    pub store: Store,
    pub observer: Arc<Observer>,
    pub catalog: WorkOrderCatalog,
}

impl AppContext {
    pub fn load(workspace: &Path, verbose: bool) -> Result<Self> {
        let cfg = AppConfig::load(workspace)?;
        let store = Store::new(workspace)?;
        let mut observer = Observer::new(workspace, &cfg.telemetry)?;
        observer.set_verbose(verbose);
        let catalog = WorkOrderCatalog::new(cfg.catalog.resolve(workspace));
        Ok(Self {
            cfg,
            store,
            observer: Arc::new(observer),
            catalog,
        })
    }

    /// Catalog entry with its locally stored status applied.
    pub fn work_order(&mut self, work_order_id: &str) -> Result<WorkOrder> {
        let Some(mut wo) = self.catalog.find(work_order_id)? else {
            return Err(errors::work_order_not_found(work_order_id).into_error());
        };
        wo.status = self.status_of(&wo)?;
        Ok(wo)
    }

    /// All catalog entries with locally stored statuses applied.
    pub fn work_orders(&mut self) -> Result<Vec<WorkOrder>> {
        let mut orders = self.catalog.load()?.to_vec();
        for wo in &mut orders {
            wo.status = effective_status(wo.status, self.store.get_status(&wo.work_order_id)?);
        }
        Ok(orders)
    }

    fn status_of(&self, wo: &WorkOrder) -> Result<WorkOrderStatus> {
        Ok(effective_status(
            wo.status,
            self.store.get_status(&wo.work_order_id)?,
        ))
    }
}
