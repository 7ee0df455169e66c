use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub mod catalog;
pub mod lenient;

pub use catalog::{ITEMS_PER_PAGE, WorkOrderCatalog, WorkOrderFilter, derive_title, paginate};

pub type Result<T> = anyhow::Result<T>;

/// Policy version reported when the agent omits `runMeta`.
pub const DEFAULT_POLICY_VERSION: &str = "v1.0";
pub const DEFAULT_APP_NAME: &str = "sequential_agent";
pub const DEFAULT_ENDPOINT: &str = "http://localhost:8000";

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".permitflow")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkOrderStatus {
    #[default]
    New,
    #[serde(rename = "In-Progress", alias = "InProgress")]
    InProgress,
    Completed,
}

impl WorkOrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkOrderStatus::New => "New",
            WorkOrderStatus::InProgress => "In-Progress",
            WorkOrderStatus::Completed => "Completed",
        }
    }
}

impl std::fmt::Display for WorkOrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkOrderStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(WorkOrderStatus::New),
            "in-progress" | "in_progress" | "inprogress" => Ok(WorkOrderStatus::InProgress),
            "completed" => Ok(WorkOrderStatus::Completed),
            _ => Err(anyhow::anyhow!(
                "unknown work order status '{s}' (expected New, In-Progress, Completed)"
            )),
        }
    }
}

/// A locally stored status wins over the catalog value unless it is still `New`.
pub fn effective_status(catalog: WorkOrderStatus, stored: WorkOrderStatus) -> WorkOrderStatus {
    if stored != WorkOrderStatus::New {
        stored
    } else {
        catalog
    }
}

pub fn is_valid_work_order_transition(from: WorkOrderStatus, to: WorkOrderStatus) -> bool {
    if from == to {
        return true;
    }
    match from {
        WorkOrderStatus::New => matches!(to, WorkOrderStatus::InProgress),
        WorkOrderStatus::InProgress => {
            matches!(to, WorkOrderStatus::Completed | WorkOrderStatus::New)
        }
        WorkOrderStatus::Completed => false,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermitStatus {
    #[default]
    #[serde(alias = "draft")]
    Draft,
    #[serde(alias = "pending")]
    Pending,
    #[serde(alias = "approved")]
    Approved,
}

impl PermitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermitStatus::Draft => "Draft",
            PermitStatus::Pending => "Pending",
            PermitStatus::Approved => "Approved",
        }
    }
}

impl std::fmt::Display for PermitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PermitStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(PermitStatus::Draft),
            "pending" => Ok(PermitStatus::Pending),
            "approved" => Ok(PermitStatus::Approved),
            _ => Err(anyhow::anyhow!(
                "unknown permit status '{s}' (expected Draft, Pending, Approved)"
            )),
        }
    }
}

pub fn is_valid_permit_transition(from: PermitStatus, to: PermitStatus) -> bool {
    if from == to {
        return true;
    }
    match from {
        PermitStatus::Draft => matches!(to, PermitStatus::Pending),
        PermitStatus::Pending => matches!(to, PermitStatus::Approved | PermitStatus::Draft),
        PermitStatus::Approved => false,
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("work order {work_order_id} cannot move from {from} to {to}")]
    WorkOrder {
        work_order_id: String,
        from: WorkOrderStatus,
        to: WorkOrderStatus,
    },
    #[error("permit {permit_id} cannot move from {from} to {to}")]
    Permit {
        permit_id: String,
        from: PermitStatus,
        to: PermitStatus,
    },
    #[error("permit {permit_id} failed validation and cannot be approved")]
    FailedValidation { permit_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationStatus {
    #[serde(alias = "pass", alias = "ok")]
    Pass,
    #[serde(alias = "PassWithWarnings", alias = "warn")]
    Warn,
    #[serde(alias = "fail", alias = "error")]
    Fail,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Pass => "Pass",
            ValidationStatus::Warn => "Warn",
            ValidationStatus::Fail => "Fail",
        }
    }
}

impl std::fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ValidationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pass" => Ok(ValidationStatus::Pass),
            "warn" | "passwithwarnings" => Ok(ValidationStatus::Warn),
            "fail" => Ok(ValidationStatus::Fail),
            _ => Err(anyhow::anyhow!(
                "unknown validation status '{s}' (expected Pass, Warn, Fail)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkOrder {
    pub work_order_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub equipment: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub status: WorkOrderStatus,
    #[serde(default)]
    pub assigned_to: String,
    #[serde(default)]
    pub crew: Vec<String>,
    #[serde(default)]
    pub environment_type: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hazard {
    pub name: String,
    #[serde(default, deserialize_with = "lenient::number")]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default)]
    pub suggested_controls: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permit {
    pub permit_id: String,
    #[serde(rename = "type")]
    pub permit_type: String,
    #[serde(default, deserialize_with = "lenient::permit_status")]
    pub status: PermitStatus,
    #[serde(default)]
    pub controls: Vec<String>,
    #[serde(default, alias = "PPE")]
    pub ppe: Vec<String>,
    #[serde(default)]
    pub sign_off_roles: Vec<String>,
    #[serde(default, deserialize_with = "lenient::hours")]
    pub validity_hours: u32,
    #[serde(default)]
    pub attachments_required: Vec<String>,
    #[serde(default)]
    pub hazards_linked: Vec<String>,
    #[serde(default)]
    pub work_order_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub check: String,
    pub result: ValidationStatus,
    #[serde(default)]
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    pub permit_id: String,
    pub validation_status: ValidationStatus,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub checks: Vec<ValidationCheck>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMeta {
    pub policy_version: String,
    pub rag_snapshot: String,
}

impl RunMeta {
    /// Stand-in used when the agent does not report its own run metadata.
    pub fn fallback(policy_version: &str) -> Self {
        Self {
            policy_version: policy_version.to_string(),
            rag_snapshot: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// The hazards/permits/validations payload extracted from an agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_order_id: Option<String>,
    pub hazards: Vec<Hazard>,
    pub permits: Vec<Permit>,
    pub validations: Vec<Validation>,
    pub pdf_links: Vec<String>,
    pub run_meta: RunMeta,
}

/// Cooperative cancellation flag shared between a caller and a running stream.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub catalog: CatalogConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".permitflow/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn legacy_toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let legacy = Self::legacy_toml_path(workspace);
        if legacy.exists() {
            let raw = fs::read_to_string(legacy)?;
            let legacy_cfg: AppConfig = toml::from_str(&raw)?;
            merge_json_value(&mut merged, &serde_json::to_value(legacy_cfg)?);
        }

        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub endpoint: String,
    /// Environment variable that overrides `endpoint` when set and non-empty.
    pub endpoint_env: String,
    pub app_name: String,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
    pub read_chunk_bytes: usize,
    pub fallback_policy_version: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            endpoint_env: "PERMITFLOW_API_BASE_URL".to_string(),
            app_name: DEFAULT_APP_NAME.to_string(),
            timeout_seconds: 600,
            max_retries: 2,
            retry_base_ms: 400,
            read_chunk_bytes: 8192,
            fallback_policy_version: DEFAULT_POLICY_VERSION.to_string(),
        }
    }
}

impl AgentConfig {
    pub fn resolve_endpoint(&self) -> String {
        std::env::var(&self.endpoint_env)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.endpoint.clone())
            .trim_end_matches('/')
            .to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Work-order JSON file, relative to the workspace unless absolute.
    pub path: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: "workOrders.json".to_string(),
        }
    }
}

impl CatalogConfig {
    pub fn resolve(&self, workspace: &Path) -> PathBuf {
        let path = Path::new(&self.path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            workspace.join(path)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
}
