use anyhow::Result;
use permitflow_core::AppConfig;
use serde::Serialize;
use serde_json::json;
use std::path::Path;

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Merged settings plus the values actually in effect after env overrides.
pub(crate) fn config_for_display(cfg: &AppConfig, workspace: &Path) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(cfg)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "effective".to_string(),
            json!({
                "endpoint": cfg.agent.resolve_endpoint(),
                "catalog_path": cfg.catalog.resolve(workspace).display().to_string(),
                "settings": [
                    AppConfig::project_settings_path(workspace).display().to_string(),
                    AppConfig::project_local_settings_path(workspace).display().to_string(),
                ],
            }),
        );
    }
    Ok(value)
}

/// Single-line preview capped at `max` characters.
pub(crate) fn preview(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = flat.chars();
    let head: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

pub(crate) fn join_or_dash(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}
