use anyhow::Result;
use permitflow_core::AppConfig;
use std::path::Path;

use crate::ConfigCmd;
use crate::output::*;

pub(crate) fn run_config(cwd: &Path, cmd: ConfigCmd, json_mode: bool) -> Result<()> {
    let cfg = AppConfig::load(cwd)?;
    match cmd {
        ConfigCmd::Show => {
            let display_cfg = config_for_display(&cfg, cwd)?;
            if json_mode {
                print_json(&display_cfg)?;
            } else {
                println!("{}", serde_json::to_string_pretty(&display_cfg)?);
            }
        }
    }
    Ok(())
}
