use std::path::Path;

use anyhow::Result;
use turnwire_core::AppConfig;

pub fn run_config_show(workspace: &Path, json_out: bool) -> Result<u8> {
    let cfg = AppConfig::load(workspace)?;
    if json_out {
        println!("{}", serde_json::to_string_pretty(&cfg)?);
    } else {
        print!("{}", toml::to_string_pretty(&cfg)?);
    }
    Ok(0)
}
