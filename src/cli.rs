use std::{env, path::PathBuf};

use anyhow::{Result, anyhow};

use crate::config::default_config_path;

pub fn config_path_from_args() -> Result<PathBuf> {
    let mut args = env::args().skip(1);
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("missing value for --config"))?;
                config_path = Some(PathBuf::from(value));
            }
            other => {
                return Err(anyhow!(
                    "unknown argument: {other}. usage: narval [--config <path>]"
                ));
            }
        }
    }

    Ok(config_path.unwrap_or_else(default_config_path))
}
