//! `mlsmig check-config`: validate and print the effective configuration.

use anyhow::{Context, Result};
use mlsmig_core::MigrationConfig;

/// Prints `config` as TOML, defaults filled in.
pub fn check(config: &MigrationConfig) -> Result<()> {
    config.validate().context("invalid configuration")?;
    let rendered = config
        .to_toml()
        .context("failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn rejects_zero_interval() {
        let config = MigrationConfig {
            check_interval: Duration::ZERO,
            ..MigrationConfig::default()
        };
        assert!(check(&config).is_err());
    }

    #[test]
    fn accepts_defaults() {
        check(&MigrationConfig::default()).unwrap();
    }
}
