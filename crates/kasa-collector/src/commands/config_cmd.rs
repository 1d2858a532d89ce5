//! `kasa-collector config`: print the effective settings.

use kasa_config::Settings;

use crate::cli::GlobalOpts;
use crate::error::CliError;

pub fn handle(settings: &Settings, global: &GlobalOpts) -> Result<(), CliError> {
    settings.validate()?;

    let source = global
        .config
        .clone()
        .unwrap_or_else(kasa_config::config_path);
    println!("# settings file: {}", source.display());

    let rows = settings.describe();
    let width = rows.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
    for (name, value) in rows {
        println!("{name:<width$} = {value}");
    }
    Ok(())
}
