//! Command dispatch.

pub mod config_cmd;
pub mod health;
pub mod run;

use kasa_config::Settings;

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;

pub async fn dispatch(cmd: Command, settings: Settings, global: &GlobalOpts) -> Result<(), CliError> {
    match cmd {
        Command::Run(args) => run::handle(args, settings).await,
        Command::Health => health::handle(&settings),
        Command::Config => config_cmd::handle(&settings, global),
    }
}
