//! `kasa-collector health`: container health probe.
//!
//! With the file mirror enabled, the collector is healthy when the emeter
//! output file exists, is non-empty and was written recently. Without it
//! only the process-level check runs.

use std::path::Path;
use std::time::{Duration, SystemTime};

use kasa_config::Settings;

use crate::error::CliError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: &'static str,
    pub healthy: bool,
    pub message: String,
}

pub fn handle(settings: &Settings) -> Result<(), CliError> {
    let checks = evaluate(settings, SystemTime::now());
    let healthy = checks.iter().all(|c| c.healthy);

    println!(
        "Health check: {}",
        if healthy { "HEALTHY" } else { "UNHEALTHY" }
    );
    for check in &checks {
        let mark = if check.healthy { "ok" } else { "FAIL" };
        println!("  [{mark}] {}: {}", check.name, check.message);
    }
    println!("  version: {}", env!("CARGO_PKG_VERSION"));

    if healthy {
        return Ok(());
    }
    let reason = checks
        .iter()
        .filter(|c| !c.healthy)
        .map(|c| c.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    Err(CliError::Unhealthy { reason })
}

pub fn evaluate(settings: &Settings, now: SystemTime) -> Vec<Check> {
    let mut checks = vec![Check {
        name: "process",
        healthy: true,
        message: "running".into(),
    }];
    if settings.write_to_file {
        checks.push(check_data_file(
            &settings.emeter_output_path(),
            settings.health_check_max_age,
            now,
        ));
    }
    checks
}

fn check_data_file(path: &Path, max_age: Duration, now: SystemTime) -> Check {
    let failed = |message: String| Check {
        name: "data",
        healthy: false,
        message,
    };

    let Ok(meta) = std::fs::metadata(path) else {
        return failed(format!("{} does not exist", path.display()));
    };
    if meta.len() == 0 {
        return failed(format!("{} is empty", path.display()));
    }
    let age = meta
        .modified()
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .unwrap_or_default();
    let age_text = humantime::format_duration(Duration::from_secs(age.as_secs()));
    if age > max_age {
        return failed(format!(
            "last data update {age_text} ago (max allowed: {})",
            humantime::format_duration(max_age)
        ));
    }
    Check {
        name: "data",
        healthy: true,
        message: format!("last data update {age_text} ago"),
    }
}
