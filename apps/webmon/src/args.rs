use std::fs;
use std::path::Path;

use clap::Parser;
use serde_json::Value;
use thiserror::Error;

use crate::stages::ConnectionDetails;

/// Poll HTTP targets on independent schedules and record measurements.
#[derive(Debug, Parser)]
#[command(name = "webmon", version)]
pub struct Args {
    /// Run against a fixed local test configuration
    #[arg(long)]
    pub test: bool,

    /// Target list: path to a JSON file, or inline JSON
    #[arg(long)]
    pub config: Option<String>,

    /// Database user
    #[arg(long)]
    pub user: Option<String>,

    /// Database password
    #[arg(long)]
    pub password: Option<String>,

    /// Database host
    #[arg(long)]
    pub host: Option<String>,

    /// Database port
    #[arg(long)]
    pub port: Option<u16>,

    /// Database name
    #[arg(long)]
    pub database: Option<String>,

    /// Database SSL mode: disable, prefer or require
    #[arg(long)]
    pub sslmode: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no target configuration provided, pass --config or --test")]
    MissingTargets,
    #[error("config is not a readable file nor valid inline JSON: {0}")]
    Unparsable(serde_json::Error),
    #[error("config must be a JSON array of target objects")]
    NotAList,
    #[error("database configuration needs user, password, host and database together")]
    PartialDatabase,
}

/// Resolve the process configuration: the raw target list plus optional
/// database connection details.
///
/// Target entries stay raw JSON here; per-entry validation happens at the
/// scheduler's admission boundary so one bad entry cannot take the process
/// down.
pub fn configuration(args: &Args) -> Result<(Vec<Value>, Option<ConnectionDetails>), ConfigError> {
    if args.test {
        return Ok((test_targets(), Some(test_database())));
    }

    let database = database_details(args)?;
    let targets = match &args.config {
        Some(config) => load_targets(config)?,
        None => return Err(ConfigError::MissingTargets),
    };

    Ok((targets, database))
}

/// The fixed configuration behind --test: two local endpoints and a local
/// database.
fn test_targets() -> Vec<Value> {
    vec![
        serde_json::json!({"url": "http://localhost:3000/test/test200", "schedule": 1}),
        serde_json::json!({"url": "http://localhost:3000/test/test404", "schedule": 5}),
    ]
}

fn test_database() -> ConnectionDetails {
    let mut details = ConnectionDetails::new("webmon", "webmon", "webmon", "localhost");
    details.sslmode = "prefer".to_string();
    details
}

/// Read the target list from a file path, or treat the argument as inline
/// JSON when it is not a readable file.
fn load_targets(config: &str) -> Result<Vec<Value>, ConfigError> {
    let raw = if Path::new(config).is_file() {
        fs::read_to_string(config).unwrap_or_else(|_| config.to_string())
    } else {
        config.to_string()
    };

    let parsed: Value = serde_json::from_str(&raw).map_err(ConfigError::Unparsable)?;
    match parsed {
        Value::Array(entries) => Ok(entries),
        _ => Err(ConfigError::NotAList),
    }
}

/// All-or-nothing database flags: none disables persistence, a partial set
/// is a hard configuration error.
fn database_details(args: &Args) -> Result<Option<ConnectionDetails>, ConfigError> {
    let core = [&args.user, &args.password, &args.host, &args.database];
    let given = core.iter().filter(|value| value.is_some()).count();

    if given == 0 {
        if args.port.is_some() || args.sslmode.is_some() {
            return Err(ConfigError::PartialDatabase);
        }
        return Ok(None);
    }
    if given < core.len() {
        return Err(ConfigError::PartialDatabase);
    }

    let mut details = ConnectionDetails::new(
        args.user.as_deref().unwrap_or_default(),
        args.password.as_deref().unwrap_or_default(),
        args.database.as_deref().unwrap_or_default(),
        args.host.as_deref().unwrap_or_default(),
    );
    if let Some(port) = args.port {
        details.port = port;
    }
    if let Some(sslmode) = &args.sslmode {
        details.sslmode = sslmode.clone();
    }

    Ok(Some(details))
}
