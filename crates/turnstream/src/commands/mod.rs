//! CLI command implementations.

use std::str::FromStr;

use anyhow::{Error, bail};

pub mod check_config;
pub mod replay;

/// Output format shared by commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => bail!("unknown output format '{other}' (expected text or json)"),
        }
    }
}
