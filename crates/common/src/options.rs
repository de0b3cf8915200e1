use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// How a query reacts when a worker it uses leaves the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FtMode {
    /// No special handling; the query fails when it next touches the dead channel.
    #[default]
    None,
    /// Drop the missing worker and finish with the survivors.
    Abandon,
    /// Stall on the missing worker until it, or a replacement, rejoins.
    Rejoin,
}

impl fmt::Display for FtMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FtMode::None => "none",
            FtMode::Abandon => "abandon",
            FtMode::Rejoin => "rejoin",
        };
        f.write_str(s)
    }
}

impl FromStr for FtMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(FtMode::None),
            "abandon" => Ok(FtMode::Abandon),
            "rejoin" => Ok(FtMode::Rejoin),
            other => Err(Error::plan(format!("unknown fault-tolerance mode '{other}'"))),
        }
    }
}

/// Options attached uniformly to every sub-plan of one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionOptions {
    pub ft_mode: FtMode,
    pub profiling: bool,
}
