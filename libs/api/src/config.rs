//! Container configuration as submitted with PUT /containers/{id}.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Declarative description of a container. Immutable once submitted; any
/// change to a job's configuration produces a new set of container IDs
/// rather than mutating existing containers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub job_name: String,
    pub task_name: String,
    pub artifact_url: String,

    /// Port name to host port. Port 0 requests allocation by the agent;
    /// the allocated port is materialised into the environment as
    /// `PORT_<NAME>`.
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    pub command: Command,
    pub resources: ResourceLimits,

    #[serde(default)]
    pub storage: Storage,

    pub grace: Grace,
}

impl ContainerConfig {
    /// Structural validation, so invalid configs are rejected at the API
    /// boundary rather than partway through a scheduling maneuver. Collects
    /// every violation into a single error.
    pub fn valid(&self) -> Result<(), Error> {
        let mut errs = Vec::new();
        if self.job_name.is_empty() {
            errs.push("job name empty".to_string());
        }
        if self.task_name.is_empty() {
            errs.push("task name empty".to_string());
        }
        if self.artifact_url.is_empty() {
            errs.push("artifact URL empty".to_string());
        } else if !self.artifact_url.contains("://") {
            errs.push(format!("artifact URL {:?} invalid", self.artifact_url));
        }
        if let Err(e) = self.command.valid() {
            errs.push(format!("command invalid: {e}"));
        }
        if let Err(e) = self.resources.valid() {
            errs.push(format!("resources invalid: {e}"));
        }
        if let Err(e) = self.grace.valid() {
            errs.push(format!("grace periods invalid: {e}"));
        }
        if errs.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidInput(errs.join("; ")))
        }
    }
}

/// How to start the user binary inside the container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub working_dir: String,
    pub exec: Vec<String>,
}

impl Command {
    pub fn valid(&self) -> Result<(), Error> {
        let mut errs = Vec::new();
        if self.exec.is_empty() {
            errs.push("exec (command to run, as array) not specified");
        }
        if self.working_dir.is_empty() {
            errs.push("working dir (string) not specified");
        }
        if errs.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidInput(errs.join("; ")))
        }
    }
}

/// Resource limits for one container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in megabytes.
    pub mem: u64,
    /// Fractional CPUs.
    pub cpus: f64,
}

impl ResourceLimits {
    pub fn valid(&self) -> Result<(), Error> {
        let mut errs = Vec::new();
        if self.mem == 0 {
            errs.push("mem (integer MB) not specified or zero");
        }
        if self.cpus <= 0.0 {
            errs.push("cpus (floating point fractional CPUs) not specified or zero");
        }
        if errs.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidInput(errs.join("; ")))
        }
    }
}

/// Storage requirements: scratch space and host volume mounts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Storage {
    /// Container path to max allocation in megabytes (-1 for unlimited).
    #[serde(default)]
    pub tmp: BTreeMap<String, i64>,

    /// Container path to host path.
    #[serde(default)]
    pub volumes: BTreeMap<String, String>,
}

/// How many seconds the scheduler waits for startup and shutdown before
/// declaring the maneuver failed. Containers that don't shut down within
/// the shutdown window are subject to a forceful kill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grace {
    pub startup: u64,
    pub shutdown: u64,
}

impl Grace {
    pub fn valid(&self) -> Result<(), Error> {
        let mut errs = Vec::new();
        if self.startup == 0 || self.startup > 30 {
            errs.push(format!("startup ({}) must be between 1 and 30", self.startup));
        }
        if self.shutdown == 0 || self.shutdown > 30 {
            errs.push(format!(
                "shutdown ({}) must be between 1 and 30",
                self.shutdown
            ));
        }
        if errs.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidInput(errs.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ContainerConfig {
        ContainerConfig {
            job_name: "site".to_string(),
            task_name: "web".to_string(),
            artifact_url: "http://artifacts.internal/site/web.tar.gz".to_string(),
            ports: BTreeMap::from([("http".to_string(), 0)]),
            env: BTreeMap::new(),
            command: Command {
                working_dir: "/srv".to_string(),
                exec: vec!["./web".to_string()],
            },
            resources: ResourceLimits { mem: 64, cpus: 0.5 },
            storage: Storage::default(),
            grace: Grace {
                startup: 3,
                shutdown: 3,
            },
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(config().valid().is_ok());
    }

    #[test]
    fn invalid_config_collects_all_violations() {
        let mut c = config();
        c.job_name.clear();
        c.resources.mem = 0;
        c.grace.startup = 31;

        let err = c.valid().unwrap_err().to_string();
        assert!(err.contains("job name empty"));
        assert!(err.contains("mem"));
        assert!(err.contains("startup"));
    }

    #[test]
    fn grace_bounds() {
        assert!(Grace { startup: 1, shutdown: 30 }.valid().is_ok());
        assert!(Grace { startup: 0, shutdown: 5 }.valid().is_err());
        assert!(Grace { startup: 5, shutdown: 31 }.valid().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let c = config();
        let json = serde_json::to_string(&c).unwrap();
        let back: ContainerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(c, back);
    }
}
