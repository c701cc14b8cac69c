//! Job and task definitions submitted to the scheduler API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::ContainerConfig;
use crate::error::Error;

/// A named collection of tasks. One job fans out to N tasks, each task to
/// `scale` instances, and every instance gets its own container ID.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_name: String,
    /// Task name to task. BTreeMap keeps the canonical encoding (and
    /// therefore the derived container IDs) stable.
    pub tasks: BTreeMap<String, Task>,
}

impl Job {
    /// Validate the job and every task in it.
    pub fn valid(&self) -> Result<(), Error> {
        if self.job_name.is_empty() {
            return Err(Error::InvalidInput("job name empty".to_string()));
        }
        for (name, task) in &self.tasks {
            task.valid()
                .map_err(|e| Error::InvalidInput(format!("task {name:?}: {e}")))?;
        }
        Ok(())
    }

    /// The artifact URL shared by every task, or an error when tasks
    /// disagree. Migrations require a stable artifact across the job.
    pub fn artifact_url(&self) -> Result<String, Error> {
        let mut urls: Vec<&str> = self
            .tasks
            .values()
            .map(|t| t.container_config.artifact_url.as_str())
            .collect();
        urls.sort_unstable();
        urls.dedup();
        match urls.as_slice() {
            [one] => Ok(one.to_string()),
            _ => Err(Error::InvalidInput(format!(
                "job {}: {} unique artifact URLs detected",
                self.job_name,
                urls.len()
            ))),
        }
    }
}

/// One task: a container configuration plus how many instances to run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_name: String,
    pub scale: u32,
    pub container_config: ContainerConfig,
}

impl Task {
    pub fn valid(&self) -> Result<(), Error> {
        if self.task_name.is_empty() {
            return Err(Error::InvalidInput("task name empty".to_string()));
        }
        if self.scale == 0 {
            return Err(Error::InvalidInput(format!(
                "task {}: scale must be at least 1",
                self.task_name
            )));
        }
        self.container_config.valid()
    }
}
