//! Sweep and scheduler configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::errors::{SweepResult, SweepError};

/// Metric the sweep optimizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricConfig {
    pub name: String,
    /// "maximize" or "minimize".
    #[serde(default)]
    pub goal: Option<String>,
}

/// One entry of the sweep's `parameters` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterConfig {
    #[serde(default)]
    pub values: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub min: Option<serde_json::Value>,
    #[serde(default)]
    pub max: Option<serde_json::Value>,
    #[serde(default)]
    pub distribution: Option<String>,
}

/// A named component (pruner or sampler) plus its constructor arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentArgs {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

impl ComponentArgs {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            args: serde_json::Map::new(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.args.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.args.get(key).and_then(|v| v.as_u64())
    }
}

/// The `optimizer` block (also accepted as `optuna`) of a sweep config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Artifact holding a custom optimizer configuration.
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(default)]
    pub pruner: Option<ComponentArgs>,
    #[serde(default)]
    pub sampler: Option<ComponentArgs>,
}

/// Sweep configuration as stored on the backend sweep record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterConfig>,
    #[serde(default)]
    pub metric: Option<MetricConfig>,
    /// Command template tokens. Kept as raw values since YAML may carry
    /// numbers in the list.
    #[serde(default)]
    pub command: Vec<serde_json::Value>,
    #[serde(default)]
    pub run_cap: Option<usize>,
    #[serde(default)]
    pub job: Option<String>,
    #[serde(default)]
    pub image_uri: Option<String>,
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default, alias = "optuna")]
    pub optimizer: Option<OptimizerConfig>,
}

impl SweepConfig {
    pub fn from_yaml(source: &str) -> SweepResult<Self> {
        if source.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(source)?)
    }

    /// Command template as strings.
    pub fn command_tokens(&self) -> Vec<String> {
        self.command
            .iter()
            .map(|token| match token {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect()
    }

    pub fn metric_name(&self) -> SweepResult<&str> {
        self.metric
            .as_ref()
            .map(|m| m.name.as_str())
            .ok_or_else(|| SweepError::Config("sweep config has no metric.name".into()))
    }
}

/// Configuration for one scheduler instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub sweep_id: String,
    pub entity: String,
    pub project: String,

    /// Project that owns the launch queue; defaults to `project`.
    pub project_queue: Option<String>,

    /// Launch queue name.
    pub queue: String,

    /// Number of worker slots.
    pub num_workers: usize,

    /// Job reference to launch; takes precedence over the sweep config.
    pub job: Option<String>,

    /// Container image to launch when no job is given.
    pub image_uri: Option<String>,

    /// Sleep between iterations while runs are in flight.
    pub polling_sleep: Duration,

    /// Sleep between iterations while nothing is in flight.
    pub queue_sleep: Duration,

    /// Whether this scheduler resumes an earlier one for the same sweep.
    pub resumed: bool,

    /// Overrides the sweep config's run cap.
    pub run_cap: Option<usize>,

    /// Strategy name; when unset the sweep's `method` decides.
    pub strategy: Option<String>,
}

impl SchedulerConfig {
    pub fn new(sweep_id: &str, entity: &str, project: &str) -> Self {
        Self {
            sweep_id: sweep_id.to_string(),
            entity: entity.to_string(),
            project: project.to_string(),
            project_queue: None,
            queue: "default".to_string(),
            num_workers: 8,
            job: None,
            image_uri: None,
            polling_sleep: Duration::from_secs(1),
            queue_sleep: Duration::from_secs(5),
            resumed: false,
            run_cap: None,
            strategy: None,
        }
    }

    pub fn with_queue(mut self, queue: &str) -> Self {
        self.queue = queue.to_string();
        self
    }

    pub fn with_project_queue(mut self, project_queue: &str) -> Self {
        self.project_queue = Some(project_queue.to_string());
        self
    }

    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn with_job(mut self, job: &str) -> Self {
        self.job = Some(job.to_string());
        self
    }

    pub fn with_image_uri(mut self, image_uri: &str) -> Self {
        self.image_uri = Some(image_uri.to_string());
        self
    }

    pub fn with_polling_sleep(mut self, sleep: Duration) -> Self {
        self.polling_sleep = sleep;
        self
    }

    pub fn with_queue_sleep(mut self, sleep: Duration) -> Self {
        self.queue_sleep = sleep;
        self
    }

    pub fn with_resumed(mut self, resumed: bool) -> Self {
        self.resumed = resumed;
        self
    }

    pub fn with_run_cap(mut self, run_cap: usize) -> Self {
        self.run_cap = Some(run_cap);
        self
    }

    pub fn with_strategy(mut self, strategy: &str) -> Self {
        self.strategy = Some(strategy.to_string());
        self
    }

    /// Project that owns the launch queue.
    pub fn queue_project(&self) -> &str {
        self.project_queue.as_deref().unwrap_or(&self.project)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new("", "", "")
    }
}
