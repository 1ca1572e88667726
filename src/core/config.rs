//! Flow configuration from YAML

use crate::core::Step;
use crate::execution::{ConcurrencyMechanism, ConcurrentExecution, ProcessCommand, SourceOptions};
use crate::processors::ProcessorSpec;
use crate::steps::{Filter, Map, RoutingSelector, Sink, SinkWriter};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Top-level flow configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Flow name
    pub name: String,

    /// Source buffering and keying
    #[serde(default)]
    pub source: SourceOptions,

    /// Steps between the source and the sink, in order
    #[serde(default)]
    pub steps: Vec<StepConfig>,

    /// Terminal sink
    #[serde(default)]
    pub sink: SinkConfig,
}

/// One step of the flow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepConfig {
    /// Apply a processor inline
    Map {
        #[serde(default)]
        name: Option<String>,
        processor: ProcessorSpec,
    },

    /// Keep events whose body field matches a regex
    Filter {
        #[serde(default)]
        name: Option<String>,
        field: String,
        pattern: String,
    },

    /// Run a processor concurrently, preserving order
    Concurrent {
        #[serde(default)]
        name: Option<String>,
        mechanism: ConcurrencyMechanism,
        max_in_flight: usize,
        processor: ProcessorSpec,
        #[serde(default)]
        pass_context: bool,
        #[serde(default)]
        context: Option<Value>,
    },
}

/// Where the sink sends each record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteConfig {
    Partition(i32),
    Table(String),
    TableColumn(String),
}

/// Terminal sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Records per write
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// Write id, key and time along with the body
    #[serde(default)]
    pub full_event: bool,

    /// Routing of records; unrouted when absent
    #[serde(default)]
    pub route: Option<RouteConfig>,
}

fn default_max_events() -> usize {
    64
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            full_event: false,
            route: None,
        }
    }
}

impl StepConfig {
    pub fn name(&self) -> Option<&str> {
        match self {
            StepConfig::Map { name, .. } | StepConfig::Filter { name, .. } | StepConfig::Concurrent { name, .. } => {
                name.as_deref()
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StepConfig::Map { .. } => "map",
            StepConfig::Filter { .. } => "filter",
            StepConfig::Concurrent { .. } => "concurrent",
        }
    }
}

impl RouteConfig {
    pub fn to_selector(&self) -> RoutingSelector {
        match self {
            RouteConfig::Partition(partition) => RoutingSelector::Partition(*partition),
            RouteConfig::Table(table) => RoutingSelector::Table(table.clone()),
            RouteConfig::TableColumn(column) => RoutingSelector::TableColumn(column.clone()),
        }
    }
}

impl FlowConfig {
    /// Load flow configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse flow configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FlowConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the flow configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Flow name must not be empty");
        }
        self.source.validate()?;

        for (index, step) in self.steps.iter().enumerate() {
            let label = step.name().unwrap_or(step.kind());
            match step {
                StepConfig::Filter { pattern, .. } => {
                    regex::Regex::new(pattern)
                        .with_context(|| format!("Step {} ('{}') has an invalid pattern", index, label))?;
                }
                StepConfig::Concurrent {
                    max_in_flight,
                    pass_context,
                    context,
                    ..
                } => {
                    if *max_in_flight == 0 {
                        anyhow::bail!("Step {} ('{}') needs max_in_flight greater than zero", index, label);
                    }
                    if *pass_context && context.is_none() {
                        anyhow::bail!("Step {} ('{}') sets pass_context but has no context", index, label);
                    }
                }
                StepConfig::Map { .. } => {}
            }
        }

        if self.sink.max_events == 0 {
            anyhow::bail!("Sink max_events must be greater than zero");
        }
        Ok(())
    }

    /// Mechanisms of the concurrent steps, in flow order
    pub fn mechanisms(&self) -> Vec<ConcurrencyMechanism> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                StepConfig::Concurrent { mechanism, .. } => Some(*mechanism),
                _ => None,
            })
            .collect()
    }

    /// Build the step list, ending in a sink writing through `writer`
    ///
    /// Process stages start `worker` with `worker --spec <json>` appended.
    pub fn to_steps<W: SinkWriter + 'static>(&self, writer: W, worker: &ProcessCommand) -> Result<Vec<Box<dyn Step>>> {
        let mut steps: Vec<Box<dyn Step>> = Vec::with_capacity(self.steps.len() + 1);

        for step in &self.steps {
            let name = step.name().unwrap_or(step.kind()).to_string();
            let built: Box<dyn Step> = match step {
                StepConfig::Map { processor, .. } => {
                    let processor = processor.clone();
                    Box::new(Map::new(move |body| processor.apply(body, None)).named(name))
                }
                StepConfig::Filter { field, pattern, .. } => {
                    let pattern = regex::Regex::new(pattern)?;
                    Box::new(Filter::field_matches(field.clone(), pattern).named(name))
                }
                StepConfig::Concurrent {
                    mechanism,
                    max_in_flight,
                    processor,
                    pass_context,
                    context,
                    ..
                } => {
                    let processor = processor.to_processor(*mechanism, worker)?;
                    let mut stage = ConcurrentExecution::new(processor, *max_in_flight)?.named(name);
                    if let Some(context) = context {
                        stage = stage.with_context(context.clone());
                    }
                    Box::new(stage.pass_context(*pass_context))
                }
            };
            steps.push(built);
        }

        let mut sink = Sink::new(writer)
            .with_max_events(self.sink.max_events)?
            .with_full_event(self.sink.full_event)
            .named(format!("{}_sink", self.name));
        if let Some(route) = &self.sink.route {
            sink = sink.with_routing(route.to_selector());
        }
        steps.push(Box::new(sink));
        Ok(steps)
    }
}
