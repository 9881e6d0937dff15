//! cutover.toml configuration parser.
//!
//! The file declares one pipeline (source, ordered stages, actions) and
//! the deployment environments its deploy actions target. Values here are
//! the raw, file-facing shapes; crates that execute them convert into
//! their own validated types.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ActionKind;

/// Errors found while parsing or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("pipeline has no stages")]
    EmptyPipeline,

    #[error("stage {0:?} has no actions")]
    EmptyStage(String),

    #[error("duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("duplicate action {action:?} in stage {stage:?}")]
    DuplicateAction { stage: String, action: String },

    #[error("action {stage}/{action} reads artifact {artifact:?} that no earlier stage produces")]
    UnresolvedInput {
        stage: String,
        action: String,
        artifact: String,
    },

    #[error("action {stage}/{action} is missing required field `{field}`")]
    MissingField {
        stage: String,
        action: String,
        field: &'static str,
    },

    #[error("action {stage}/{action} targets unknown environment {environment:?}")]
    UnknownEnvironment {
        stage: String,
        action: String,
        environment: String,
    },

    #[error("stage {0:?} has more than one approval action")]
    MultipleApprovals(String),

    #[error("environment {environment:?} has no {field}")]
    NoTargets {
        environment: String,
        field: &'static str,
    },

    #[error("duplicate environment: {0}")]
    DuplicateEnvironment(String),

    #[error("invalid target address {0:?} (expected host:port)")]
    InvalidTarget(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CutoverConfig {
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub source: SourceConfig,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// Source repository that triggers runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub repository: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    pub name: String,
    pub kind: ActionKind,
    #[serde(default = "default_run_order")]
    pub run_order: u32,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Shell commands for `build` actions.
    pub commands: Option<Vec<String>>,
    pub working_dir: Option<String>,
    /// Environment name for deploy actions.
    pub environment: Option<String>,
    /// Who to notify for `approval` actions.
    pub notify: Option<String>,
    /// Optional time limit for `approval` and `build` actions. Absent means no limit.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    pub service: String,
    /// Production listener carrying live traffic.
    pub listener: String,
    /// Listener used to exercise green before cutover.
    pub test_listener: Option<String>,
    pub blue: TargetGroupConfig,
    pub green: TargetGroupConfig,
    /// Targets serving the current revision at startup.
    #[serde(default)]
    pub live_targets: Vec<String>,
    /// Targets the container service brings up for a new revision.
    #[serde(default)]
    pub revision_targets: Vec<String>,
    pub health: Option<HealthCheckConfig>,
    pub strategy: StrategyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetGroupConfig {
    pub id: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub path: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Deployment strategy as written in the file.
///
/// Numeric fields are signed so that negative values reach validation
/// instead of failing as a parse error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    Simple,
    BlueGreen {
        increment_percent: Option<i64>,
        interval_secs: Option<i64>,
        validation_timeout_secs: Option<i64>,
        health_check_interval_secs: Option<i64>,
        healthy_threshold: Option<i64>,
        unhealthy_threshold: Option<i64>,
        max_stalled_ticks: Option<i64>,
    },
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_run_order() -> u32 {
    1
}

fn default_protocol() -> String {
    "http".to_string()
}

impl CutoverConfig {
    /// Read, parse, and validate a configuration file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        Ok(config)
    }

    /// Parse and validate a configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: CutoverConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn environment(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.iter().find(|e| e.name == name)
    }

    /// Structural checks: naming, artifact wiring, approvals, and the
    /// environments deploy actions target.
    ///
    /// Strategy ranges are checked when strategies are built for execution.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut env_names = HashSet::new();
        for env in &self.environments {
            if !env_names.insert(env.name.as_str()) {
                return Err(ConfigError::DuplicateEnvironment(env.name.clone()));
            }
            for addr in env.live_targets.iter().chain(&env.revision_targets) {
                parse_target(addr)?;
            }
            if env.blue.id == env.green.id {
                return Err(ConfigError::Invalid(format!(
                    "environment {:?} uses the same target group for blue and green",
                    env.name
                )));
            }
        }

        let stages = &self.pipeline.stages;
        if stages.is_empty() {
            return Err(ConfigError::EmptyPipeline);
        }

        // Artifacts produced by stages strictly before the current one.
        let mut produced: HashSet<&str> = HashSet::new();
        let mut stage_names = HashSet::new();

        for stage in stages {
            if !stage_names.insert(stage.name.as_str()) {
                return Err(ConfigError::DuplicateStage(stage.name.clone()));
            }
            if stage.actions.is_empty() {
                return Err(ConfigError::EmptyStage(stage.name.clone()));
            }

            // Pending approvals are keyed by run and stage.
            if stage
                .actions
                .iter()
                .filter(|a| a.kind == ActionKind::Approval)
                .count()
                > 1
            {
                return Err(ConfigError::MultipleApprovals(stage.name.clone()));
            }

            let mut action_names = HashSet::new();
            for action in &stage.actions {
                if !action_names.insert(action.name.as_str()) {
                    return Err(ConfigError::DuplicateAction {
                        stage: stage.name.clone(),
                        action: action.name.clone(),
                    });
                }
                for input in &action.inputs {
                    if !produced.contains(input.as_str()) {
                        return Err(ConfigError::UnresolvedInput {
                            stage: stage.name.clone(),
                            action: action.name.clone(),
                            artifact: input.clone(),
                        });
                    }
                }
                self.validate_action(&stage.name, action)?;
            }

            for action in &stage.actions {
                produced.extend(action.outputs.iter().map(String::as_str));
            }
        }

        Ok(())
    }

    fn validate_action(&self, stage: &str, action: &ActionConfig) -> Result<(), ConfigError> {
        let missing = |field| ConfigError::MissingField {
            stage: stage.to_string(),
            action: action.name.clone(),
            field,
        };

        match action.kind {
            ActionKind::Build => {
                if action.commands.as_ref().is_none_or(|c| c.is_empty()) {
                    return Err(missing("commands"));
                }
            }
            ActionKind::EcsDeploy | ActionKind::BlueGreenDeploy => {
                let name = action.environment.as_deref().ok_or_else(|| missing("environment"))?;
                let env = self.environment(name).ok_or_else(|| ConfigError::UnknownEnvironment {
                    stage: stage.to_string(),
                    action: action.name.clone(),
                    environment: name.to_string(),
                })?;
                env.validate_deployable()?;
            }
            ActionKind::Approval => {
                if action.timeout_secs == Some(0) {
                    return Err(ConfigError::Invalid(format!(
                        "approval {stage}/{} has a zero timeout",
                        action.name
                    )));
                }
            }
            ActionKind::SourceCheckout => {}
        }
        Ok(())
    }

    /// Scaffold a minimal cutover.toml: source, build, image, test deploy,
    /// approval, and a blue/green production deploy.
    pub fn scaffold(name: &str, repository: &str) -> Self {
        let action = |name: &str, kind: ActionKind| ActionConfig {
            name: name.to_string(),
            kind,
            run_order: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
            commands: None,
            working_dir: None,
            environment: None,
            notify: None,
            timeout_secs: None,
        };

        let stage = |name: &str, actions: Vec<ActionConfig>| StageConfig {
            name: name.to_string(),
            actions,
        };

        let environment = |env: &str, base: u16, strategy: StrategyConfig| EnvironmentConfig {
            name: env.to_string(),
            service: format!("{name}-{env}"),
            listener: format!("{env}-alb:80"),
            test_listener: Some(format!("{env}-alb:8080")),
            blue: TargetGroupConfig {
                id: format!("{env}-blue"),
                protocol: default_protocol(),
                port: 8080,
            },
            green: TargetGroupConfig {
                id: format!("{env}-green"),
                protocol: default_protocol(),
                port: 8080,
            },
            live_targets: vec![format!("127.0.0.1:{base}")],
            revision_targets: vec![format!("127.0.0.1:{}", base + 1)],
            health: Some(HealthCheckConfig {
                path: Some("/healthz".to_string()),
                timeout_ms: Some(2000),
            }),
            strategy,
        };

        CutoverConfig {
            pipeline: PipelineConfig {
                name: name.to_string(),
                source: SourceConfig {
                    repository: repository.to_string(),
                    branch: default_branch(),
                },
                stages: vec![
                    stage(
                        "Source",
                        vec![ActionConfig {
                            outputs: vec!["source".to_string()],
                            ..action("Checkout", ActionKind::SourceCheckout)
                        }],
                    ),
                    stage(
                        "Build",
                        vec![ActionConfig {
                            inputs: vec!["source".to_string()],
                            outputs: vec!["test-report".to_string()],
                            commands: Some(vec!["cargo test".to_string()]),
                            ..action("UnitTest", ActionKind::Build)
                        }],
                    ),
                    stage(
                        "Image",
                        vec![ActionConfig {
                            inputs: vec!["source".to_string()],
                            outputs: vec!["image".to_string()],
                            commands: Some(vec!["docker build -t app .".to_string()]),
                            ..action("DockerBuild", ActionKind::Build)
                        }],
                    ),
                    stage(
                        "DeployTest",
                        vec![ActionConfig {
                            inputs: vec!["image".to_string()],
                            environment: Some("test".to_string()),
                            ..action("Deploy", ActionKind::EcsDeploy)
                        }],
                    ),
                    stage(
                        "DeployProd",
                        vec![
                            ActionConfig {
                                notify: Some("release-managers".to_string()),
                                ..action("ManualApproval", ActionKind::Approval)
                            },
                            ActionConfig {
                                run_order: 2,
                                inputs: vec!["image".to_string()],
                                environment: Some("prod".to_string()),
                                ..action("BlueGreen", ActionKind::BlueGreenDeploy)
                            },
                        ],
                    ),
                ],
            },
            environments: vec![
                environment("test", 18080, StrategyConfig::Simple),
                environment(
                    "prod",
                    19080,
                    StrategyConfig::BlueGreen {
                        increment_percent: Some(10),
                        interval_secs: Some(60),
                        validation_timeout_secs: Some(300),
                        health_check_interval_secs: Some(10),
                        healthy_threshold: Some(2),
                        unhealthy_threshold: Some(2),
                        max_stalled_ticks: Some(5),
                    },
                ),
            ],
        }
    }
}

impl EnvironmentConfig {
    /// A deploy needs targets to roll out, and a blue/green rollback needs
    /// live targets to return traffic to.
    fn validate_deployable(&self) -> Result<(), ConfigError> {
        let no_targets = |field| ConfigError::NoTargets {
            environment: self.name.clone(),
            field,
        };
        if self.revision_targets.is_empty() {
            return Err(no_targets("revision_targets"));
        }
        if matches!(self.strategy, StrategyConfig::BlueGreen { .. }) && self.live_targets.is_empty() {
            return Err(no_targets("live_targets"));
        }
        Ok(())
    }
}

/// Split a `host:port` target address.
pub fn parse_target(addr: &str) -> Result<(String, u16), ConfigError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidTarget(addr.to_string()))?;
    if host.is_empty() {
        return Err(ConfigError::InvalidTarget(addr.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidTarget(addr.to_string()))?;
    Ok((host.to_string(), port))
}
