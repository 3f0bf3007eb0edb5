use crate::app::cli::{help_text, parse_cli_verb, parse_command_args, CliVerb, CommandArgs};
use crate::config::{load_settings, ConfigError, Settings};
use crate::orchestration::Engine;
use crate::plan::{PlanDocument, PlanDocumentError, PlanError};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Document(#[from] PlanDocumentError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
}

pub fn run_cli(args: Vec<String>) -> Result<String, CliError> {
    let Some(verb) = args.first() else {
        return Ok(help_text());
    };
    let verb = parse_cli_verb(verb);
    if verb == CliVerb::Help {
        return Ok(help_text());
    }
    if verb == CliVerb::Unknown {
        return Err(CliError::Usage(format!(
            "unknown command `{}`\n\n{}",
            args[0],
            help_text()
        )));
    }

    let command = parse_command_args(&args[1..]).map_err(CliError::Usage)?;
    let settings = load_settings(command.config.as_deref())?;
    crate::logging::init_logging(&settings.log_level);

    match verb {
        CliVerb::Run => cmd_run(&settings, &command),
        CliVerb::Validate => cmd_validate(&settings, &command),
        CliVerb::Capabilities => cmd_capabilities(&settings),
        CliVerb::Help | CliVerb::Unknown => Ok(help_text()),
    }
}

fn build_engine(settings: &Settings) -> Result<Engine, CliError> {
    let registry = settings.build_registry()?;
    let mut engine = Engine::new(Arc::new(registry), settings.policy());
    if let Some(cache) = settings.response_cache() {
        engine = engine.with_cache(Arc::new(cache));
    }
    Ok(engine)
}

fn plan_argument<'a>(command: &'a CommandArgs, verb: &str) -> Result<&'a Path, CliError> {
    match command.positional.as_slice() {
        [path] => Ok(Path::new(path)),
        _ => Err(CliError::Usage(format!(
            "usage: opsflow {verb} <plan.json|plan.yaml> [--config <settings.yaml>]"
        ))),
    }
}

fn cmd_run(settings: &Settings, command: &CommandArgs) -> Result<String, CliError> {
    let plan = PlanDocument::from_path(plan_argument(command, "run")?)?;
    let engine = build_engine(settings)?;
    let output = engine.run(&plan)?;
    Ok(serde_json::to_string_pretty(&output)?)
}

fn cmd_validate(settings: &Settings, command: &CommandArgs) -> Result<String, CliError> {
    let plan = PlanDocument::from_path(plan_argument(command, "validate")?)?;
    let engine = build_engine(settings)?;
    let (_, order) = engine.prepare(&plan)?;
    let report = json!({
        "valid": true,
        "executionOrder": order.step_ids().iter().map(|id| id.as_str()).collect::<Vec<_>>(),
    });
    Ok(serde_json::to_string_pretty(&report)?)
}

fn cmd_capabilities(settings: &Settings) -> Result<String, CliError> {
    let registry = settings.build_registry()?;
    Ok(serde_json::to_string_pretty(&registry.catalog())?)
}
