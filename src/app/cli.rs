use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Run,
    Validate,
    Capabilities,
    Help,
    Unknown,
}

pub fn parse_cli_verb(input: &str) -> CliVerb {
    match input {
        "run" => CliVerb::Run,
        "validate" => CliVerb::Validate,
        "capabilities" => CliVerb::Capabilities,
        "help" | "--help" | "-h" => CliVerb::Help,
        _ => CliVerb::Unknown,
    }
}

pub fn cli_help_lines() -> Vec<String> {
    vec![
        "Usage: opsflow <command> [--config <settings.yaml>]".to_string(),
        String::new(),
        "Commands:".to_string(),
        "  run <plan.json|plan.yaml>            Execute a plan and print the final output"
            .to_string(),
        "  validate <plan.json|plan.yaml>       Validate a plan and print its execution order"
            .to_string(),
        "  capabilities                         Print the capability catalog".to_string(),
        "  help                                 Show this help".to_string(),
        String::new(),
        "Settings default to $OPSFLOW_CONFIG when --config is not given.".to_string(),
    ]
}

pub fn help_text() -> String {
    cli_help_lines().join("\n")
}

/// Arguments after the verb: positional values plus `--config`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandArgs {
    pub positional: Vec<String>,
    pub config: Option<PathBuf>,
}

pub fn parse_command_args(args: &[String]) -> Result<CommandArgs, String> {
    let mut parsed = CommandArgs::default();
    let mut index = 0;
    while index < args.len() {
        let arg = &args[index];
        if let Some(value) = arg.strip_prefix("--config=") {
            parsed.config = Some(PathBuf::from(value));
        } else if arg == "--config" {
            let value = args
                .get(index + 1)
                .ok_or_else(|| "`--config` requires a path".to_string())?;
            parsed.config = Some(PathBuf::from(value));
            index += 1;
        } else if arg.starts_with("--") {
            return Err(format!("unknown option `{arg}`"));
        } else {
            parsed.positional.push(arg.clone());
        }
        index += 1;
    }
    Ok(parsed)
}
