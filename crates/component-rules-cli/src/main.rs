use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use component_rules_api::{
    load_json_file, CatalogDocument, CheckRulesRequest, ComponentRulesApi, FormulaEvalRequest,
    RuleSetDocument, ValidateRequest,
};
use component_rules_core::{CandidateSystem, EvaluationContext};
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "crules")]
#[command(about = "Component compatibility and quantity rule engine")]
struct Cli {
    /// Category table YAML; defaults to the table built into the engine.
    #[arg(long, global = true)]
    categories: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Validate(ValidateArgs),
    Rules {
        #[command(subcommand)]
        command: RulesCommand,
    },
    Formula {
        #[command(subcommand)]
        command: FormulaCommand,
    },
    Categories {
        #[command(subcommand)]
        command: CategoriesCommand,
    },
}

#[derive(Debug, Args)]
struct ValidateArgs {
    #[arg(long)]
    rules: PathBuf,
    #[arg(long)]
    catalog: PathBuf,
    #[arg(long)]
    design: PathBuf,
    #[arg(long)]
    context: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    no_derive_context: bool,
    #[arg(long)]
    as_of: Option<String>,
    /// Exit non-zero after printing the report when the design is invalid.
    #[arg(long, default_value_t = false)]
    fail_on_invalid: bool,
}

#[derive(Debug, Subcommand)]
enum RulesCommand {
    Check(RulesCheckArgs),
}

#[derive(Debug, Args)]
struct RulesCheckArgs {
    #[arg(long)]
    rules: PathBuf,
    #[arg(long)]
    catalog: PathBuf,
    /// Extra context variable the caller will supply (repeatable).
    #[arg(long = "variable")]
    variables: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum FormulaCommand {
    Eval(FormulaEvalArgs),
}

#[derive(Debug, Args)]
struct FormulaEvalArgs {
    #[arg(long)]
    formula: String,
    /// Context variable as `name=value` (repeatable).
    #[arg(long = "var", value_parser = parse_variable)]
    vars: Vec<(String, f64)>,
}

#[derive(Debug, Subcommand)]
enum CategoriesCommand {
    Show,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            if let Some(api_version) = object.remove("contract_version") {
                object.insert("api_contract_version".to_string(), api_version);
            }
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let api = match &cli.categories {
        Some(path) => ComponentRulesApi::from_categories_file(path)?,
        None => ComponentRulesApi::with_builtin_categories()?,
    };

    match cli.command {
        Command::Validate(args) => run_validate(&api, args),
        Command::Rules { command: RulesCommand::Check(args) } => run_rules_check(&api, args),
        Command::Formula { command: FormulaCommand::Eval(args) } => run_formula_eval(&api, args),
        Command::Categories { command: CategoriesCommand::Show } => emit_json(
            serde_json::to_value(api.categories_view())
                .context("failed to serialize category table")?,
        ),
    }
}

fn run_validate(api: &ComponentRulesApi, args: ValidateArgs) -> Result<()> {
    let rule_set: RuleSetDocument = load_json_file(&args.rules)?;
    let catalog: CatalogDocument = load_json_file(&args.catalog)?;
    let design: CandidateSystem = load_json_file(&args.design)?;
    let context: EvaluationContext = match args.context.as_deref() {
        Some(path) => load_json_file(path)?,
        None => EvaluationContext::new(),
    };
    let as_of = args.as_of.as_deref().map(parse_rfc3339).transpose()?;

    let run = api.validate(ValidateRequest {
        rule_set,
        catalog,
        design,
        context,
        derive_context: !args.no_derive_context,
        as_of,
    })?;
    let valid = run.valid;
    emit_json(serde_json::to_value(&run).context("failed to serialize validation run")?)?;

    if args.fail_on_invalid && !valid {
        return Err(anyhow!("design is invalid"));
    }
    Ok(())
}

fn run_rules_check(api: &ComponentRulesApi, args: RulesCheckArgs) -> Result<()> {
    let rule_set: RuleSetDocument = load_json_file(&args.rules)?;
    let catalog: CatalogDocument = load_json_file(&args.catalog)?;

    let result =
        api.check_rules(CheckRulesRequest { rule_set, catalog, extra_variables: args.variables })?;
    emit_json(serde_json::to_value(&result).context("failed to serialize rule check result")?)
}

fn run_formula_eval(api: &ComponentRulesApi, args: FormulaEvalArgs) -> Result<()> {
    let result = api.evaluate_formula(FormulaEvalRequest {
        formula: args.formula,
        context: args.vars.into_iter().collect(),
    });
    emit_json(serde_json::to_value(&result).context("failed to serialize formula result")?)
}

fn parse_variable(raw: &str) -> Result<(String, f64)> {
    let (name, value) =
        raw.split_once('=').ok_or_else(|| anyhow!("expected name=value (received: {raw})"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("variable name must be non-empty (received: {raw})"));
    }
    let value = value
        .trim()
        .parse::<f64>()
        .with_context(|| format!("variable `{name}` must be numeric (received: {value})"))?;
    if !value.is_finite() {
        return Err(anyhow!("variable `{name}` must be a finite number"));
    }
    Ok((name.to_string(), value))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}
