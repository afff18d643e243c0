use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonschema::JSONSchema;
use serde_json::Value;

const AS_OF: &str = "2026-10-01T12:00:00Z";

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_crules<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_crules"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute crules binary: {err}"))
}

fn parse_stdout(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_crules(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "crules command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }
    parse_stdout(&output)
}

fn fixture(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name);
    path.to_str()
        .unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
        .to_string()
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json_file(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read JSON file {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("invalid JSON file {}: {err}", path.display()))
}

fn validate_schema(schema_file: &str, instance: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_file);
    let schema_json = read_json_file(&schema_path);
    let compiled = JSONSchema::compile(&schema_json)
        .unwrap_or_else(|err| panic!("failed to compile schema {}: {err}", schema_path.display()));

    let errors = compiled
        .validate(instance)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>());
    if let Some(errors) = errors {
        panic!("schema validation failed for {}:\n{}", schema_file, errors.join("\n"));
    }
}

fn rule_ids(report: &Value, bucket: &str) -> Vec<u64> {
    report
        .get(bucket)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing report bucket `{bucket}` in payload: {report}"))
        .iter()
        .map(|outcome| {
            outcome
                .get("ruleId")
                .and_then(Value::as_u64)
                .unwrap_or_else(|| panic!("outcome without ruleId: {outcome}"))
        })
        .collect()
}

fn validate_args(design: &str) -> Vec<String> {
    vec![
        "validate".to_string(),
        "--rules".to_string(),
        fixture("rules.json"),
        "--catalog".to_string(),
        fixture("catalog.json"),
        "--design".to_string(),
        fixture(design),
        "--as-of".to_string(),
        AS_OF.to_string(),
    ]
}

// Test IDs: TCLI-RULES-001
#[test]
fn validate_valid_design_matches_contract() {
    let payload = run_json(validate_args("design_valid.json"));
    validate_schema("validation_run.schema.json", &payload);

    assert_eq!(payload["contract_version"], "cli.v1");
    assert_eq!(payload["api_contract_version"], "api.v1");
    assert_eq!(payload["ruleset_version"], "rules-2026-10-01");
    assert_eq!(payload["evaluated_at"], AS_OF);
    assert_eq!(payload["valid"], true);
    assert_eq!(payload["context"]["numPanels"], 8.0);
    assert_eq!(rule_ids(&payload["report"], "violations"), Vec::<u64>::new());
    assert_eq!(rule_ids(&payload["report"], "recommendations"), vec![4]);
}

// Test IDs: TCLI-RULES-002
#[test]
fn validate_invalid_design_reports_violations_in_rule_order() {
    let payload = run_json(validate_args("design_invalid.json"));
    validate_schema("validation_run.schema.json", &payload);

    assert_eq!(payload["valid"], false);
    assert_eq!(rule_ids(&payload["report"], "violations"), vec![1, 2, 3]);
    assert_eq!(rule_ids(&payload["report"], "configErrors"), Vec::<u64>::new());

    let excludes = &payload["report"]["violations"][1];
    assert_eq!(excludes["matchedProductIds"], serde_json::json!([303]));
    let rails = &payload["report"]["violations"][2];
    assert_eq!(rails["required"], 3);
    assert_eq!(rails["present"], 2);
}

// Test IDs: TCLI-RULES-003
#[test]
fn fail_on_invalid_exits_non_zero_after_printing_report() {
    let mut args = validate_args("design_invalid.json");
    args.push("--fail-on-invalid".to_string());

    let output = run_crules(&args);
    assert!(!output.status.success());
    let payload = parse_stdout(&output);
    assert_eq!(payload["valid"], false);

    let mut args = validate_args("design_valid.json");
    args.push("--fail-on-invalid".to_string());
    assert!(run_crules(&args).status.success());
}

// Test IDs: TCLI-RULES-004
#[test]
fn validate_output_is_byte_identical_across_runs() {
    let first = run_crules(validate_args("design_invalid.json"));
    let second = run_crules(validate_args("design_invalid.json"));

    assert!(first.status.success());
    assert_eq!(first.stdout, second.stdout);
}

#[test]
fn context_file_overrides_derived_counts() {
    let mut args = validate_args("design_valid.json");
    args.push("--context".to_string());
    args.push(fixture("context_override.json"));

    let payload = run_json(&args);
    assert_eq!(payload["context"]["numPanels"], 12.0);
    assert_eq!(rule_ids(&payload["report"], "violations"), vec![3]);
}

#[test]
fn out_of_range_context_value_is_rejected_while_parsing() {
    let dir = unique_temp_dir("crules-context");
    let context = dir.join("context.json");
    fs::write(&context, "{ \"numPanels\": 1e400 }")
        .unwrap_or_else(|err| panic!("failed to write context file: {err}"));

    let mut args = validate_args("design_valid.json");
    args.push("--context".to_string());
    args.push(context.display().to_string());

    let output = run_crules(&args);
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn no_derive_context_turns_formulas_into_config_errors() {
    let mut args = validate_args("design_valid.json");
    args.push("--no-derive-context".to_string());

    let payload = run_json(&args);
    validate_schema("validation_run.schema.json", &payload);
    assert_eq!(rule_ids(&payload["report"], "configErrors"), vec![1, 3, 5]);
    assert_eq!(payload["valid"], false);
}

#[test]
fn custom_category_table_is_honoured() {
    let dir = unique_temp_dir("crules-categories");
    let table = dir.join("categories.yaml");
    fs::write(
        &table,
        "version: categories.site-7\ncategories:\n  inverter: [type, voltage]\n  panel: [wattage]\n  battery: [voltage, type]\n  mounting: [roofType]\n  breaker: [ampRating]\n",
    )
    .unwrap_or_else(|err| panic!("failed to write category table: {err}"));
    let table_path = table
        .to_str()
        .unwrap_or_else(|| panic!("path should be valid UTF-8: {}", table.display()))
        .to_string();

    let mut args = vec!["--categories".to_string(), table_path];
    args.extend(validate_args("design_valid.json"));
    let payload = run_json(&args);

    assert_eq!(payload["categories_version"], "categories.site-7");
    assert_eq!(rule_ids(&payload["report"], "configErrors"), vec![4]);
    assert_eq!(rule_ids(&payload["report"], "recommendations"), Vec::<u64>::new());
}

#[test]
fn rejects_non_utc_as_of() {
    let mut args = validate_args("design_valid.json");
    let last = args.len() - 1;
    args[last] = "2026-10-01T12:00:00+02:00".to_string();

    let output = run_crules(&args);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("UTC"), "stderr: {stderr}");
}

// Test IDs: TCLI-RULES-005
#[test]
fn rules_check_lists_authoring_defects() {
    let payload = run_json([
        "rules",
        "check",
        "--rules",
        fixture("rules_broken.json").as_str(),
        "--catalog",
        fixture("catalog.json").as_str(),
    ]);
    validate_schema("rule_check.schema.json", &payload);

    assert_eq!(payload["clean"], false);
    assert_eq!(payload["rule_count"], 3);
    let kinds = payload["diagnostics"]
        .as_array()
        .unwrap_or_else(|| panic!("diagnostics should be an array: {payload}"))
        .iter()
        .map(|item| {
            (
                item["ruleId"].as_u64().unwrap_or_default(),
                item["kind"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec![
            (10, "unknownConstraintKey".to_string()),
            (11, "formulaSyntax".to_string()),
            (12, "unknownFormulaVariable".to_string()),
            (12, "unknownSubjectProduct".to_string()),
        ]
    );
}

#[test]
fn rules_check_accepts_declared_variables() {
    let payload = run_json([
        "rules",
        "check",
        "--rules",
        fixture("rules.json").as_str(),
        "--catalog",
        fixture("catalog.json").as_str(),
        "--variable",
        "stringCount",
    ]);
    validate_schema("rule_check.schema.json", &payload);
    assert_eq!(payload["clean"], true);
}

#[test]
fn formula_eval_resolves_with_ceiling() {
    let payload =
        run_json(["formula", "eval", "--formula", "numPanels / 4", "--var", "numPanels=10"]);

    assert_eq!(payload["required"], 3);
    assert_eq!(payload["normalized"], "numPanels / 4");
    assert_eq!(payload["error"], Value::Null);
}

#[test]
fn formula_eval_reports_unknown_variable_without_failing() {
    let payload = run_json(["formula", "eval", "--formula", "numPanels / 4"]);

    assert_eq!(payload["required"], Value::Null);
    assert_eq!(payload["error"]["kind"], "unknownVariable");
}

#[test]
fn formula_eval_rejects_malformed_var_flag() {
    let output = run_crules(["formula", "eval", "--formula", "1", "--var", "numPanels"]);
    assert!(!output.status.success());
}

#[test]
fn categories_show_lists_builtin_table() {
    let payload = run_json(["categories", "show"]);

    assert_eq!(payload["version"], "categories.v1");
    assert_eq!(payload["api_contract_version"], "api.v1");
    let battery = payload["categories"]["battery"]
        .as_array()
        .unwrap_or_else(|| panic!("battery properties should be an array: {payload}"));
    assert!(battery.iter().any(|property| property == "voltage"));
}
