use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonschema::JSONSchema;
use serde_json::Value;

const FIXTURE_CATALOG: &str = "\
uuid: 01ARZ3NDEKTSV4RRFFQ69G5FAV
metadata:
  title: Demo Catalog
  version: 1.0.0
  last_modified: \"2023-01-01T00:00:00Z\"
groups:
  - id: a
    title: Access Control
    controls:
      - id: a-1
        title: Policy and Procedures
        params:
          - id: a-1_prm_1
            values: [Param_1_value]
        parts:
          - id: a-1_smt
            name: statement
            prose: \"The organization:\"
            parts:
              - id: a-1_smt.a
                name: item
                prose: does the first thing
                props:
                  - name: label
                    value: a.
              - id: a-1_smt.b
                name: item
                prose: does the second thing
                props:
                  - name: label
                    value: b.
      - id: a-2
        title: Retired Control
        props:
          - name: status
            value: Withdrawn
controls:
  - id: r-1
    title: Loose Control
";

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

fn run_ck<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_ck"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute ck binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_ck(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "ck command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }
    stdout_json(&output)
}

fn stdout_json(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_u64(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_fixture_catalog(dir: &Path) -> PathBuf {
    let path = dir.join("catalog.yaml");
    fs::write(&path, FIXTURE_CATALOG)
        .unwrap_or_else(|err| panic!("failed to write fixture catalog: {err}"));
    path
}

fn read_yaml(path: &Path) -> serde_yaml::Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_yaml::from_str(&body)
        .unwrap_or_else(|err| panic!("{} is not valid YAML: {err}", path.display()))
}

#[test]
fn generate_edit_assemble_round_trip() {
    let dir = unique_temp_dir("ck-roundtrip");
    let catalog_path = write_fixture_catalog(&dir);
    let md_dir = dir.join("markdown");
    let assembled_path = dir.join("assembled.yaml");

    let generated = run_json([
        "catalog",
        "generate",
        "--catalog",
        path_str(&catalog_path),
        "--out",
        path_str(&md_dir),
    ]);
    assert_eq!(as_str(&generated, "contract_version"), "ck.v1");
    assert_eq!(as_u64(&generated, "controls_written"), 2);
    assert_eq!(as_u64(&generated, "withdrawn_skipped"), 1);

    let a1_path = md_dir.join("a").join("a-1.md");
    assert!(a1_path.exists(), "a-1.md should be generated");
    assert!(!md_dir.join("a").join("a-2.md").exists(), "withdrawn control must not be generated");
    assert!(md_dir.join("r-1.md").exists(), "ungrouped control should land at the root");

    // edit the parameter value and add a statement item, like an author would
    let body = fs::read_to_string(&a1_path)
        .unwrap_or_else(|err| panic!("failed to read generated markdown: {err}"));
    assert!(body.contains("a-1_prm_1: Param_1_value"));
    let mut edited = body.replace("a-1_prm_1: Param_1_value", "a-1_prm_1: new value");
    edited.push_str("- [c.] My added item\n");
    fs::write(&a1_path, edited)
        .unwrap_or_else(|err| panic!("failed to write edited markdown: {err}"));

    let assembled = run_json([
        "catalog",
        "assemble",
        "--markdown",
        path_str(&md_dir),
        "--out",
        path_str(&assembled_path),
        "--catalog",
        path_str(&catalog_path),
        "--set-parameters",
        "--version",
        "2.0.0",
    ]);
    assert_eq!(as_str(&assembled, "title"), "Demo Catalog");
    assert_eq!(as_str(&assembled, "version"), "2.0.0");
    assert_eq!(as_u64(&assembled, "controls"), 2);

    let doc = read_yaml(&assembled_path);
    let a1 = &doc["groups"][0]["controls"][0];
    assert_eq!(a1["id"].as_str(), Some("a-1"));
    assert_eq!(a1["params"][0]["values"][0].as_str(), Some("new value"));
    let items = &a1["parts"][0]["parts"];
    let item_count = items.as_sequence().map_or(0, Vec::len);
    assert_eq!(item_count, 3, "edited statement should carry the added item");
    assert_eq!(items[2]["id"].as_str(), Some("a-1_smt.c"));
    assert_eq!(items[2]["props"][0]["value"].as_str(), Some("c."));
    assert_eq!(items[2]["prose"].as_str(), Some("My added item"));
    // withdrawn control is gone from the assembled catalog
    let group_controls = doc["groups"][0]["controls"]
        .as_sequence()
        .map_or(0, Vec::len);
    assert_eq!(group_controls, 1);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn info_honors_withdrawn_flag_and_contract_schema() {
    let dir = unique_temp_dir("ck-info");
    let catalog_path = write_fixture_catalog(&dir);

    let info = run_json(["catalog", "info", "--catalog", path_str(&catalog_path)]);
    assert_eq!(as_u64(&info, "controls"), 2);
    assert_eq!(as_u64(&info, "withdrawn_controls"), 1);
    assert_eq!(as_u64(&info, "groups"), 1);

    let with_withdrawn = run_json([
        "catalog",
        "info",
        "--catalog",
        path_str(&catalog_path),
        "--include-withdrawn",
    ]);
    assert_eq!(as_u64(&with_withdrawn, "controls"), 3);

    let schema = serde_json::json!({
        "type": "object",
        "required": [
            "contract_version", "title", "version", "controls",
            "withdrawn_controls", "groups", "include_withdrawn"
        ],
        "properties": {
            "contract_version": {"const": "ck.v1"},
            "title": {"type": "string"},
            "version": {"type": "string"},
            "controls": {"type": "integer", "minimum": 0},
            "withdrawn_controls": {"type": "integer", "minimum": 0},
            "groups": {"type": "integer", "minimum": 0},
            "include_withdrawn": {"type": "boolean"}
        }
    });
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("info contract schema should compile: {err}"));
    assert!(compiled.is_valid(&info), "info payload should match the contract schema: {info}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn template_validate_reports_per_instance_and_signals_failure() {
    let dir = unique_temp_dir("ck-validate");
    let template_path = dir.join("template.md");
    let instances_dir = dir.join("instances");
    fs::create_dir_all(&instances_dir)
        .unwrap_or_else(|err| panic!("failed to create instances dir: {err}"));

    fs::write(&template_path, "---\nowner: templates\n---\n\n# One\n\n# {{slot}}\n\n# Two\n")
        .unwrap_or_else(|err| panic!("failed to write template: {err}"));
    fs::write(
        instances_dir.join("good.md"),
        "---\nowner: me\n---\n\n# One\n\n# Quarterly Review\n\n# Two\n",
    )
    .unwrap_or_else(|err| panic!("failed to write good instance: {err}"));
    fs::write(
        instances_dir.join("reordered.md"),
        "---\nowner: me\n---\n\n# Two\n\n# Quarterly Review\n\n# One\n",
    )
    .unwrap_or_else(|err| panic!("failed to write reordered instance: {err}"));

    let output = run_ck([
        "template",
        "validate",
        "--template",
        path_str(&template_path),
        "--instances",
        path_str(&instances_dir),
    ]);
    assert!(!output.status.success(), "a non-conformant instance must fail the command");
    let report = stdout_json(&output);
    assert_eq!(as_u64(&report, "checked"), 2);
    assert_eq!(as_u64(&report, "failed"), 1);

    let instances = report
        .get("instances")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing instances array in payload: {report}"));
    let good = instances
        .iter()
        .find(|entry| as_str(entry, "instance").ends_with("good.md"))
        .unwrap_or_else(|| panic!("good.md report missing: {report}"));
    assert_eq!(good.get("valid"), Some(&Value::Bool(true)));
    let reordered = instances
        .iter()
        .find(|entry| as_str(entry, "instance").ends_with("reordered.md"))
        .unwrap_or_else(|| panic!("reordered.md report missing: {report}"));
    assert_eq!(reordered.get("valid"), Some(&Value::Bool(false)));

    fs::remove_file(instances_dir.join("reordered.md"))
        .unwrap_or_else(|err| panic!("failed to remove reordered instance: {err}"));
    let clean = run_json([
        "template",
        "validate",
        "--template",
        path_str(&template_path),
        "--instances",
        path_str(&instances_dir),
    ]);
    assert_eq!(as_u64(&clean, "failed"), 0);

    let _ = fs::remove_dir_all(&dir);
}
