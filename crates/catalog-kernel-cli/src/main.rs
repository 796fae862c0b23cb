use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use catalog_kernel_author::{
    assemble_catalog, generate_markdown, read_catalog_file, read_header_file, read_profile_file,
    validate_instances, write_catalog_file, AssembleOptions,
};
use catalog_kernel_core::CatalogIndex;
use catalog_kernel_markdown::{
    split_front_matter, HeaderDict, MarkdownTree, TemplateValidator, ValidatorOptions,
    DEFAULT_PLACEHOLDER_PATTERN,
};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "ck.v1";

#[derive(Debug, Parser)]
#[command(name = "ck")]
#[command(about = "Compliance catalog markdown authoring CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Catalog {
        #[command(subcommand)]
        command: Box<CatalogCommand>,
    },
    Template {
        #[command(subcommand)]
        command: Box<TemplateCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum CatalogCommand {
    Generate(GenerateArgs),
    Assemble(AssembleArgs),
    Info(InfoArgs),
}

#[derive(Debug, Subcommand)]
enum TemplateCommand {
    Validate(ValidateArgs),
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long)]
    catalog: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    header: Option<PathBuf>,
    #[arg(long)]
    profile: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct AssembleArgs {
    #[arg(long)]
    markdown: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    catalog: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    set_parameters: bool,
    #[arg(long)]
    version: Option<String>,
}

#[derive(Debug, Args)]
struct InfoArgs {
    #[arg(long)]
    catalog: PathBuf,
    #[arg(long, default_value_t = false)]
    include_withdrawn: bool,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    #[arg(long)]
    template: PathBuf,
    #[arg(long)]
    instances: PathBuf,
    #[arg(long)]
    governed_heading: Option<String>,
    #[arg(long, default_value_t = false)]
    no_header: bool,
    #[arg(long, default_value_t = false)]
    no_body: bool,
    #[arg(long, default_value_t = false)]
    template_version: bool,
    #[arg(long, default_value = DEFAULT_PLACEHOLDER_PATTERN)]
    placeholder_pattern: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
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

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Catalog { command } => match *command {
            CatalogCommand::Generate(args) => run_generate(&args),
            CatalogCommand::Assemble(args) => run_assemble(&args),
            CatalogCommand::Info(args) => run_info(&args),
        },
        Command::Template { command } => match *command {
            TemplateCommand::Validate(args) => run_validate(&args),
        },
    }
}

fn run_generate(args: &GenerateArgs) -> Result<()> {
    let catalog = read_catalog_file(&args.catalog)?;
    let yaml_header = match &args.header {
        Some(path) => read_header_file(path)?,
        None => HeaderDict::new(),
    };
    let profile = args.profile.as_ref().map(|path| read_profile_file(path)).transpose()?;

    let summary = generate_markdown(catalog, &args.out, &yaml_header, profile.as_ref())?;
    emit_json(serde_json::json!({
        "out_dir": args.out,
        "controls_written": summary.controls_written,
        "withdrawn_skipped": summary.withdrawn_skipped
    }))
}

fn run_assemble(args: &AssembleArgs) -> Result<()> {
    let original_catalog =
        args.catalog.as_ref().map(|path| read_catalog_file(path)).transpose()?;
    let assembled = assemble_catalog(
        &args.markdown,
        &AssembleOptions {
            original_catalog,
            set_parameters: args.set_parameters,
            version: args.version.clone(),
        },
    )?;
    let index = CatalogIndex::new(assembled)?;
    write_catalog_file(index.catalog(), &args.out)?;
    emit_json(serde_json::json!({
        "markdown_dir": args.markdown,
        "out_path": args.out,
        "title": index.catalog().metadata.title,
        "version": index.catalog().metadata.version,
        "controls": index.control_count(true),
        "groups": index.groups().count()
    }))
}

fn run_info(args: &InfoArgs) -> Result<()> {
    let catalog = read_catalog_file(&args.catalog)?;
    let index = CatalogIndex::new(catalog)?;
    emit_json(serde_json::json!({
        "title": index.catalog().metadata.title,
        "version": index.catalog().metadata.version,
        "controls": index.control_count(args.include_withdrawn),
        "withdrawn_controls": index.control_count(true) - index.control_count(false),
        "groups": index.groups().count(),
        "include_withdrawn": args.include_withdrawn
    }))
}

fn run_validate(args: &ValidateArgs) -> Result<()> {
    let template_text = fs::read_to_string(&args.template)
        .with_context(|| format!("failed to read template {}", args.template.display()))?;
    let (template_header, template_body) = split_front_matter(&template_text)
        .with_context(|| format!("failed to parse template {}", args.template.display()))?;
    let validator = TemplateValidator::new(
        template_header,
        MarkdownTree::parse(template_body),
        ValidatorOptions {
            validate_header: !args.no_header,
            validate_body: !args.no_body,
            governed_heading: args.governed_heading.clone(),
            require_template_version: args.template_version,
            placeholder_pattern: args.placeholder_pattern.clone(),
        },
    )?;

    let reports = validate_instances(&validator, &args.instances)?;
    let checked = reports.len();
    let failed = reports.iter().filter(|entry| !entry.report.valid).count();
    emit_json(serde_json::json!({
        "template": args.template,
        "checked": checked,
        "failed": failed,
        "instances": reports
    }))?;

    if failed > 0 {
        return Err(anyhow!("{failed} of {checked} instances failed validation"));
    }
    Ok(())
}
