//! Generate/assemble orchestrator: drives a catalog out to per-control
//! markdown and an edited markdown tree back into a merged catalog. This is
//! the filesystem boundary; the core and markdown crates stay pure.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use catalog_kernel_core::{
    control_param_dict, full_profile_param_dict, Catalog, CatalogId, CatalogIndex, Control, Group,
    Metadata, Profile,
};
use catalog_kernel_markdown::{
    read_control_markdown, split_front_matter, write_control_markdown, HeaderDict, MarkdownTree,
    TemplateValidator, ValidationPass, ValidationReport, GROUP_TITLE_HEADER_KEY,
};
use serde::Serialize;
use time::OffsetDateTime;

const DEFAULT_ASSEMBLED_VERSION: &str = "0.1.0";

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct GenerateSummary {
    pub controls_written: usize,
    pub withdrawn_skipped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AssembleOptions {
    pub original_catalog: Option<Catalog>,
    pub set_parameters: bool,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct InstanceReport {
    pub instance: PathBuf,
    #[serde(flatten)]
    pub report: ValidationReport,
}

/// Read a catalog document, YAML or JSON by extension.
///
/// # Errors
/// Fails on IO problems or a document that does not deserialize.
pub fn read_catalog_file(path: &Path) -> Result<Catalog> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read catalog file {}", path.display()))?;
    if path.extension().and_then(OsStr::to_str) == Some("json") {
        serde_json::from_str(&body)
            .with_context(|| format!("failed to parse catalog JSON {}", path.display()))
    } else {
        serde_yaml::from_str(&body)
            .with_context(|| format!("failed to parse catalog YAML {}", path.display()))
    }
}

/// Write a catalog document, YAML or JSON by extension.
///
/// # Errors
/// Fails on IO problems or serialization failure.
pub fn write_catalog_file(catalog: &Catalog, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let body = if path.extension().and_then(OsStr::to_str) == Some("json") {
        serde_json::to_string_pretty(catalog).context("failed to serialize catalog to JSON")?
    } else {
        serde_yaml::to_string(catalog).context("failed to serialize catalog to YAML")?
    };
    fs::write(path, body)
        .with_context(|| format!("failed to write catalog file {}", path.display()))
}

/// Read a resolved profile document, YAML or JSON by extension.
///
/// # Errors
/// Fails on IO problems or a document that does not deserialize.
pub fn read_profile_file(path: &Path) -> Result<Profile> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read profile file {}", path.display()))?;
    if path.extension().and_then(OsStr::to_str) == Some("json") {
        serde_json::from_str(&body)
            .with_context(|| format!("failed to parse profile JSON {}", path.display()))
    } else {
        serde_yaml::from_str(&body)
            .with_context(|| format!("failed to parse profile YAML {}", path.display()))
    }
}

/// Read a YAML header template into an ordered header dict.
///
/// # Errors
/// Fails on IO problems or when the file is not a YAML mapping.
pub fn read_header_file(path: &Path) -> Result<HeaderDict> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read header file {}", path.display()))?;
    let value: serde_yaml::Value = serde_yaml::from_str(&body)
        .with_context(|| format!("failed to parse header YAML {}", path.display()))?;
    HeaderDict::from_yaml(&value)
        .with_context(|| format!("header file is not a YAML mapping: {}", path.display()))
}

/// Write one markdown file per non-withdrawn control under
/// `<group-id-path>/<control-id>.md`, with parameters resolved through the
/// profile context when one is supplied.
///
/// # Errors
/// Fails on a corrupt catalog (duplicate control ids) or IO failure; IO
/// errors carry the offending path.
pub fn generate_markdown(
    catalog: Catalog,
    out_dir: &Path,
    yaml_header: &HeaderDict,
    profile: Option<&Profile>,
) -> Result<GenerateSummary> {
    let index = CatalogIndex::new(catalog)?;
    let full_dict = profile.map(full_profile_param_dict).unwrap_or_default();

    let mut controls_written = 0;
    let mut withdrawn_skipped = 0;
    for entry in index.controls() {
        if entry.control.is_withdrawn() {
            withdrawn_skipped += 1;
            continue;
        }
        let resolved = control_param_dict(entry.control, &full_dict);
        let text =
            write_control_markdown(entry.control, &resolved, yaml_header, entry.group_title)?;

        let mut dir = out_dir.to_path_buf();
        for segment in &entry.group_path {
            dir.push(segment);
        }
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create markdown directory {}", dir.display()))?;
        let path = dir.join(format!("{}.md", entry.control.id));
        fs::write(&path, text)
            .with_context(|| format!("failed to write control markdown {}", path.display()))?;
        controls_written += 1;
    }
    Ok(GenerateSummary { controls_written, withdrawn_skipped })
}

/// Every markdown file under the directory tree, in a deterministic sorted
/// order so generate/assemble is reproducible across runs. The file stem is
/// the control id, so dotted ids like `s.1.1.1` keep their dots.
///
/// # Errors
/// Fails when a directory cannot be read.
pub fn sorted_control_paths(md_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    collect_markdown_paths(md_dir, &mut paths)?;
    paths.sort();
    Ok(paths)
}

fn collect_markdown_paths(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read markdown directory {}", dir.display()))?;
    for entry in entries {
        let entry = entry
            .with_context(|| format!("failed to read directory entry under {}", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            collect_markdown_paths(&path, out)?;
        } else if path.extension().and_then(OsStr::to_str) == Some("md") {
            out.push(path);
        }
    }
    Ok(())
}

/// Reassemble a catalog from an edited markdown directory.
///
/// With an original catalog, its withdrawn controls are deleted and each
/// edited control is merged into its original through the index, so the
/// result is the original minus withdrawn controls plus the edits. Without
/// one, the catalog is rebuilt from the directory structure: group ids from
/// subdirectory names, group titles from the markdown headers, metadata
/// title from the markdown directory name, and parameters only when
/// `set_parameters` is on.
///
/// # Errors
/// Fails when the directory holds no control markdown, an edited control is
/// unknown to the original catalog, or a document cannot be parsed.
pub fn assemble_catalog(md_dir: &Path, options: &AssembleOptions) -> Result<Catalog> {
    let control_paths = sorted_control_paths(md_dir)?;
    if control_paths.is_empty() {
        return Err(anyhow!("no control markdown found under {}", md_dir.display()));
    }

    let mut edited = Vec::with_capacity(control_paths.len());
    for path in control_paths {
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read control markdown {}", path.display()))?;
        let (header, control) = read_control_markdown(&text)
            .with_context(|| format!("failed to parse control markdown {}", path.display()))?;
        edited.push((path, header, control));
    }

    let mut catalog = match options.original_catalog.clone() {
        Some(original) => {
            let mut index = CatalogIndex::new(original)?;
            index.delete_withdrawn_controls()?;
            for (path, _, control) in &edited {
                let mut base = index
                    .control(&control.id)
                    .with_context(|| {
                        format!(
                            "control {} from {} is not in the original catalog",
                            control.id,
                            path.display()
                        )
                    })?
                    .clone();
                CatalogIndex::merge_controls(&mut base, control, options.set_parameters);
                index.replace_control(base)?;
            }
            index.into_catalog()
        }
        None => build_catalog_from_markdown(md_dir, &edited, options.set_parameters)?,
    };

    catalog.uuid = CatalogId::new();
    catalog.metadata.last_modified = OffsetDateTime::now_utc();
    if let Some(version) = &options.version {
        catalog.metadata.version = version.clone();
    }
    Ok(catalog)
}

fn build_catalog_from_markdown(
    md_dir: &Path,
    edited: &[(PathBuf, HeaderDict, Control)],
    set_parameters: bool,
) -> Result<Catalog> {
    let title = md_dir
        .file_name()
        .map_or_else(|| "assembled-catalog".to_string(), |name| name.to_string_lossy().into_owned());
    let mut catalog = Catalog {
        uuid: CatalogId::new(),
        metadata: Metadata {
            title,
            version: DEFAULT_ASSEMBLED_VERSION.to_string(),
            last_modified: OffsetDateTime::now_utc(),
        },
        groups: Vec::new(),
        controls: Vec::new(),
    };

    for (path, header, control) in edited {
        let mut control = control.clone();
        if !set_parameters {
            control.params = Vec::new();
        }
        let relative = path.strip_prefix(md_dir).with_context(|| {
            format!("control path {} is outside the markdown directory", path.display())
        })?;
        let group_ids: Vec<String> = relative
            .parent()
            .map(|parent| {
                parent
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        if group_ids.is_empty() {
            catalog.controls.push(control);
        } else {
            let group_title = header.get_str(GROUP_TITLE_HEADER_KEY);
            insert_into_groups(&mut catalog.groups, &group_ids, group_title, control);
        }
    }
    Ok(catalog)
}

fn insert_into_groups(
    groups: &mut Vec<Group>,
    group_ids: &[String],
    leaf_title: Option<&str>,
    control: Control,
) {
    let Some((first, rest)) = group_ids.split_first() else {
        return;
    };
    let position = groups.iter().position(|group| group.id == *first);
    let index = match position {
        Some(index) => index,
        None => {
            groups.push(Group {
                id: first.clone(),
                title: first.clone(),
                groups: Vec::new(),
                controls: Vec::new(),
            });
            groups.len() - 1
        }
    };
    let group = &mut groups[index];
    if rest.is_empty() {
        if let Some(title) = leaf_title {
            group.title = title.to_string();
        }
        group.controls.push(control);
    } else {
        insert_into_groups(&mut group.groups, rest, leaf_title, control);
    }
}

/// Validate every markdown instance under `target` (a file or a directory
/// tree) against the template. One bad instance never aborts the walk: an
/// unparseable document becomes a failed report and the walk continues.
///
/// # Errors
/// Fails on IO problems or a malformed template; instance-side problems are
/// reported, not raised.
pub fn validate_instances(
    validator: &TemplateValidator,
    target: &Path,
) -> Result<Vec<InstanceReport>> {
    let paths = if target.is_dir() {
        sorted_control_paths(target)?
    } else {
        vec![target.to_path_buf()]
    };

    let mut reports = Vec::with_capacity(paths.len());
    for path in paths {
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read markdown instance {}", path.display()))?;
        let instance_name = path.to_string_lossy().into_owned();
        let report = match split_front_matter(&text) {
            Ok((header, body)) => {
                validator.validate(&instance_name, &header, &MarkdownTree::parse(body))?
            }
            Err(err) => ValidationReport::rejected(
                ValidationPass::HeaderKeys,
                format!("instance front matter is unreadable: {err}"),
            ),
        };
        reports.push(InstanceReport { instance: path, report });
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use catalog_kernel_core::{Parameter, Part, Property, LABEL_PROPERTY, STATUS_PROPERTY, WITHDRAWN_STATUS};
    use catalog_kernel_markdown::ValidatorOptions;
    use ulid::Ulid;

    use super::*;

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("catalogkernel-{prefix}-{}", Ulid::new()));
        if let Err(err) = fs::create_dir_all(&dir) {
            panic!("failed to create temp dir {}: {err}", dir.display());
        }
        dir
    }

    fn mk_item(id: &str, label: &str, prose: &str) -> Part {
        Part {
            id: id.to_string(),
            name: "item".to_string(),
            prose: Some(prose.to_string()),
            parts: Vec::new(),
            props: vec![Property::new(LABEL_PROPERTY, label)],
        }
    }

    fn mk_control(id: &str, title: &str) -> Control {
        Control {
            id: id.to_string(),
            title: title.to_string(),
            params: vec![
                Parameter {
                    id: format!("{id}_prm_1"),
                    label: None,
                    values: vec!["Param_1_value".to_string()],
                    choices: Vec::new(),
                },
                Parameter {
                    id: format!("{id}_prm_2"),
                    label: Some("organization-defined frequency".to_string()),
                    values: Vec::new(),
                    choices: Vec::new(),
                },
            ],
            parts: vec![Part {
                id: format!("{id}_smt"),
                name: "statement".to_string(),
                prose: Some("The organization:".to_string()),
                parts: vec![
                    mk_item(&format!("{id}_smt.a"), "a.", "does the first thing"),
                    mk_item(&format!("{id}_smt.b"), "b.", "does the second thing"),
                ],
                props: Vec::new(),
            }],
            props: Vec::new(),
        }
    }

    fn fixture_catalog() -> Catalog {
        let mut withdrawn = mk_control("a-2", "Retired Control");
        withdrawn.props.push(Property::new(STATUS_PROPERTY, WITHDRAWN_STATUS));
        Catalog {
            uuid: CatalogId::new(),
            metadata: Metadata {
                title: "Demo Catalog".to_string(),
                version: "1.0.0".to_string(),
                last_modified: OffsetDateTime::UNIX_EPOCH,
            },
            groups: vec![
                Group {
                    id: "a".to_string(),
                    title: "Access Control".to_string(),
                    groups: Vec::new(),
                    controls: vec![mk_control("a-1", "Policy and Procedures"), withdrawn],
                },
                Group {
                    id: "b".to_string(),
                    title: "Audit".to_string(),
                    groups: vec![Group {
                        id: "b1".to_string(),
                        title: "Audit Records".to_string(),
                        groups: Vec::new(),
                        controls: vec![mk_control("d-1", "Retention")],
                    }],
                    controls: Vec::new(),
                },
            ],
            controls: vec![mk_control("r-1", "Loose Control")],
        }
    }

    fn generate_fixture(md_dir: &Path) -> Catalog {
        let catalog = fixture_catalog();
        match generate_markdown(catalog.clone(), md_dir, &HeaderDict::new(), None) {
            Ok(summary) => {
                assert_eq!(summary.controls_written, 3);
                assert_eq!(summary.withdrawn_skipped, 1);
            }
            Err(err) => panic!("generation should succeed: {err}"),
        }
        catalog
    }

    fn expected_without_withdrawn(catalog: Catalog) -> Catalog {
        let mut index = match CatalogIndex::new(catalog) {
            Ok(index) => index,
            Err(err) => panic!("fixture catalog should index: {err}"),
        };
        if let Err(err) = index.delete_withdrawn_controls() {
            panic!("withdrawn deletion should succeed: {err}");
        }
        index.into_catalog()
    }

    // Test IDs: TAUT-001
    #[test]
    fn control_paths_are_recursive_and_sorted() {
        let dir = unique_temp_dir("paths");
        let nested = dir.join("g1").join("g2");
        if let Err(err) = fs::create_dir_all(&nested) {
            panic!("failed to create nested dirs: {err}");
        }
        for path in [dir.join("s.1.1.1.md"), nested.join("x-2.md"), dir.join("g1").join("x-1.md")]
        {
            if let Err(err) = fs::write(&path, "# stub\n") {
                panic!("failed to write {}: {err}", path.display());
            }
        }
        if let Err(err) = fs::write(dir.join("notes.txt"), "ignored") {
            panic!("failed to write notes: {err}");
        }

        let paths = match sorted_control_paths(&dir) {
            Ok(paths) => paths,
            Err(err) => panic!("path discovery should succeed: {err}"),
        };
        let names: Vec<String> = paths
            .iter()
            .filter_map(|path| path.strip_prefix(&dir).ok())
            .map(|path| path.to_string_lossy().into_owned())
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(names.len(), 3);
        assert!(names.iter().any(|name| name.ends_with("s.1.1.1.md")));
        let _ = fs::remove_dir_all(&dir);
    }

    // Test IDs: TAUT-002
    #[test]
    fn generate_places_controls_by_group_path_and_skips_withdrawn() {
        let md_dir = unique_temp_dir("generate");
        let _ = generate_fixture(&md_dir);

        assert!(md_dir.join("a").join("a-1.md").exists());
        assert!(md_dir.join("b").join("b1").join("d-1.md").exists());
        assert!(md_dir.join("r-1.md").exists());
        assert!(!md_dir.join("a").join("a-2.md").exists());
        let _ = fs::remove_dir_all(&md_dir);
    }

    // Test IDs: TAUT-003
    #[test]
    fn unedited_round_trip_reproduces_catalog_minus_withdrawn() {
        let md_dir = unique_temp_dir("roundtrip");
        let original = generate_fixture(&md_dir);

        let assembled = match assemble_catalog(
            &md_dir,
            &AssembleOptions {
                original_catalog: Some(original.clone()),
                set_parameters: false,
                version: None,
            },
        ) {
            Ok(catalog) => catalog,
            Err(err) => panic!("assembly should succeed: {err}"),
        };

        let expected = expected_without_withdrawn(original);
        assert_eq!(assembled.metadata.title, expected.metadata.title);
        assert_eq!(assembled.metadata.version, expected.metadata.version);
        assert_eq!(assembled.groups, expected.groups);
        assert_eq!(assembled.controls, expected.controls);
        let _ = fs::remove_dir_all(&md_dir);
    }

    // Test IDs: TAUT-004
    #[test]
    fn fresh_assembly_rebuilds_groups_and_gates_parameters() {
        let md_dir = unique_temp_dir("fresh");
        let _ = generate_fixture(&md_dir);

        let without_params = match assemble_catalog(&md_dir, &AssembleOptions::default()) {
            Ok(catalog) => catalog,
            Err(err) => panic!("fresh assembly should succeed: {err}"),
        };
        let dir_name = md_dir.file_name().map(|n| n.to_string_lossy().into_owned());
        assert_eq!(Some(without_params.metadata.title.clone()), dir_name);
        assert_eq!(without_params.groups.len(), 2);
        let group_a = &without_params.groups[0];
        assert_eq!(group_a.id, "a");
        assert_eq!(group_a.title, "Access Control");
        assert!(group_a.controls.iter().all(|control| control.params.is_empty()));
        let group_b = &without_params.groups[1];
        assert_eq!(group_b.title, "b");
        assert_eq!(group_b.groups[0].title, "Audit Records");

        let with_params = match assemble_catalog(
            &md_dir,
            &AssembleOptions { set_parameters: true, ..AssembleOptions::default() },
        ) {
            Ok(catalog) => catalog,
            Err(err) => panic!("fresh assembly should succeed: {err}"),
        };
        let a1 = &with_params.groups[0].controls[0];
        assert_eq!(a1.params[0].values, vec!["Param_1_value".to_string()]);
        let _ = fs::remove_dir_all(&md_dir);
    }

    // Test IDs: TAUT-005
    #[test]
    fn assemble_applies_version_override() {
        let md_dir = unique_temp_dir("version");
        let original = generate_fixture(&md_dir);

        let assembled = match assemble_catalog(
            &md_dir,
            &AssembleOptions {
                original_catalog: Some(original),
                set_parameters: false,
                version: Some("1.2.3".to_string()),
            },
        ) {
            Ok(catalog) => catalog,
            Err(err) => panic!("assembly should succeed: {err}"),
        };
        assert_eq!(assembled.metadata.version, "1.2.3");
        let _ = fs::remove_dir_all(&md_dir);
    }

    // Test IDs: TAUT-006
    #[test]
    fn validation_walk_survives_broken_instances() {
        let dir = unique_temp_dir("validate");
        let template = "---\na: 1\n---\n\n# One\n\n# Two\n";
        let good = "---\na: 9\n---\n\n# One\n\n# Two\n";
        let reordered = "---\na: 9\n---\n\n# Two\n\n# One\n";
        let unterminated = "---\na: 9\n\n# One\n";
        for (name, body) in
            [("good.md", good), ("reordered.md", reordered), ("broken.md", unterminated)]
        {
            if let Err(err) = fs::write(dir.join(name), body) {
                panic!("failed to write {name}: {err}");
            }
        }

        let (header, body) = match split_front_matter(template) {
            Ok(split) => split,
            Err(err) => panic!("template should split: {err}"),
        };
        let validator = match TemplateValidator::new(
            header,
            MarkdownTree::parse(body),
            ValidatorOptions::default(),
        ) {
            Ok(validator) => validator,
            Err(err) => panic!("validator should build: {err}"),
        };

        let reports = match validate_instances(&validator, &dir) {
            Ok(reports) => reports,
            Err(err) => panic!("validation walk should not abort: {err}"),
        };
        assert_eq!(reports.len(), 3);
        let verdicts: Vec<(String, bool)> = reports
            .iter()
            .filter_map(|entry| {
                entry
                    .instance
                    .file_name()
                    .map(|name| (name.to_string_lossy().into_owned(), entry.report.valid))
            })
            .collect();
        assert_eq!(
            verdicts,
            vec![
                ("broken.md".to_string(), false),
                ("good.md".to_string(), true),
                ("reordered.md".to_string(), false),
            ]
        );
        let _ = fs::remove_dir_all(&dir);
    }
}
