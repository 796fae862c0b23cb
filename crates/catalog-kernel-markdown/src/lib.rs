use std::ops::Range;

use catalog_kernel_core::{param_to_str, Control, Parameter, Part, Property, LABEL_PROPERTY};
use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use regex_lite::Regex;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum MarkdownError {
    #[error("malformed markdown: {0}")]
    Malformed(String),
    #[error("malformed template: {0}")]
    MalformedTemplate(String),
    #[error("invalid placeholder pattern: {0}")]
    PlaceholderPattern(String),
    #[error("front matter is not valid YAML: {0}")]
    FrontMatter(#[from] serde_yaml::Error),
}

/// Header key the template's own version is declared under.
pub const TEMPLATE_VERSION_KEY: &str = "x-template-version";
/// Header key a versioned template must also populate.
pub const VERSION_KEY: &str = "Version";
/// Header key carrying the control's resolved parameter values.
pub const PARAMS_HEADER_KEY: &str = "x-catalog-params";
/// Header key carrying the owning group's title for reassembly.
pub const GROUP_TITLE_HEADER_KEY: &str = "x-catalog-group-title";
/// Substitution headings look like `{{anything}}` unless reconfigured.
pub const DEFAULT_PLACEHOLDER_PATTERN: &str = r"\{\{.*\}\}";

const VALUE_SEPARATOR: &str = ", ";
const PART_HEADING_PREFIX: &str = "Control ";

// ---------------------------------------------------------------------------
// Header dict
// ---------------------------------------------------------------------------

/// One header value: either a terminal YAML scalar/sequence or a nested
/// mapping. The explicit variant keeps `compare_keys` recursion exhaustive.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Leaf(serde_yaml::Value),
    Mapping(HeaderDict),
}

/// An ordered key/value mapping parsed from YAML front matter. Order is the
/// YAML document order and survives emission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderDict {
    entries: Vec<(String, HeaderValue)>,
}

impl HeaderDict {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[(String, HeaderValue)] {
        &self.entries
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// String payload of a leaf entry, if the key holds one.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(HeaderValue::Leaf(serde_yaml::Value::String(value))) => Some(value.as_str()),
            _ => None,
        }
    }

    /// Insert or replace, keeping the original position on replacement.
    pub fn insert(&mut self, key: &str, value: HeaderValue) {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key.to_string(), value));
        }
    }

    /// Convert a parsed YAML mapping into an ordered header dict.
    ///
    /// # Errors
    /// Returns [`MarkdownError::Malformed`] when the value is not a mapping
    /// or a mapping key is not a string.
    pub fn from_yaml(value: &serde_yaml::Value) -> Result<Self, MarkdownError> {
        let serde_yaml::Value::Mapping(mapping) = value else {
            return Err(MarkdownError::Malformed(
                "front matter must be a YAML mapping".to_string(),
            ));
        };
        let mut dict = Self::new();
        for (key, value) in mapping {
            let serde_yaml::Value::String(key) = key else {
                return Err(MarkdownError::Malformed(
                    "front matter keys must be strings".to_string(),
                ));
            };
            let header_value = match value {
                serde_yaml::Value::Mapping(_) => HeaderValue::Mapping(Self::from_yaml(value)?),
                other => HeaderValue::Leaf(other.clone()),
            };
            dict.entries.push((key.clone(), header_value));
        }
        Ok(dict)
    }

    #[must_use]
    pub fn to_yaml(&self) -> serde_yaml::Value {
        let mut mapping = serde_yaml::Mapping::new();
        for (key, value) in &self.entries {
            let yaml_value = match value {
                HeaderValue::Leaf(leaf) => leaf.clone(),
                HeaderValue::Mapping(nested) => nested.to_yaml(),
            };
            mapping.insert(serde_yaml::Value::String(key.clone()), yaml_value);
        }
        serde_yaml::Value::Mapping(mapping)
    }
}

/// Whether the candidate header maintains the template's key structure:
/// equal key counts at every nesting level reached, every template key
/// present, and mapping-shaped wherever the template is mapping-shaped.
/// Leaf values are never compared.
#[must_use]
pub fn compare_keys(template: &HeaderDict, candidate: &HeaderDict) -> bool {
    if template.len() != candidate.len() {
        return false;
    }
    for (key, template_value) in template.entries() {
        let Some(candidate_value) = candidate.get(key) else {
            return false;
        };
        if let HeaderValue::Mapping(template_nested) = template_value {
            match candidate_value {
                HeaderValue::Mapping(candidate_nested) => {
                    if !compare_keys(template_nested, candidate_nested) {
                        return false;
                    }
                }
                HeaderValue::Leaf(_) => return false,
            }
        }
    }
    true
}

/// Split YAML front matter (`--- ... ---`) off a markdown document. A
/// document without front matter yields an empty header and the full text.
///
/// # Errors
/// Returns [`MarkdownError::Malformed`] for an unterminated block and
/// [`MarkdownError::FrontMatter`] when the block is not valid YAML.
pub fn split_front_matter(text: &str) -> Result<(HeaderDict, &str), MarkdownError> {
    let stripped = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut lines = stripped.split_inclusive('\n');
    let Some(first) = lines.next() else {
        return Ok((HeaderDict::new(), stripped));
    };
    if first.trim_end() != "---" {
        return Ok((HeaderDict::new(), stripped));
    }

    let mut offset = first.len();
    let mut block_end = None;
    for line in lines {
        let line_start = offset;
        offset += line.len();
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed == "..." {
            block_end = Some((line_start, offset));
            break;
        }
    }
    let Some((yaml_end, body_start)) = block_end else {
        return Err(MarkdownError::Malformed("front matter is not terminated".to_string()));
    };

    let yaml_src = &stripped[first.len()..yaml_end];
    let body = &stripped[body_start..];
    if yaml_src.trim().is_empty() {
        return Ok((HeaderDict::new(), body));
    }
    let value: serde_yaml::Value = serde_yaml::from_str(yaml_src)?;
    Ok((HeaderDict::from_yaml(&value)?, body))
}

/// Render a header dict back to a front-matter block, empty header included
/// as no block at all.
///
/// # Errors
/// Returns [`MarkdownError::FrontMatter`] if YAML serialization fails.
pub fn render_front_matter(header: &HeaderDict) -> Result<String, MarkdownError> {
    if header.is_empty() {
        return Ok(String::new());
    }
    let yaml = serde_yaml::to_string(&header.to_yaml())?;
    Ok(format!("---\n{yaml}---\n\n"))
}

// ---------------------------------------------------------------------------
// Markdown tree
// ---------------------------------------------------------------------------

/// One heading with the raw content under it (up to its first subheading)
/// and its subheadings in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkdownNode {
    pub key: String,
    pub level: u8,
    pub content: String,
    pub subnodes: Vec<MarkdownNode>,
}

/// A governed `key: value` line from a heading's body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernedEntry {
    pub key: String,
    pub value: String,
}

impl MarkdownNode {
    /// The `key: value` lines of this node's own content, in order.
    #[must_use]
    pub fn governed_entries(&self) -> Vec<GovernedEntry> {
        self.content
            .lines()
            .filter_map(|line| {
                let (key, value) = line.split_once(':')?;
                let key = key.trim();
                if key.is_empty() {
                    return None;
                }
                Some(GovernedEntry { key: key.to_string(), value: value.trim().to_string() })
            })
            .collect()
    }

    fn find<'a>(&'a self, key: &str, exact: bool) -> Option<&'a MarkdownNode> {
        for node in &self.subnodes {
            let hit = if exact { node.key == key } else { node.key.contains(key) };
            if hit {
                return Some(node);
            }
            if let Some(found) = node.find(key, exact) {
                return Some(found);
            }
        }
        None
    }

    fn collect_keys<'a>(&'a self, out: &mut Vec<&'a str>) {
        for node in &self.subnodes {
            out.push(node.key.as_str());
            node.collect_keys(out);
        }
    }

    fn collect_level<'a>(&'a self, level: u8, out: &mut Vec<&'a str>) {
        for node in &self.subnodes {
            if node.level == level {
                out.push(node.key.as_str());
            }
            node.collect_level(level, out);
        }
    }
}

/// Heading hierarchy of one markdown document. The tree records whatever
/// structure is present; well-formedness is the validator's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkdownTree {
    root: MarkdownNode,
}

impl MarkdownTree {
    /// Parse markdown text (without front matter) into a heading hierarchy.
    /// Heading spans come from the pulldown-cmark event stream, so headings
    /// inside fenced code blocks are not misread as structure.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut headings: Vec<(u8, String, Range<usize>)> = Vec::new();
        let mut current: Option<(u8, String, Range<usize>)> = None;
        for (event, range) in Parser::new(text).into_offset_iter() {
            match event {
                Event::Start(Tag::Heading { level, .. }) => {
                    current = Some((level as u8, String::new(), range));
                }
                Event::End(TagEnd::Heading(_)) => {
                    if let Some(heading) = current.take() {
                        headings.push(heading);
                    }
                }
                Event::Text(piece) | Event::Code(piece) => {
                    if let Some((_, key, _)) = &mut current {
                        key.push_str(&piece);
                    }
                }
                _ => {}
            }
        }

        let preamble_end = headings.first().map_or(text.len(), |(_, _, span)| span.start);
        let mut root = MarkdownNode {
            key: String::new(),
            level: 0,
            content: text[..preamble_end].trim().to_string(),
            subnodes: Vec::new(),
        };

        let mut stack: Vec<MarkdownNode> = Vec::new();
        for (index, (level, key, span)) in headings.iter().enumerate() {
            let content_end = headings.get(index + 1).map_or(text.len(), |(_, _, next)| next.start);
            let node = MarkdownNode {
                key: key.clone(),
                level: *level,
                content: text[span.end.min(content_end)..content_end].trim().to_string(),
                subnodes: Vec::new(),
            };
            while stack.last().is_some_and(|top| top.level >= node.level) {
                attach_top(&mut stack, &mut root);
            }
            stack.push(node);
        }
        while !stack.is_empty() {
            attach_top(&mut stack, &mut root);
        }

        Self { root }
    }

    /// Top-level headings in document order.
    #[must_use]
    pub fn nodes(&self) -> &[MarkdownNode] {
        &self.root.subnodes
    }

    /// Content appearing before the first heading.
    #[must_use]
    pub fn preamble(&self) -> &str {
        &self.root.content
    }

    /// First node (document order) whose heading matches `key`; non-exact
    /// matching accepts any heading containing `key`.
    #[must_use]
    pub fn node_for_key(&self, key: &str, exact: bool) -> Option<&MarkdownNode> {
        self.root.find(key, exact)
    }

    /// Every heading key, document order.
    #[must_use]
    pub fn heading_keys(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.root.collect_keys(&mut out);
        out
    }

    /// Headings at one markdown heading level, document order.
    #[must_use]
    pub fn headers_for_level(&self, level: u8) -> Vec<&str> {
        let mut out = Vec::new();
        self.root.collect_level(level, &mut out);
        out
    }
}

fn attach_top(stack: &mut Vec<MarkdownNode>, root: &mut MarkdownNode) {
    if let Some(node) = stack.pop() {
        match stack.last_mut() {
            Some(parent) => parent.subnodes.push(node),
            None => root.subnodes.push(node),
        }
    }
}

// ---------------------------------------------------------------------------
// Template validator
// ---------------------------------------------------------------------------

/// Decides whether a heading denotes a substitution slot. Injected so the
/// placeholder syntax is not hard-wired into the matching algorithm.
pub trait PlaceholderMatcher {
    fn is_placeholder(&self, text: &str) -> bool;
}

/// Regex-backed placeholder detection; the stock implementation.
#[derive(Debug)]
pub struct RegexPlaceholder {
    pattern: Regex,
}

impl RegexPlaceholder {
    /// # Errors
    /// Returns [`MarkdownError::PlaceholderPattern`] when the pattern does
    /// not compile.
    pub fn new(pattern: &str) -> Result<Self, MarkdownError> {
        let pattern = Regex::new(pattern)
            .map_err(|err| MarkdownError::PlaceholderPattern(err.to_string()))?;
        Ok(Self { pattern })
    }
}

impl PlaceholderMatcher for RegexPlaceholder {
    fn is_placeholder(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPass {
    TemplateVersion,
    HeaderKeys,
    GovernedSection,
    BodyHeadings,
}

impl ValidationPass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TemplateVersion => "template_version",
            Self::HeaderKeys => "header_keys",
            Self::GovernedSection => "governed_section",
            Self::BodyHeadings => "body_headings",
        }
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct PassResult {
    pub pass: ValidationPass,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PassResult {
    fn ok(pass: ValidationPass) -> Self {
        Self { pass, passed: true, reason: None }
    }

    fn fail(pass: ValidationPass, reason: String) -> Self {
        Self { pass, passed: false, reason: Some(reason) }
    }
}

/// Outcome of validating one instance: the overall verdict plus every pass
/// that ran, with a reason on each failure. Non-conformance is data, not an
/// error, so callers can evaluate many instances and keep walking.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ValidationReport {
    pub valid: bool,
    pub passes: Vec<PassResult>,
}

impl ValidationReport {
    fn finish(passes: Vec<PassResult>) -> Self {
        let valid = passes.iter().all(|result| result.passed);
        Self { valid, passes }
    }

    /// A report for an instance that could not even be parsed: one failed
    /// pass carrying the reason. Lets walk drivers record the failure and
    /// keep going instead of aborting.
    #[must_use]
    pub fn rejected(pass: ValidationPass, reason: String) -> Self {
        Self { valid: false, passes: vec![PassResult::fail(pass, reason)] }
    }
}

#[derive(Debug, Clone)]
pub struct ValidatorOptions {
    pub validate_header: bool,
    pub validate_body: bool,
    pub governed_heading: Option<String>,
    pub require_template_version: bool,
    pub placeholder_pattern: String,
}

impl Default for ValidatorOptions {
    fn default() -> Self {
        Self {
            validate_header: true,
            validate_body: true,
            governed_heading: None,
            require_template_version: false,
            placeholder_pattern: DEFAULT_PLACEHOLDER_PATTERN.to_string(),
        }
    }
}

/// Compares instance markdown (header dict + tree) against a template's.
/// Templates define a required ordered skeleton; instances may add headings
/// but never delete, reorder, or rename a required one.
pub struct TemplateValidator {
    template_header: HeaderDict,
    template_tree: MarkdownTree,
    options: ValidatorOptions,
    matcher: Box<dyn PlaceholderMatcher>,
}

impl TemplateValidator {
    /// # Errors
    /// Returns [`MarkdownError::PlaceholderPattern`] when the configured
    /// placeholder pattern does not compile.
    pub fn new(
        template_header: HeaderDict,
        template_tree: MarkdownTree,
        options: ValidatorOptions,
    ) -> Result<Self, MarkdownError> {
        let matcher: Box<dyn PlaceholderMatcher> =
            Box::new(RegexPlaceholder::new(&options.placeholder_pattern)?);
        Ok(Self { template_header, template_tree, options, matcher })
    }

    /// Swap in a custom placeholder matcher.
    #[must_use]
    pub fn with_matcher(mut self, matcher: Box<dyn PlaceholderMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// Run the configured validation passes against one instance.
    /// `instance_name` is the instance's identity (typically its path) and
    /// participates in template-version checking.
    ///
    /// # Errors
    /// Returns [`MarkdownError::MalformedTemplate`] when the template itself
    /// lacks structure the configuration demands (e.g. the governed heading).
    pub fn validate(
        &self,
        instance_name: &str,
        instance_header: &HeaderDict,
        instance_tree: &MarkdownTree,
    ) -> Result<ValidationReport, MarkdownError> {
        let mut passes = Vec::new();

        if self.options.validate_header {
            if self.options.require_template_version {
                // Version checking is terminal either way and never falls
                // through to the generic key comparison.
                passes.push(self.template_version_pass(instance_name));
                return Ok(ValidationReport::finish(passes));
            }
            let header = self.header_keys_pass(instance_name, instance_header);
            let header_ok = header.passed;
            passes.push(header);
            if !header_ok {
                return Ok(ValidationReport::finish(passes));
            }
            if !self.options.validate_body {
                // A matching header is a full accept when body validation is
                // off; the governed check does not run on this path.
                return Ok(ValidationReport::finish(passes));
            }
        }

        if let Some(governed_heading) = &self.options.governed_heading {
            let result =
                self.governed_section_pass(instance_name, governed_heading, instance_tree)?;
            let governed_ok = result.passed;
            passes.push(result);
            if !governed_ok {
                return Ok(ValidationReport::finish(passes));
            }
        }

        if self.options.validate_body {
            passes.push(self.body_headings_pass(instance_name, instance_tree));
        }

        Ok(ValidationReport::finish(passes))
    }

    fn template_version_pass(&self, instance_name: &str) -> PassResult {
        let Some(template_version) = self.template_header.get_str(TEMPLATE_VERSION_KEY) else {
            return PassResult::fail(
                ValidationPass::TemplateVersion,
                format!("template header does not declare {TEMPLATE_VERSION_KEY}"),
            );
        };
        if !instance_name.contains(template_version) {
            return PassResult::fail(
                ValidationPass::TemplateVersion,
                format!("instance {instance_name} does not carry template version {template_version}"),
            );
        }
        match self.template_header.get_str(VERSION_KEY) {
            Some(version) if version == template_version => {
                PassResult::ok(ValidationPass::TemplateVersion)
            }
            Some(version) => PassResult::fail(
                ValidationPass::TemplateVersion,
                format!("template {VERSION_KEY} {version} disagrees with {template_version}"),
            ),
            None => PassResult::fail(
                ValidationPass::TemplateVersion,
                format!("template header has no {VERSION_KEY} field"),
            ),
        }
    }

    fn header_keys_pass(&self, instance_name: &str, instance_header: &HeaderDict) -> PassResult {
        if compare_keys(&self.template_header, instance_header) {
            PassResult::ok(ValidationPass::HeaderKeys)
        } else {
            PassResult::fail(
                ValidationPass::HeaderKeys,
                format!("YAML header key structure mismatch in instance {instance_name}"),
            )
        }
    }

    fn governed_section_pass(
        &self,
        instance_name: &str,
        governed_heading: &str,
        instance_tree: &MarkdownTree,
    ) -> Result<PassResult, MarkdownError> {
        let template_node =
            self.template_tree.node_for_key(governed_heading, false).ok_or_else(|| {
                MarkdownError::MalformedTemplate(format!(
                    "governed heading not present in template: {governed_heading}"
                ))
            })?;
        let Some(instance_node) = instance_tree.node_for_key(governed_heading, false) else {
            return Ok(PassResult::fail(
                ValidationPass::GovernedSection,
                format!("governed heading not found in instance {instance_name}"),
            ));
        };
        let template_keys: Vec<String> =
            template_node.governed_entries().into_iter().map(|entry| entry.key).collect();
        let instance_keys: Vec<String> =
            instance_node.governed_entries().into_iter().map(|entry| entry.key).collect();
        Ok(match ordered_key_match(&template_keys, &instance_keys, self.matcher.as_ref()) {
            Ok(()) => PassResult::ok(ValidationPass::GovernedSection),
            Err(reason) => PassResult::fail(
                ValidationPass::GovernedSection,
                format!("{reason} in governed section of instance {instance_name}"),
            ),
        })
    }

    fn body_headings_pass(&self, instance_name: &str, instance_tree: &MarkdownTree) -> PassResult {
        if self.options.require_template_version {
            let Some(template_version) = self.template_header.get_str(TEMPLATE_VERSION_KEY) else {
                return PassResult::fail(
                    ValidationPass::BodyHeadings,
                    format!("template header does not declare {TEMPLATE_VERSION_KEY}"),
                );
            };
            if !instance_name.contains(template_version) {
                return PassResult::fail(
                    ValidationPass::BodyHeadings,
                    format!(
                        "instance {instance_name} does not carry template version {template_version}"
                    ),
                );
            }
        }

        let template_keys = self.template_tree.heading_keys();
        let instance_keys = instance_tree.heading_keys();
        if template_keys.len() > instance_keys.len() {
            return PassResult::fail(
                ValidationPass::BodyHeadings,
                format!("headings were removed from instance {instance_name}"),
            );
        }
        let template_level1 = self.template_tree.headers_for_level(1);
        let instance_level1 = instance_tree.headers_for_level(1);
        if template_level1.len() < instance_level1.len() {
            return PassResult::fail(
                ValidationPass::BodyHeadings,
                format!("new level-1 headings were added to instance {instance_name}"),
            );
        }

        match ordered_key_match(&template_keys, &instance_keys, self.matcher.as_ref()) {
            Ok(()) => PassResult::ok(ValidationPass::BodyHeadings),
            Err(reason) => PassResult::fail(
                ValidationPass::BodyHeadings,
                format!("{reason} in instance {instance_name}"),
            ),
        }
    }
}

/// Placeholder-tolerant ordered subsequence match: walk the instance keys
/// with a pointer into the template. A key equal to the template slot
/// advances the pointer; a template-known key out of position is a
/// reorder/modification; a placeholder slot is satisfied by position and the
/// key is re-examined against the next slot; anything else is tolerated
/// extra content. Success requires the pointer to reach the template's end.
fn ordered_key_match<T: AsRef<str>>(
    template: &[T],
    instance: &[T],
    matcher: &dyn PlaceholderMatcher,
) -> Result<(), String> {
    let mut pointer = 0;
    for key in instance {
        let key = key.as_ref();
        while pointer < template.len()
            && template[pointer].as_ref() != key
            && matcher.is_placeholder(template[pointer].as_ref())
        {
            pointer += 1;
        }
        if pointer >= template.len() {
            break;
        }
        if key == template[pointer].as_ref() {
            pointer += 1;
            continue;
        }
        if template.iter().any(|candidate| candidate.as_ref() == key) {
            return Err(format!("headings were shuffled or modified near: {key}"));
        }
    }
    while pointer < template.len() && matcher.is_placeholder(template[pointer].as_ref()) {
        pointer += 1;
    }
    if pointer != template.len() {
        return Err("required headings are missing".to_string());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Control emitter / reader
// ---------------------------------------------------------------------------

/// Render one control (with its resolved parameters) as a markdown document
/// with a YAML front-matter header. Prose is emitted verbatim, so parameter
/// moustaches survive a round trip; resolved values travel in the header
/// under [`PARAMS_HEADER_KEY`].
///
/// # Errors
/// Returns [`MarkdownError::FrontMatter`] if the merged header fails to
/// serialize.
pub fn write_control_markdown(
    control: &Control,
    resolved_params: &[Parameter],
    yaml_header: &HeaderDict,
    group_title: Option<&str>,
) -> Result<String, MarkdownError> {
    let mut header = yaml_header.clone();
    if let Some(title) = group_title {
        header.insert(
            GROUP_TITLE_HEADER_KEY,
            HeaderValue::Leaf(serde_yaml::Value::String(title.to_string())),
        );
    }
    if !resolved_params.is_empty() {
        let mut params = HeaderDict::new();
        for param in resolved_params {
            params.insert(
                &param.id,
                HeaderValue::Leaf(serde_yaml::Value::String(param_to_str(
                    param,
                    VALUE_SEPARATOR,
                ))),
            );
        }
        header.insert(PARAMS_HEADER_KEY, HeaderValue::Mapping(params));
    }

    let mut out = render_front_matter(&header)?;
    out.push_str(&format!("# {} - {}\n", control.id, control.title));
    for part in &control.parts {
        out.push('\n');
        out.push_str(&format!("## {}\n", part_heading(&part.name)));
        if let Some(prose) = part.prose.as_deref().filter(|prose| !prose.is_empty()) {
            out.push('\n');
            out.push_str(prose);
            out.push('\n');
        }
        if !part.parts.is_empty() {
            out.push('\n');
            write_items(&part.parts, 0, &mut out);
        }
    }
    Ok(out)
}

fn part_heading(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => {
            format!("{PART_HEADING_PREFIX}{}{}", first.to_uppercase(), chars.as_str())
        }
        None => PART_HEADING_PREFIX.trim_end().to_string(),
    }
}

fn write_items(items: &[Part], depth: usize, out: &mut String) {
    for item in items {
        let indent = "  ".repeat(depth);
        let label = item.label().map_or_else(|| item.id.clone(), ToString::to_string);
        let prose = item.prose.as_deref().unwrap_or("");
        out.push_str(&format!("{indent}- [{label}] {prose}\n"));
        write_items(&item.parts, depth + 1, out);
    }
}

/// Parse an edited control markdown document back into its header dict and
/// control fragment. Part ids are reconstructed from the control id, the
/// section name, and item labels; parameters come from the header.
///
/// # Errors
/// Returns [`MarkdownError::Malformed`] when the document has no
/// `# <id> - <title>` heading or an item line cannot be parsed.
pub fn read_control_markdown(text: &str) -> Result<(HeaderDict, Control), MarkdownError> {
    let (header, body) = split_front_matter(text)?;
    let tree = MarkdownTree::parse(body);
    let title_node = tree
        .nodes()
        .iter()
        .find(|node| node.level == 1)
        .ok_or_else(|| MarkdownError::Malformed("control markdown has no level-1 heading".to_string()))?;
    let (control_id, title) = title_node.key.split_once(" - ").ok_or_else(|| {
        MarkdownError::Malformed(format!(
            "control heading is not `<id> - <title>`: {}",
            title_node.key
        ))
    })?;
    let control_id = control_id.trim();

    let mut parts = Vec::new();
    for section in &title_node.subnodes {
        parts.push(read_part(control_id, section)?);
    }

    let control = Control {
        id: control_id.to_string(),
        title: title.trim().to_string(),
        params: read_header_params(&header),
        parts,
        props: Vec::new(),
    };
    Ok((header, control))
}

/// Parameters carried in the header under [`PARAMS_HEADER_KEY`], in header
/// order; each value becomes the parameter's single value.
#[must_use]
pub fn read_header_params(header: &HeaderDict) -> Vec<Parameter> {
    let Some(HeaderValue::Mapping(params)) = header.get(PARAMS_HEADER_KEY) else {
        return Vec::new();
    };
    params
        .entries()
        .iter()
        .map(|(id, value)| Parameter {
            id: id.clone(),
            label: None,
            values: match value {
                HeaderValue::Leaf(leaf) => leaf_to_string(leaf).map_or_else(Vec::new, |v| vec![v]),
                HeaderValue::Mapping(_) => Vec::new(),
            },
            choices: Vec::new(),
        })
        .collect()
}

fn leaf_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(text) => Some(text.clone()),
        serde_yaml::Value::Bool(flag) => Some(flag.to_string()),
        serde_yaml::Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn part_id_suffix(name: &str) -> &str {
    match name {
        "statement" => "smt",
        "guidance" => "gdn",
        "objective" => "obj",
        other => other,
    }
}

fn read_part(control_id: &str, node: &MarkdownNode) -> Result<Part, MarkdownError> {
    let name = node
        .key
        .strip_prefix(PART_HEADING_PREFIX)
        .unwrap_or(&node.key)
        .trim()
        .to_lowercase();
    let id = format!("{control_id}_{}", part_id_suffix(&name));
    let (prose, items) = read_section_body(&id, &node.content)?;
    Ok(Part { id, name, prose, parts: items, props: Vec::new() })
}

fn parse_item_line(line: &str) -> Option<(usize, &str, &str)> {
    let trimmed = line.trim_start_matches(' ');
    let indent = line.len() - trimmed.len();
    let rest = trimmed.strip_prefix("- [")?;
    let (label, prose) = rest.split_once(']')?;
    Some((indent / 2, label, prose.trim_start()))
}

fn read_section_body(
    section_id: &str,
    content: &str,
) -> Result<(Option<String>, Vec<Part>), MarkdownError> {
    let mut prose_lines: Vec<&str> = Vec::new();
    let mut roots: Vec<Part> = Vec::new();
    let mut stack: Vec<(usize, Part)> = Vec::new();

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Some((depth, label, prose)) = parse_item_line(line) else {
            if stack.is_empty() && roots.is_empty() {
                prose_lines.push(line);
            } else if let Some((_, item)) = stack.last_mut() {
                // continuation line of the most recent item
                let mut combined = item.prose.take().unwrap_or_default();
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(line.trim());
                item.prose = Some(combined);
            }
            continue;
        };

        while stack.last().is_some_and(|(item_depth, _)| *item_depth >= depth) {
            attach_item(&mut stack, &mut roots);
        }
        let parent_id = stack
            .last()
            .map_or_else(|| section_id.to_string(), |(_, parent)| parent.id.clone());
        if depth != stack.len() {
            return Err(MarkdownError::Malformed(format!(
                "list item indented unexpectedly: {line}"
            )));
        }
        let item = Part {
            id: format!("{parent_id}.{}", label.trim_end_matches('.')),
            name: "item".to_string(),
            prose: Some(prose.to_string()),
            parts: Vec::new(),
            props: vec![Property::new(LABEL_PROPERTY, label)],
        };
        stack.push((depth, item));
    }
    while !stack.is_empty() {
        attach_item(&mut stack, &mut roots);
    }

    let prose = if prose_lines.is_empty() { None } else { Some(prose_lines.join("\n")) };
    Ok((prose, roots))
}

fn attach_item(stack: &mut Vec<(usize, Part)>, roots: &mut Vec<Part>) {
    if let Some((_, item)) = stack.pop() {
        match stack.last_mut() {
            Some((_, parent)) => parent.parts.push(item),
            None => roots.push(item),
        }
    }
}
