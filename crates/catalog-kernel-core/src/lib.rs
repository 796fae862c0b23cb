use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CatalogError {
    #[error("control not found in catalog: {0}")]
    ControlNotFound(String),
    #[error("corrupt catalog: {0}")]
    CorruptCatalog(String),
}

/// Property name that carries a control's lifecycle status.
pub const STATUS_PROPERTY: &str = "status";
/// Status value marking a control as withdrawn from the catalog.
pub const WITHDRAWN_STATUS: &str = "Withdrawn";
/// Property name used to tag narrative items with their display label.
pub const LABEL_PROPERTY: &str = "label";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CatalogId(pub Ulid);

impl CatalogId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CatalogId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CatalogId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Property {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
}

impl Property {
    #[must_use]
    pub fn new(name: &str, value: &str) -> Self {
        Self { name: name.to_string(), value: value.to_string(), class: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Parameter {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Part {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prose: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub props: Vec<Property>,
}

impl Part {
    /// The display label attached via a `label` property, if any.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.props
            .iter()
            .find(|prop| prop.name == LABEL_PROPERTY)
            .map(|prop| prop.value.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Control {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub props: Vec<Property>,
}

impl Control {
    /// Whether a `status: Withdrawn` property marks this control withdrawn.
    #[must_use]
    pub fn is_withdrawn(&self) -> bool {
        self.props.iter().any(|prop| {
            prop.name == STATUS_PROPERTY && prop.value.eq_ignore_ascii_case(WITHDRAWN_STATUS)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Group {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<Group>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controls: Vec<Control>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Metadata {
    pub title: String,
    pub version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Catalog {
    pub uuid: CatalogId,
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<Group>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controls: Vec<Control>,
}

/// A parameter override declared by a source profile.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SetParameter {
    pub param_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Modify {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set_parameters: Vec<SetParameter>,
}

/// The slice of a resolved profile the kernel consumes: its parameter
/// overrides. Profile import/inheritance resolution happens upstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modify: Option<Modify>,
}

/// Where a control lives in the backing catalog: the index path through the
/// nested group tree (empty for catalog-level controls) and the position in
/// that group's control sequence.
#[derive(Debug, Clone, Eq, PartialEq)]
struct ControlLocation {
    group_path: Vec<usize>,
    position: usize,
}

/// Flat lookup surface over one catalog for the duration of a single
/// generate or assemble invocation. The serialized model stays nested; the
/// index is the arena of explicit locations, and `replace_control` writes
/// through eagerly so the backing catalog never goes stale.
#[derive(Debug, Clone)]
pub struct CatalogIndex {
    catalog: Catalog,
    locations: HashMap<String, ControlLocation>,
}

/// One control paired with the id path of its owning groups, in the order
/// markdown generation walks the catalog.
#[derive(Debug, Clone)]
pub struct ControlRef<'a> {
    pub group_path: Vec<&'a str>,
    pub group_title: Option<&'a str>,
    pub control: &'a Control,
}

/// Restartable pre-order traversal over the group tree, parents first.
#[derive(Debug)]
pub struct GroupIter<'a> {
    stack: Vec<&'a Group>,
}

impl<'a> Iterator for GroupIter<'a> {
    type Item = &'a Group;

    fn next(&mut self) -> Option<&'a Group> {
        let group = self.stack.pop()?;
        for child in group.groups.iter().rev() {
            self.stack.push(child);
        }
        Some(group)
    }
}

impl CatalogIndex {
    /// Index a catalog for lookup and in-place mutation.
    ///
    /// # Errors
    /// Returns [`CatalogError::CorruptCatalog`] when two controls share an
    /// id; a duplicate id means the catalog cannot be addressed reliably.
    pub fn new(catalog: Catalog) -> Result<Self, CatalogError> {
        let locations = Self::build_locations(&catalog)?;
        Ok(Self { catalog, locations })
    }

    fn build_locations(catalog: &Catalog) -> Result<HashMap<String, ControlLocation>, CatalogError> {
        let mut locations = HashMap::new();
        Self::index_controls(&catalog.controls, &[], &mut locations)?;
        let mut path = Vec::new();
        Self::index_groups(&catalog.groups, &mut path, &mut locations)?;
        Ok(locations)
    }

    fn index_groups(
        groups: &[Group],
        path: &mut Vec<usize>,
        locations: &mut HashMap<String, ControlLocation>,
    ) -> Result<(), CatalogError> {
        for (index, group) in groups.iter().enumerate() {
            path.push(index);
            Self::index_controls(&group.controls, path, locations)?;
            Self::index_groups(&group.groups, path, locations)?;
            path.pop();
        }
        Ok(())
    }

    fn index_controls(
        controls: &[Control],
        path: &[usize],
        locations: &mut HashMap<String, ControlLocation>,
    ) -> Result<(), CatalogError> {
        for (position, control) in controls.iter().enumerate() {
            let location = ControlLocation { group_path: path.to_vec(), position };
            if locations.insert(control.id.clone(), location).is_some() {
                return Err(CatalogError::CorruptCatalog(format!(
                    "duplicate control id: {}",
                    control.id
                )));
            }
        }
        Ok(())
    }

    fn controls_slot<'a>(catalog: &'a Catalog, path: &[usize]) -> Option<&'a Vec<Control>> {
        let Some((first, rest)) = path.split_first() else {
            return Some(&catalog.controls);
        };
        let mut group = catalog.groups.get(*first)?;
        for index in rest {
            group = group.groups.get(*index)?;
        }
        Some(&group.controls)
    }

    fn controls_slot_mut<'a>(
        catalog: &'a mut Catalog,
        path: &[usize],
    ) -> Option<&'a mut Vec<Control>> {
        let Some((first, rest)) = path.split_first() else {
            return Some(&mut catalog.controls);
        };
        let mut group = catalog.groups.get_mut(*first)?;
        for index in rest {
            group = group.groups.get_mut(*index)?;
        }
        Some(&mut group.controls)
    }

    /// Look up a control by id.
    ///
    /// # Errors
    /// Returns [`CatalogError::ControlNotFound`] for an unknown id, or
    /// [`CatalogError::CorruptCatalog`] if the index disagrees with the
    /// backing catalog.
    pub fn control(&self, id: &str) -> Result<&Control, CatalogError> {
        let location = self
            .locations
            .get(id)
            .ok_or_else(|| CatalogError::ControlNotFound(id.to_string()))?;
        Self::controls_slot(&self.catalog, &location.group_path)
            .and_then(|controls| controls.get(location.position))
            .ok_or_else(|| {
                CatalogError::CorruptCatalog(format!("stale index entry for control: {id}"))
            })
    }

    /// Replace a control in place, preserving its position in the owning
    /// group's ordering. The backing catalog is updated eagerly.
    ///
    /// # Errors
    /// Returns [`CatalogError::ControlNotFound`] when the control's id is
    /// not already present in the index.
    pub fn replace_control(&mut self, control: Control) -> Result<(), CatalogError> {
        let location = self
            .locations
            .get(&control.id)
            .ok_or_else(|| CatalogError::ControlNotFound(control.id.clone()))?
            .clone();
        let slot = Self::controls_slot_mut(&mut self.catalog, &location.group_path)
            .and_then(|controls| controls.get_mut(location.position))
            .ok_or_else(|| {
                CatalogError::CorruptCatalog(format!("stale index entry for control: {}", control.id))
            })?;
        *slot = control;
        Ok(())
    }

    /// Count all controls transitively under all groups plus catalog-level
    /// controls, optionally excluding withdrawn ones.
    #[must_use]
    pub fn control_count(&self, include_withdrawn: bool) -> usize {
        self.controls()
            .iter()
            .filter(|entry| include_withdrawn || !entry.control.is_withdrawn())
            .count()
    }

    /// Remove every withdrawn control from its owning sequence. Idempotent.
    ///
    /// # Errors
    /// Returns [`CatalogError::CorruptCatalog`] if the index rebuild finds a
    /// duplicate id, which cannot happen for a catalog this index accepted.
    pub fn delete_withdrawn_controls(&mut self) -> Result<(), CatalogError> {
        self.catalog.controls.retain(|control| !control.is_withdrawn());
        strip_withdrawn(&mut self.catalog.groups);
        self.locations = Self::build_locations(&self.catalog)?;
        Ok(())
    }

    /// Pre-order traversal over the group tree, parents before children.
    #[must_use]
    pub fn groups(&self) -> GroupIter<'_> {
        GroupIter { stack: self.catalog.groups.iter().rev().collect() }
    }

    /// Every control with its group id path: catalog-level controls first,
    /// then the group tree in pre-order.
    #[must_use]
    pub fn controls(&self) -> Vec<ControlRef<'_>> {
        let mut out = Vec::new();
        for control in &self.catalog.controls {
            out.push(ControlRef { group_path: Vec::new(), group_title: None, control });
        }
        let mut path: Vec<&str> = Vec::new();
        collect_group_controls(&self.catalog.groups, &mut path, &mut out);
        out
    }

    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    #[must_use]
    pub fn into_catalog(self) -> Catalog {
        self.catalog
    }

    /// Reconcile an original control with an edited revision.
    ///
    /// The edited markdown is authoritative for narrative content: incoming's
    /// title and parts replace base's wholesale. Parameters are matched by
    /// id: base's ordering is kept for parameters present in both, values are
    /// overwritten only when `replace_params` is set, parameters absent from
    /// incoming are dropped regardless, and parameters new in incoming are
    /// appended. Properties are never altered by merge.
    pub fn merge_controls(base: &mut Control, incoming: &Control, replace_params: bool) {
        base.title = incoming.title.clone();
        base.parts = incoming.parts.clone();

        let mut merged = Vec::with_capacity(incoming.params.len());
        for param in &base.params {
            if let Some(edited) = incoming.params.iter().find(|p| p.id == param.id) {
                let mut kept = param.clone();
                if replace_params {
                    kept.values = edited.values.clone();
                }
                merged.push(kept);
            }
        }
        for edited in &incoming.params {
            if !base.params.iter().any(|p| p.id == edited.id) {
                merged.push(edited.clone());
            }
        }
        base.params = merged;
    }
}

fn strip_withdrawn(groups: &mut [Group]) {
    for group in groups {
        group.controls.retain(|control| !control.is_withdrawn());
        strip_withdrawn(&mut group.groups);
    }
}

fn collect_group_controls<'a>(
    groups: &'a [Group],
    path: &mut Vec<&'a str>,
    out: &mut Vec<ControlRef<'a>>,
) {
    for group in groups {
        path.push(group.id.as_str());
        for control in &group.controls {
            out.push(ControlRef {
                group_path: path.clone(),
                group_title: Some(group.title.as_str()),
                control,
            });
        }
        collect_group_controls(&group.groups, path, out);
        path.pop();
    }
}

/// Collect every parameter override declared by the profile, keyed by
/// parameter id; later declarations for the same id win.
#[must_use]
pub fn full_profile_param_dict(profile: &Profile) -> HashMap<String, SetParameter> {
    let mut dict = HashMap::new();
    if let Some(modify) = &profile.modify {
        for setting in &modify.set_parameters {
            dict.insert(setting.param_id.clone(), setting.clone());
        }
    }
    dict
}

/// Resolve a control's parameters against the profile's overrides, keeping
/// the control's declared ordering. An override contributes its values,
/// choices, and label; a parameter without an override passes through
/// unchanged.
#[must_use]
pub fn control_param_dict(
    control: &Control,
    full_dict: &HashMap<String, SetParameter>,
) -> Vec<Parameter> {
    control
        .params
        .iter()
        .map(|param| match full_dict.get(&param.id) {
            Some(setting) => Parameter {
                id: param.id.clone(),
                label: setting.label.clone().or_else(|| param.label.clone()),
                values: setting.values.clone(),
                choices: if setting.choices.is_empty() {
                    param.choices.clone()
                } else {
                    setting.choices.clone()
                },
            },
            None => param.clone(),
        })
        .collect()
}

/// Display a parameter through the cascading fallback policy: explicit
/// values joined by `value_separator`, else the label, else the choice set,
/// else the literal parameter id. The order is a hard contract.
#[must_use]
pub fn param_to_str(param: &Parameter, value_separator: &str) -> String {
    if !param.values.is_empty() {
        return param.values.join(value_separator);
    }
    if let Some(label) = &param.label {
        if !label.is_empty() {
            return label.clone();
        }
    }
    if !param.choices.is_empty() {
        return format!("[{}]", param.choices.join(value_separator));
    }
    param.id.clone()
}
