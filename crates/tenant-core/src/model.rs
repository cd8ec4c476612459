//! Data carried through a provisioning run.
//!
//! A caller builds a [`TenantInitializationModel`] (usually starting from
//! [`StepRegistry::provide_model`](crate::step::StepRegistry::provide_model)),
//! fills in per-step properties, and hands it to the orchestrator. Each step
//! reads and mutates only its own [`TenantStepData`]; cross-step state lives
//! in the run-scoped [`TenantInitializationContext`].

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};

use crate::error::{Result, TenantError};
use crate::step::{StepError, StepResult};

/// Identifier of the well-known step whose data carries the tenant id.
pub const TENANT_STEP: &str = "tenant";

/// Property of [`TENANT_STEP`] holding the tenant id.
pub const TENANT_ID_PROPERTY: &str = "tenantid";

// ---------------------------------------------------------------------------
// TenantInfo
// ---------------------------------------------------------------------------

/// Identity of a tenant. Built once and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantInfo {
    tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

impl TenantInfo {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            display_name: None,
            description: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

// ---------------------------------------------------------------------------
// TenantStepData
// ---------------------------------------------------------------------------

/// Written in place of a sensitive property value outside the running step.
pub const MASKED_VALUE: &str = "********";

/// Per-step property bag. Owned by exactly one step for the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantStepData {
    step_identifier: String,
    #[serde(default)]
    properties: BTreeMap<String, String>,
    #[serde(default)]
    completed_successfully: bool,
}

impl TenantStepData {
    pub fn new(step_identifier: impl Into<String>) -> Self {
        Self {
            step_identifier: step_identifier.into(),
            properties: BTreeMap::new(),
            completed_successfully: false,
        }
    }

    /// Empty data flagged as already completed.
    ///
    /// The delete lifecycle takes no caller input, so each delete step is
    /// handed this in place of the data its create counterpart produced.
    pub fn completed(step_identifier: impl Into<String>) -> Self {
        let mut data = Self::new(step_identifier);
        data.completed_successfully = true;
        data
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn step_identifier(&self) -> &str {
        &self.step_identifier
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn property_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.property(key).unwrap_or(default)
    }

    /// Like [`property`](Self::property) but fails the step when the key is
    /// missing or blank.
    pub fn require_property(&self, key: &str) -> std::result::Result<&str, StepError> {
        match self.property(key) {
            Some(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(StepError::failed(format!(
                "step '{}' requires property '{key}'",
                self.step_identifier
            ))),
        }
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn mark_completed(&mut self) {
        self.completed_successfully = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed_successfully
    }

    /// Copy with the values of `keys` replaced by [`MASKED_VALUE`].
    pub fn masked(&self, keys: &[&str]) -> Self {
        let mut copy = self.clone();
        for (key, value) in copy.properties.iter_mut() {
            if keys.contains(&key.as_str()) {
                *value = MASKED_VALUE.to_string();
            }
        }
        copy
    }
}

// ---------------------------------------------------------------------------
// TenantInitializationModel
// ---------------------------------------------------------------------------

/// Ordered per-step data for one run, indexed by step identifier.
///
/// Wire form is `{ "<step id>": { "properties": { .. } } }`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "ModelWire")]
pub struct TenantInitializationModel {
    steps: Vec<TenantStepData>,
    index: HashMap<String, usize>,
}

impl TenantInitializationModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add step data, replacing any existing entry for the same step in place.
    pub fn insert(&mut self, data: TenantStepData) {
        match self.index.get(data.step_identifier()) {
            Some(&pos) => self.steps[pos] = data,
            None => {
                self.index
                    .insert(data.step_identifier().to_string(), self.steps.len());
                self.steps.push(data);
            }
        }
    }

    pub fn get(&self, step: &str) -> Option<&TenantStepData> {
        self.index.get(step).map(|&pos| &self.steps[pos])
    }

    pub fn get_mut(&mut self, step: &str) -> Option<&mut TenantStepData> {
        match self.index.get(step) {
            Some(&pos) => Some(&mut self.steps[pos]),
            None => None,
        }
    }

    pub fn contains(&self, step: &str) -> bool {
        self.index.contains_key(step)
    }

    /// Data for `step`, or a precondition error when the model and the
    /// registry disagree.
    pub fn require(&mut self, step: &str) -> Result<&mut TenantStepData> {
        self.get_mut(step)
            .ok_or_else(|| TenantError::MissingStepData(step.to_string()))
    }

    pub fn set_property(
        &mut self,
        step: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        self.require(step)?.set_property(key, value);
        Ok(())
    }

    /// Set the tenant id on the well-known tenant step, adding the step's
    /// data when the model does not have it yet.
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        if !self.contains(TENANT_STEP) {
            self.insert(TenantStepData::new(TENANT_STEP));
        }
        if let Some(data) = self.get_mut(TENANT_STEP) {
            data.set_property(TENANT_ID_PROPERTY, tenant_id);
        }
        self
    }

    /// Tenant id carried by the well-known tenant step, if present and not blank.
    pub fn tenant_id(&self) -> Option<&str> {
        self.get(TENANT_STEP)
            .and_then(|d| d.property(TENANT_ID_PROPERTY))
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = &TenantStepData> {
        self.steps.iter()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl FromIterator<TenantStepData> for TenantInitializationModel {
    fn from_iter<I: IntoIterator<Item = TenantStepData>>(iter: I) -> Self {
        let mut model = Self::new();
        for data in iter {
            model.insert(data);
        }
        model
    }
}

#[derive(Deserialize)]
struct StepProperties {
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct ModelWire(BTreeMap<String, StepProperties>);

impl From<ModelWire> for TenantInitializationModel {
    fn from(wire: ModelWire) -> Self {
        wire.0
            .into_iter()
            .map(|(step, body)| TenantStepData {
                step_identifier: step,
                properties: body.properties,
                completed_successfully: false,
            })
            .collect()
    }
}

impl Serialize for TenantInitializationModel {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.steps.len()))?;
        for data in &self.steps {
            #[derive(Serialize)]
            struct Body<'a> {
                properties: &'a BTreeMap<String, String>,
            }
            map.serialize_entry(
                &data.step_identifier,
                &Body {
                    properties: &data.properties,
                },
            )?;
        }
        map.end()
    }
}

// ---------------------------------------------------------------------------
// TenantInitializationContext
// ---------------------------------------------------------------------------

/// Scratch space shared by the steps of a single run.
#[derive(Debug, Clone, Default)]
pub struct TenantInitializationContext {
    tenant_info: Option<TenantInfo>,
    attributes: HashMap<String, String>,
}

impl TenantInitializationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for runs against an existing tenant (update).
    pub fn for_tenant(info: TenantInfo) -> Self {
        Self {
            tenant_info: Some(info),
            attributes: HashMap::new(),
        }
    }

    pub fn tenant_info(&self) -> Option<&TenantInfo> {
        self.tenant_info.as_ref()
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_info.as_ref().map(TenantInfo::tenant_id)
    }

    /// Record the tenant identity for the rest of the run.
    ///
    /// Only one tenant per run: a second call with another id fails the step.
    pub fn set_tenant_info(&mut self, info: TenantInfo) -> StepResult {
        if let Some(existing) = &self.tenant_info {
            if existing.tenant_id() != info.tenant_id() {
                return Err(StepError::failed(format!(
                    "run is bound to tenant '{}', refusing '{}'",
                    existing.tenant_id(),
                    info.tenant_id()
                )));
            }
            return Ok(());
        }
        self.tenant_info = Some(info);
        Ok(())
    }

    pub(crate) fn into_tenant_info(self) -> Option<TenantInfo> {
        self.tenant_info
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_replaces_in_place_and_keeps_order() {
        let mut model = TenantInitializationModel::new();
        model.insert(TenantStepData::new("a"));
        model.insert(TenantStepData::new("b"));
        model.insert(TenantStepData::new("a").with_property("k", "v"));

        let ids: Vec<&str> = model.iter().map(|d| d.step_identifier()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(model.get("a").unwrap().property("k"), Some("v"));
        assert_eq!(model.len(), 2);
    }

    #[test]
    fn require_missing_step_is_precondition_error() {
        let mut model = TenantInitializationModel::new();
        let err = model.require("mail").unwrap_err();
        assert!(matches!(err, TenantError::MissingStepData(ref s) if s == "mail"));
        assert!(model.set_property("mail", "k", "v").is_err());
    }

    #[test]
    fn tenant_id_comes_from_tenant_step() {
        let model = TenantInitializationModel::new().with_tenant_id(" acme.com ");
        assert_eq!(model.tenant_id(), Some("acme.com"));

        let blank = TenantInitializationModel::new().with_tenant_id("   ");
        assert_eq!(blank.tenant_id(), None);
        assert_eq!(TenantInitializationModel::new().tenant_id(), None);
    }

    #[test]
    fn model_wire_format_round_trips_properties() {
        let json = r#"{
            "tenant": { "properties": { "tenantid": "acme.com" } },
            "mail": { "properties": { "domain": "mail.acme.com" } },
            "search": {}
        }"#;
        let model: TenantInitializationModel = serde_json::from_str(json).unwrap();
        assert_eq!(model.tenant_id(), Some("acme.com"));
        assert_eq!(
            model.get("mail").unwrap().property("domain"),
            Some("mail.acme.com")
        );
        assert!(model.get("search").unwrap().properties().is_empty());
        assert!(model.iter().all(|d| !d.is_completed()));

        let value = serde_json::to_value(&model).unwrap();
        assert_eq!(value["mail"]["properties"]["domain"], "mail.acme.com");
        assert!(value["mail"].get("completed_successfully").is_none());
    }

    #[test]
    fn require_property_rejects_blank() {
        let data = TenantStepData::new("db").with_property("schema", " ");
        let err = data.require_property("schema").unwrap_err();
        assert!(err.to_string().contains("requires property 'schema'"));
        assert_eq!(data.property_or("owner", "admin"), "admin");
    }

    #[test]
    fn masked_hides_only_listed_keys() {
        let data = TenantStepData::completed("idp")
            .with_property("adminUser", "root")
            .with_property("adminPassword", "hunter2");
        let masked = data.masked(&["adminPassword", "apiToken"]);
        assert_eq!(masked.property("adminPassword"), Some(MASKED_VALUE));
        assert_eq!(masked.property("adminUser"), Some("root"));
        assert!(masked.property("apiToken").is_none());
        assert!(masked.is_completed());
        assert_eq!(data.property("adminPassword"), Some("hunter2"));
    }

    #[test]
    fn completed_data_is_flagged() {
        let data = TenantStepData::completed("db");
        assert!(data.is_completed());
        assert!(data.properties().is_empty());
    }

    #[test]
    fn context_binds_to_a_single_tenant() {
        let mut ctx = TenantInitializationContext::new();
        assert!(ctx.tenant_info().is_none());
        ctx.set_tenant_info(TenantInfo::new("acme.com")).unwrap();
        ctx.set_tenant_info(TenantInfo::new("acme.com")).unwrap();
        assert!(ctx.set_tenant_info(TenantInfo::new("other.com")).is_err());
        assert_eq!(ctx.tenant_id(), Some("acme.com"));

        ctx.set_attribute("schema", "acme_com");
        assert_eq!(ctx.attribute("schema"), Some("acme_com"));
    }
}
