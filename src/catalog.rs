// 📚 Layer Catalog - layers as data
// The seven scenario cache layers and the 26 discovery fields they own.
// A catalog can also be loaded from JSON so the layer mapping is explicit,
// versioned configuration rather than something inferred at runtime.

use crate::error::CacheError;
use crate::layers::{ComputeFn, FieldValues, LayerDefinition, LayerRegistry};
use crate::source::Entity;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

pub const CATALOG_VERSION: &str = "scenario-layers-v1";

// ============================================================================
// SPEC TYPES
// ============================================================================

/// Where one produced field comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRule {
    /// Produced field name
    pub field: String,

    /// Source column (tier-2 header)
    pub column: String,

    /// Keep at most this many characters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncate: Option<usize>,

    /// Blank values are skipped instead of failing the entity
    #[serde(default)]
    pub optional: bool,

    /// Parse the column as JSON and extract this dotted path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path: Option<String>,
}

impl ColumnRule {
    pub fn new(field: impl Into<String>, column: impl Into<String>) -> Self {
        ColumnRule {
            field: field.into(),
            column: column.into(),
            truncate: None,
            optional: false,
            json_path: None,
        }
    }

    /// Builder: truncate to `max` characters
    pub fn truncated(mut self, max: usize) -> Self {
        self.truncate = Some(max);
        self
    }

    /// Builder: mark as optional
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Builder: extract from JSON
    pub fn json(mut self, path: impl Into<String>) -> Self {
        self.json_path = Some(path.into());
        self
    }
}

/// Declarative description of a column-extraction layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub id: String,

    /// Lower runs (and merges) first
    pub priority: u32,

    #[serde(default)]
    pub description: String,

    pub columns: Vec<ColumnRule>,
}

impl LayerSpec {
    pub fn new(id: impl Into<String>, priority: u32, description: impl Into<String>) -> Self {
        LayerSpec {
            id: id.into(),
            priority,
            description: description.into(),
            columns: Vec::new(),
        }
    }

    /// Builder: add a column rule
    pub fn column(mut self, rule: ColumnRule) -> Self {
        self.columns.push(rule);
        self
    }

    /// Build the runtime layer definition
    pub fn to_definition(&self) -> LayerDefinition {
        let mut definition = LayerDefinition::new(self.id.clone(), ColumnExtractor::new(self))
            .with_description(self.description.clone());

        // a column is required when any non-optional rule reads it
        let required: BTreeSet<&String> = self
            .columns
            .iter()
            .filter(|r| !r.optional)
            .map(|r| &r.column)
            .collect();

        for rule in &self.columns {
            definition = definition.produces(rule.field.clone());
            definition = if required.contains(&rule.column) {
                definition.requires(rule.column.clone())
            } else {
                definition.reads(rule.column.clone())
            };
        }

        definition
    }
}

// ============================================================================
// COLUMN EXTRACTOR (compute function built from a LayerSpec)
// ============================================================================

#[derive(Debug, Clone)]
pub struct ColumnExtractor {
    rules: Vec<ColumnRule>,
}

impl ColumnExtractor {
    pub fn new(spec: &LayerSpec) -> Self {
        ColumnExtractor {
            rules: spec.columns.clone(),
        }
    }
}

impl ComputeFn for ColumnExtractor {
    fn compute(&self, entity: &Entity) -> Result<FieldValues, String> {
        let mut values = FieldValues::new();
        let mut parsed: HashMap<&str, Value> = HashMap::new();

        for rule in &self.rules {
            let raw = entity.field(&rule.column).unwrap_or("").trim();
            if raw.is_empty() {
                // required columns were checked before compute
                continue;
            }

            let value = match &rule.json_path {
                None => Value::String(truncate_chars(raw, rule.truncate)),
                Some(path) => {
                    if !parsed.contains_key(rule.column.as_str()) {
                        let json: Value = serde_json::from_str(raw).map_err(|e| {
                            format!("column {} is not valid JSON: {}", rule.column, e)
                        })?;
                        parsed.insert(rule.column.as_str(), json);
                    }
                    let Some(json) = parsed.get(rule.column.as_str()) else {
                        continue;
                    };
                    match extract_path(json, path) {
                        None | Some(Value::Null) => continue,
                        Some(Value::String(s)) => Value::String(truncate_chars(s, rule.truncate)),
                        Some(v @ (Value::Number(_) | Value::Bool(_))) => v.clone(),
                        Some(_) => {
                            return Err(format!(
                                "{}.{} is not a scalar value",
                                rule.column, path
                            ))
                        }
                    }
                }
            };

            values.insert(rule.field.clone(), value);
        }

        Ok(values)
    }
}

/// Follow a dotted path ("bp.sys") through JSON objects
pub fn extract_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|p| !p.is_empty())
        .try_fold(value, |current, part| current.get(part))
}

/// Character-safe truncation
pub fn truncate_chars(value: &str, max: Option<usize>) -> String {
    match max {
        Some(max) => value.chars().take(max).collect(),
        None => value.to_string(),
    }
}

// ============================================================================
// STANDARD SCENARIO CATALOG
// ============================================================================

/// The seven standard cache layers, in priority order
pub fn standard_specs() -> Vec<LayerSpec> {
    vec![
        LayerSpec::new("basic", 1, "Case identity and pathway")
            .column(ColumnRule::new("case_id", "Case_Organization_Case_ID"))
            .column(ColumnRule::new("spark_title", "Case_Organization_Spark_Title"))
            .column(ColumnRule::new("pathway", "Case_Organization_Pathway_or_Course_Name")),
        LayerSpec::new("learning", 2, "Learning context and objectives")
            .column(
                ColumnRule::new("pre_sim_overview", "Case_Organization_Pre_Sim_Overview")
                    .truncated(300),
            )
            .column(
                ColumnRule::new("post_sim_overview", "Case_Organization_Post_Sim_Overview")
                    .truncated(300),
            )
            .column(
                ColumnRule::new(
                    "learning_outcomes",
                    "CME_and_Educational_Content_CME_Learning_Objective",
                )
                .optional(),
            )
            .column(
                ColumnRule::new("learning_objectives", "Set_the_Stage_Context_Educational_Goal")
                    .optional(),
            ),
        LayerSpec::new("metadata", 3, "Category, difficulty and setting")
            .column(ColumnRule::new("category", "Case_Organization_Medical_Category"))
            .column(ColumnRule::new("difficulty", "Case_Organization_Difficulty_Level"))
            .column(ColumnRule::new("setting", "Set_the_Stage_Context_Environment_Type"))
            .column(ColumnRule::new(
                "chief_complaint",
                "Patient_Demographics_and_Clinical_Data_Presenting_Complaint",
            )),
        LayerSpec::new("demographics", 4, "Patient demographics")
            .column(ColumnRule::new("age", "Patient_Demographics_and_Clinical_Data_Age"))
            .column(ColumnRule::new("gender", "Patient_Demographics_and_Clinical_Data_Gender"))
            .column(
                ColumnRule::new(
                    "patient_name",
                    "Patient_Demographics_and_Clinical_Data_Patient_Name",
                )
                .optional(),
            ),
        LayerSpec::new("vitals", 5, "Initial vital signs from the monitor JSON")
            .column(ColumnRule::new("initial_hr", VITALS_COLUMN).json("hr"))
            .column(ColumnRule::new("initial_bp_sys", VITALS_COLUMN).json("bp.sys"))
            .column(ColumnRule::new("initial_bp_dia", VITALS_COLUMN).json("bp.dia"))
            .column(ColumnRule::new("initial_rr", VITALS_COLUMN).json("rr"))
            .column(ColumnRule::new("initial_spo2", VITALS_COLUMN).json("spo2")),
        LayerSpec::new("clinical", 6, "Exam findings and history")
            .column(
                ColumnRule::new(
                    "exam_findings",
                    "Patient_Demographics_and_Clinical_Data_Exam_Positive_Findings",
                )
                .truncated(200),
            )
            .column(
                ColumnRule::new(
                    "medications",
                    "Patient_Demographics_and_Clinical_Data_Current_Medications",
                )
                .truncated(150)
                .optional(),
            )
            .column(
                ColumnRule::new(
                    "past_medical_history",
                    "Patient_Demographics_and_Clinical_Data_Past_Medical_History",
                )
                .truncated(200)
                .optional(),
            )
            .column(
                ColumnRule::new("allergies", "Patient_Demographics_and_Clinical_Data_Allergies")
                    .optional(),
            ),
        LayerSpec::new("environment", 7, "Environment, disposition and vignette")
            .column(ColumnRule::new(
                "environment_type",
                "Set_the_Stage_Context_Environment_Type",
            ))
            .column(
                ColumnRule::new(
                    "disposition_plan",
                    "Situation_and_Environment_Details_Disposition_Plan",
                )
                .optional(),
            )
            .column(
                ColumnRule::new("context", "Set_the_Stage_Context_Clinical_Vignette")
                    .truncated(300),
            ),
    ]
}

const VITALS_COLUMN: &str = "Monitor_Vital_Signs_Initial_Vitals";

/// Alternate header names seen in older sheet exports
pub fn standard_header_aliases() -> HashMap<String, Vec<String>> {
    let pairs: [(&str, &[&str]); 6] = [
        ("Case_Organization_Case_ID", &["Case ID", "ID"]),
        ("Case_Organization_Spark_Title", &["Spark Title", "Title"]),
        (
            "Case_Organization_Pathway_or_Course_Name",
            &["Pathway", "Course Name"],
        ),
        (VITALS_COLUMN, &["Initial Vitals", "Initial_Vitals", "Vitals"]),
        (
            "Patient_Demographics_and_Clinical_Data_Allergies",
            &["Allergies"],
        ),
        (
            "Situation_and_Environment_Details_Disposition_Plan",
            &["Disposition Plan", "Disposition"],
        ),
    ];

    pairs
        .iter()
        .map(|(canonical, alts)| {
            (
                canonical.to_string(),
                alts.iter().map(|a| a.to_string()).collect(),
            )
        })
        .collect()
}

/// Registry for a set of specs: sorted by priority, discovery set = every
/// produced field
pub fn registry_from_specs(mut specs: Vec<LayerSpec>) -> Result<LayerRegistry, CacheError> {
    specs.sort_by_key(|s| s.priority);

    let mut registry = LayerRegistry::new().with_version(CATALOG_VERSION);
    registry.register_all(specs.iter().map(LayerSpec::to_definition))?;
    Ok(registry)
}

pub fn standard_registry() -> Result<LayerRegistry, CacheError> {
    registry_from_specs(standard_specs())
}

/// Load layer specs from a JSON file
pub fn load_specs<P: AsRef<Path>>(path: P) -> Result<Vec<LayerSpec>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read layer catalog: {:?}", path.as_ref()))?;

    let specs: Vec<LayerSpec> =
        serde_json::from_str(&content).context("Failed to parse layer catalog JSON")?;

    Ok(specs)
}

// ============================================================================
// TESTS
// ============================================================================
