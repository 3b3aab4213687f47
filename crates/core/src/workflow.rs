//! Workflow normalization, structural fingerprinting, and auto-seed rewrite.
//!
//! A workflow is a JSON object mapping node ids to
//! `{class_type, inputs, _meta?}`. Before dispatch the pool normalizes the
//! caller's input into an owned [`NormalizedWorkflow`], computes a
//! value-insensitive structural fingerprint, and substitutes the `-1` seed
//! sentinel with concrete random seeds.

use std::collections::HashMap;

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// Seed value that requests a randomly assigned seed at dispatch time.
pub const AUTO_SEED_SENTINEL: i64 = -1;

/// Exclusive upper bound for auto-assigned seeds (2^31 - 1).
pub const AUTO_SEED_RANGE_END: i64 = 2_147_483_647;

// ---------------------------------------------------------------------------
// Input shapes
// ---------------------------------------------------------------------------

/// A workflow prepared by an external builder: the graph JSON plus any
/// metadata the builder already computed.
#[derive(Debug, Clone)]
pub struct PreparedWorkflow {
    /// The workflow graph.
    pub json: serde_json::Value,
    /// Pre-computed structural fingerprint, if the builder kept one.
    pub fingerprint: Option<String>,
    /// Output node id to alias name mapping.
    pub output_aliases: HashMap<String, String>,
}

/// The shapes a caller may submit a workflow in.
///
/// After [`normalize`] the pool never needs to inspect which shape it was
/// given.
#[derive(Debug, Clone)]
pub enum WorkflowInput {
    /// A raw JSON graph.
    Json(serde_json::Value),
    /// A JSON string to be parsed.
    Text(String),
    /// Builder output carrying pre-computed metadata.
    Prepared(PreparedWorkflow),
}

impl From<serde_json::Value> for WorkflowInput {
    fn from(value: serde_json::Value) -> Self {
        WorkflowInput::Json(value)
    }
}

impl From<String> for WorkflowInput {
    fn from(text: String) -> Self {
        WorkflowInput::Text(text)
    }
}

impl From<&str> for WorkflowInput {
    fn from(text: &str) -> Self {
        WorkflowInput::Text(text.to_string())
    }
}

impl From<PreparedWorkflow> for WorkflowInput {
    fn from(prepared: PreparedWorkflow) -> Self {
        WorkflowInput::Prepared(prepared)
    }
}

/// A validated, owned workflow ready for scheduling.
///
/// The JSON is owned by the pool from here on; the caller's value is never
/// mutated.
#[derive(Debug, Clone)]
pub struct NormalizedWorkflow {
    pub json: serde_json::Value,
    pub fingerprint: String,
    pub output_aliases: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Normalize any accepted input shape into a [`NormalizedWorkflow`].
///
/// Validates the graph structure and computes the fingerprint unless the
/// input already carries one.
pub fn normalize(input: WorkflowInput) -> Result<NormalizedWorkflow, CoreError> {
    match input {
        WorkflowInput::Json(json) => {
            validate_workflow(&json)?;
            let fingerprint = fingerprint(&json)?;
            Ok(NormalizedWorkflow {
                json,
                fingerprint,
                output_aliases: HashMap::new(),
            })
        }
        WorkflowInput::Text(text) => {
            let json: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| CoreError::Validation(format!("Workflow is not valid JSON: {e}")))?;
            normalize(WorkflowInput::Json(json))
        }
        WorkflowInput::Prepared(prepared) => {
            validate_workflow(&prepared.json)?;
            let fingerprint = match prepared.fingerprint {
                Some(fp) => fp,
                None => fingerprint(&prepared.json)?,
            };
            Ok(NormalizedWorkflow {
                json: prepared.json,
                fingerprint,
                output_aliases: prepared.output_aliases,
            })
        }
    }
}

/// Validate the basic graph shape: a non-empty object whose every node
/// carries a string `class_type`.
pub fn validate_workflow(json: &serde_json::Value) -> Result<(), CoreError> {
    let obj = json
        .as_object()
        .ok_or_else(|| CoreError::Validation("Workflow JSON must be an object".to_string()))?;

    if obj.is_empty() {
        return Err(CoreError::Validation(
            "Workflow JSON must contain at least one node".to_string(),
        ));
    }

    for (node_id, node_value) in obj {
        if node_value
            .get("class_type")
            .and_then(|v| v.as_str())
            .is_none()
        {
            return Err(CoreError::Validation(format!(
                "Node '{node_id}' is missing required 'class_type' field"
            )));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Compute the structural fingerprint of a workflow.
///
/// Canonical traversal: node ids in sorted order, each contributing its
/// `class_type` and the sorted key names of its `inputs`. Input *values* are
/// excluded, so two workflows differing only in seed or prompt text share a
/// fingerprint (and therefore blocklist and affinity buckets).
pub fn fingerprint(json: &serde_json::Value) -> Result<String, CoreError> {
    let obj = json
        .as_object()
        .ok_or_else(|| CoreError::Validation("Workflow JSON must be an object".to_string()))?;

    let mut node_ids: Vec<&String> = obj.keys().collect();
    node_ids.sort();

    let mut hasher = Sha256::new();
    for node_id in node_ids {
        let node = &obj[node_id];
        let class_type = node.get("class_type").and_then(|v| v.as_str()).ok_or_else(|| {
            CoreError::Validation(format!(
                "Node '{node_id}' is missing required 'class_type' field"
            ))
        })?;

        hasher.update(node_id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(class_type.as_bytes());
        hasher.update(b"\x1f");

        if let Some(inputs) = node.get("inputs").and_then(|v| v.as_object()) {
            let mut keys: Vec<&String> = inputs.keys().collect();
            keys.sort();
            for key in keys {
                hasher.update(key.as_bytes());
                hasher.update(b"\x1e");
            }
        }
        hasher.update(b"\n");
    }

    let hash = hasher.finalize();
    Ok(format!("{hash:x}"))
}

// ---------------------------------------------------------------------------
// Auto-seed rewrite
// ---------------------------------------------------------------------------

/// Replace every `inputs.seed == -1` with a random seed in
/// `[0, 2^31 - 1)`.
///
/// Returns the map of node id to assigned seed so results can report the
/// seeds that were actually used.
pub fn rewrite_auto_seeds(workflow: &mut serde_json::Value) -> HashMap<String, i64> {
    let mut assigned = HashMap::new();

    let Some(obj) = workflow.as_object_mut() else {
        return assigned;
    };

    let mut rng = rand::rng();
    for (node_id, node_value) in obj.iter_mut() {
        let Some(inputs) = node_value.get_mut("inputs").and_then(|v| v.as_object_mut()) else {
            continue;
        };
        let is_sentinel = inputs
            .get("seed")
            .and_then(|v| v.as_i64())
            .map(|s| s == AUTO_SEED_SENTINEL)
            .unwrap_or(false);
        if is_sentinel {
            let seed = rng.random_range(0..AUTO_SEED_RANGE_END);
            inputs.insert("seed".to_string(), serde_json::Value::from(seed));
            assigned.insert(node_id.clone(), seed);
        }
    }

    assigned
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_workflow() -> serde_json::Value {
        json!({
            "3": {
                "class_type": "KSampler",
                "inputs": { "seed": 42, "cfg": 7.5, "model": ["4", 0] }
            },
            "4": {
                "class_type": "CheckpointLoaderSimple",
                "inputs": { "ckpt_name": "sd_xl_base.safetensors" }
            },
            "9": {
                "class_type": "SaveImage",
                "inputs": { "images": ["3", 0] }
            }
        })
    }

    // -- fingerprint ----------------------------------------------------------

    #[test]
    fn fingerprint_ignores_input_values() {
        let a = sample_workflow();
        let mut b = sample_workflow();
        b["3"]["inputs"]["seed"] = json!(7);
        b["3"]["inputs"]["cfg"] = json!(1.0);
        b["4"]["inputs"]["ckpt_name"] = json!("other.safetensors");

        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn fingerprint_changes_with_class_type() {
        let a = sample_workflow();
        let mut b = sample_workflow();
        b["3"]["class_type"] = json!("KSamplerAdvanced");

        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn fingerprint_changes_with_input_key_set() {
        let a = sample_workflow();
        let mut b = sample_workflow();
        b["3"]["inputs"]
            .as_object_mut()
            .unwrap()
            .insert("denoise".to_string(), json!(1.0));

        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn fingerprint_changes_with_node_ids() {
        let a = json!({"1": {"class_type": "SaveImage", "inputs": {}}});
        let b = json!({"2": {"class_type": "SaveImage", "inputs": {}}});

        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn fingerprint_is_stable_across_key_order() {
        // serde_json's Map preserves insertion order; the canonical
        // traversal must not.
        let a: serde_json::Value = serde_json::from_str(
            r#"{"1": {"class_type": "A", "inputs": {"x": 1, "y": 2}},
                "2": {"class_type": "B", "inputs": {}}}"#,
        )
        .unwrap();
        let b: serde_json::Value = serde_json::from_str(
            r#"{"2": {"class_type": "B", "inputs": {}},
                "1": {"class_type": "A", "inputs": {"y": 2, "x": 1}}}"#,
        )
        .unwrap();

        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    // -- normalize ------------------------------------------------------------

    #[test]
    fn normalize_from_json_string() {
        let text = sample_workflow().to_string();
        let normalized = normalize(WorkflowInput::from(text)).unwrap();
        assert_eq!(
            normalized.fingerprint,
            fingerprint(&sample_workflow()).unwrap()
        );
    }

    #[test]
    fn normalize_rejects_invalid_json_text() {
        assert!(normalize(WorkflowInput::from("not json")).is_err());
    }

    #[test]
    fn normalize_rejects_non_object() {
        assert!(normalize(WorkflowInput::Json(json!([1, 2]))).is_err());
    }

    #[test]
    fn normalize_rejects_empty_workflow() {
        assert!(normalize(WorkflowInput::Json(json!({}))).is_err());
    }

    #[test]
    fn normalize_rejects_missing_class_type() {
        let wf = json!({"1": {"inputs": {}}});
        assert!(normalize(WorkflowInput::Json(wf)).is_err());
    }

    #[test]
    fn normalize_preserves_prepared_metadata() {
        let prepared = PreparedWorkflow {
            json: sample_workflow(),
            fingerprint: Some("precomputed".to_string()),
            output_aliases: HashMap::from([("9".to_string(), "image".to_string())]),
        };
        let normalized = normalize(WorkflowInput::from(prepared)).unwrap();
        assert_eq!(normalized.fingerprint, "precomputed");
        assert_eq!(normalized.output_aliases["9"], "image");
    }

    // -- rewrite_auto_seeds ---------------------------------------------------

    #[test]
    fn seed_rewrite_replaces_only_sentinels() {
        let mut wf = json!({
            "1": { "class_type": "KSampler", "inputs": { "seed": -1 } },
            "2": { "class_type": "KSampler", "inputs": { "seed": 42 } },
            "3": { "class_type": "SaveImage", "inputs": {} }
        });

        let assigned = rewrite_auto_seeds(&mut wf);

        assert_eq!(assigned.len(), 1);
        let seed = assigned["1"];
        assert!((0..AUTO_SEED_RANGE_END).contains(&seed));
        assert_eq!(wf["1"]["inputs"]["seed"].as_i64().unwrap(), seed);
        assert_eq!(wf["2"]["inputs"]["seed"].as_i64().unwrap(), 42);
    }

    #[test]
    fn seed_rewrite_leaves_no_sentinel_behind() {
        let mut wf = json!({
            "1": { "class_type": "A", "inputs": { "seed": -1 } },
            "2": { "class_type": "B", "inputs": { "seed": -1 } }
        });

        let assigned = rewrite_auto_seeds(&mut wf);

        assert_eq!(assigned.len(), 2);
        for (_, node) in wf.as_object().unwrap() {
            assert_ne!(node["inputs"]["seed"].as_i64().unwrap(), AUTO_SEED_SENTINEL);
        }
    }

    #[test]
    fn seed_rewrite_ignores_non_numeric_seed() {
        let mut wf = json!({
            "1": { "class_type": "A", "inputs": { "seed": ["2", 0] } }
        });
        let assigned = rewrite_auto_seeds(&mut wf);
        assert!(assigned.is_empty());
    }
}
