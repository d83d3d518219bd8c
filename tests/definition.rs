//! Workflow Definition Integration Tests
//!
//! Tests for YAML parsing, structural validation and model checks.

mod common;

use common::image_model;
use genflow::core::{
    Comparison, DefinitionRegistry, ModelRegistry, StepKind, WorkflowDefinition,
    WorkflowValidationError,
};
use genflow::domain::Capability;
use serde_json::json;
use tempfile::TempDir;

const PRODUCT_SHOT: &str = r#"
id: product-shot
description: Render, upscale and approve a product image
credit_limit: 50
steps:
  - id: render
    kind: image-generation
    model: flux
    input:
      prompt: "{{ inputs.product }} on a marble table"
    retry_policy:
      max_attempts: 2
      initial_delay_ms: 250
  - id: upscale
    kind: image_generation
    model: flux
    capability: upscale_image
    depends_on: [render]
    input:
      references: ["{{ steps.render.output.assets.0 }}"]
  - id: approve
    kind: human_approval
    depends_on: [upscale]
    input: "{{ steps.upscale.output.assets.0 }}"
  - id: publish
    kind: data_transform
    depends_on: [approve]
    condition:
      step: approve
      path: output.approved
      op: "=="
      value: true
"#;

fn parse(yaml: &str) -> WorkflowDefinition {
    WorkflowDefinition::from_yaml(yaml).unwrap()
}

#[test]
fn test_parse_full_definition() {
    let def = parse(PRODUCT_SHOT);

    assert_eq!(def.id, "product-shot");
    assert_eq!(def.credit_limit, Some(50));
    assert_eq!(def.steps.len(), 4);

    let render = def.get_step("render").unwrap();
    assert_eq!(render.kind, StepKind::ImageGeneration);
    assert_eq!(render.capability(), Some(Capability::Image));
    let retry = render.retry_policy.as_ref().unwrap();
    assert_eq!(retry.max_attempts, 2);
    assert_eq!(retry.initial_delay_ms, 250);
    assert_eq!(retry.backoff_multiplier, 2.0);

    let upscale = def.get_step("upscale").unwrap();
    assert_eq!(upscale.capability(), Some(Capability::UpscaleImage));

    let approve = def.get_step("approve").unwrap();
    assert_eq!(approve.capability(), None);

    let condition = def.get_step("publish").unwrap().condition.as_ref().unwrap();
    assert_eq!(condition.op, Comparison::Eq);
    assert_eq!(condition.value, json!(true));
    assert!(condition.evaluate(Some(&json!({"approved": true}))));
    assert!(!condition.evaluate(Some(&json!({"approved": "yes"}))));
    assert!(!condition.evaluate(None));

    assert!(def.validate().is_ok());
}

#[test]
fn test_validate_against_models() {
    let def = parse(PRODUCT_SHOT);

    let models = ModelRegistry::from_models(vec![image_model("flux", &[("fal", 4)])]).unwrap();
    assert!(def.validate_models(&models).is_ok());

    let empty = ModelRegistry::new();
    assert_eq!(
        def.validate_models(&empty),
        Err(WorkflowValidationError::UnknownModel {
            step: "render".to_string(),
            model: "flux".to_string(),
        })
    );

    let mut image_only = image_model("flux", &[("fal", 4)]);
    image_only.capabilities = vec![Capability::Image];
    let models = ModelRegistry::from_models(vec![image_only]).unwrap();
    assert_eq!(
        def.validate_models(&models),
        Err(WorkflowValidationError::UnsupportedCapability {
            step: "upscale".to_string(),
            model: "flux".to_string(),
            capability: Capability::UpscaleImage,
        })
    );
}

#[test]
fn test_structural_errors() {
    let cases = [
        (
            "id: empty\nsteps: []\n",
            WorkflowValidationError::Empty("empty".to_string()),
        ),
        (
            r#"
id: dup
steps:
  - { id: a, kind: data_transform }
  - { id: a, kind: data_transform }
"#,
            WorkflowValidationError::DuplicateStep("a".to_string()),
        ),
        (
            r#"
id: dangling
steps:
  - { id: a, kind: data_transform, depends_on: [ghost] }
"#,
            WorkflowValidationError::DanglingDependency {
                step: "a".to_string(),
                dependency: "ghost".to_string(),
            },
        ),
        (
            r#"
id: stray-condition
steps:
  - { id: a, kind: data_transform }
  - { id: b, kind: data_transform }
  - id: c
    kind: data_transform
    depends_on: [a]
    condition: { step: b, op: exists }
"#,
            WorkflowValidationError::ConditionOutsideDependencies {
                step: "c".to_string(),
                referenced: "b".to_string(),
            },
        ),
        (
            r#"
id: no-model
steps:
  - { id: a, kind: text_generation }
"#,
            WorkflowValidationError::MissingModel {
                step: "a".to_string(),
                kind: StepKind::TextGeneration,
            },
        ),
    ];

    for (yaml, expected) in cases {
        assert_eq!(parse(yaml).validate(), Err(expected));
    }
}

#[test]
fn test_topological_order_keeps_authoring_order_for_ties() {
    let def = parse(
        r#"
id: diamond
steps:
  - { id: join, kind: data_transform, depends_on: [left, right] }
  - { id: right, kind: data_transform, depends_on: [root] }
  - { id: left, kind: data_transform, depends_on: [root] }
  - { id: root, kind: data_transform }
"#,
    );

    let order: Vec<&str> = def
        .topological_order()
        .unwrap()
        .into_iter()
        .map(|s| s.id.as_str())
        .collect();
    assert_eq!(order, vec!["root", "right", "left", "join"]);
}

#[test]
fn test_unknown_step_kind_rejected() {
    let result = WorkflowDefinition::from_yaml(
        r#"
id: bad
steps:
  - { id: a, kind: teleport }
"#,
    );
    assert!(result.is_err());
}

#[test]
fn test_registry_load_dir() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("product-shot.yaml"), PRODUCT_SHOT).unwrap();
    std::fs::write(
        temp.path().join("echo.yml"),
        "id: echo\nsteps:\n  - { id: copy, kind: data_transform }\n",
    )
    .unwrap();
    std::fs::write(temp.path().join("README.md"), "# not a workflow").unwrap();

    let registry = DefinitionRegistry::new();
    assert_eq!(registry.load_dir(temp.path()).unwrap(), 2);
    assert_eq!(registry.list(), vec!["echo", "product-shot"]);
    assert_eq!(
        registry.get("product-shot").unwrap().description,
        "Render, upscale and approve a product image"
    );
}
