use opsflow::plan::{
    resolve_execution_order, validate_plan, ArgValue, PlanDocument, PlanError, PlanStepDocument,
    ValidationError,
};
use opsflow::registry::{
    CapabilityDescriptor, CapabilityRegistry, InputParam, OutputField, ValueKind,
};
use opsflow::shared::ids::{CapabilityName, StepId};
use serde_json::{json, Map};

fn registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry
        .register(
            CapabilityDescriptor::from_fn(CapabilityName::parse("repo.search").expect("name"), |_| {
                Ok(Map::new())
            })
            .with_input(InputParam::required("q", ValueKind::String))
            .with_output(OutputField::required("items", ValueKind::Array))
            .with_output(OutputField::required("top_owner", ValueKind::String)),
        )
        .expect("register repo.search");
    registry
        .register(
            CapabilityDescriptor::from_fn(
                CapabilityName::parse("weather.current").expect("name"),
                |_| Ok(Map::new()),
            )
            .with_input(InputParam::required("city", ValueKind::String))
            .with_output(OutputField::required("temp", ValueKind::Number))
            .with_output(OutputField::required("desc", ValueKind::String)),
        )
        .expect("register weather.current");
    registry
        .register(
            CapabilityDescriptor::from_fn(CapabilityName::parse("user.lookup").expect("name"), |_| {
                Ok(Map::new())
            })
            .with_input(InputParam::required("username", ValueKind::String))
            .with_output(OutputField::required("login", ValueKind::String)),
        )
        .expect("register user.lookup");
    registry
}

#[test]
fn validation_rejects_references_to_fields_missing_from_the_output_schema() {
    let plan = PlanDocument {
        task: None,
        steps: vec![
            PlanStepDocument::new("s1", "repo.search").with_argument("q", json!("ml")),
            PlanStepDocument::new("s2", "user.lookup")
                .with_argument("username", json!("${s1.title}")),
        ],
    };

    let err = validate_plan(&plan, &registry()).expect_err("bad reference");
    assert_eq!(
        err.validation_errors(),
        &[ValidationError::BadReference {
            step_id: "s2".to_string(),
            argument: "username".to_string(),
            reference: "${s1.title}".to_string(),
            reason: "capability `repo.search` declares no output field `title`".to_string(),
        }]
    );
}

#[test]
fn validation_is_idempotent() {
    let plan = PlanDocument::from_json(
        r#"{
            "steps": [
                {"id": "s1", "capability": "repo.search"},
                {"id": "s1", "capability": "nope"},
                {"id": "s3", "capability": "user.lookup", "arguments": {"username": "${s4.login}"}}
            ]
        }"#,
    )
    .expect("parse plan");
    let registry = registry();

    let first = validate_plan(&plan, &registry).expect_err("invalid plan");
    let second = validate_plan(&plan, &registry).expect_err("invalid plan");
    assert_eq!(first, second);
    assert_eq!(first.validation_errors().len(), 4);
}

#[test]
fn mutual_references_cannot_be_constructed() {
    let plan = PlanDocument {
        task: None,
        steps: vec![
            PlanStepDocument::new("a", "user.lookup")
                .with_argument("username", json!("${b.login}")),
            PlanStepDocument::new("b", "user.lookup")
                .with_argument("username", json!("${a.login}")),
        ],
    };

    let err = validate_plan(&plan, &registry()).expect_err("forward reference");
    let PlanError::Invalid { errors } = err else {
        panic!("expected validation errors");
    };
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        &errors[0],
        ValidationError::BadReference { step_id, reason, .. }
            if step_id == "a" && reason.contains("runs later in the plan")
    ));
}

#[test]
fn yaml_plans_with_depends_on_and_nested_references_validate() {
    let plan = PlanDocument::from_yaml(
        r#"
task: Find the top ML repo owner and the weather where they live
steps:
  - id: s1
    capability: repo.search
    arguments:
      q: machine learning
  - id: s2
    capability: user.lookup
    arguments:
      username: ${s1.items.0.owner}
  - id: s3
    capability: weather.current
    required: true
    depends_on: [s2]
    arguments:
      city: Tokyo
"#,
    )
    .expect("parse plan");

    let validated = validate_plan(&plan, &registry()).expect("valid plan");
    assert_eq!(
        validated.task(),
        Some("Find the top ML repo owner and the weather where they live")
    );

    let s2 = validated.step("s2").expect("s2");
    assert!(matches!(s2.arguments.get("username"), Some(ArgValue::Reference(_))));
    assert_eq!(
        s2.upstream.iter().map(StepId::as_str).collect::<Vec<_>>(),
        vec!["s1"]
    );

    let s3 = validated.step("s3").expect("s3");
    assert!(s3.critical);
    assert_eq!(
        s3.upstream.iter().map(StepId::as_str).collect::<Vec<_>>(),
        vec!["s2"]
    );

    let order = resolve_execution_order(&validated).expect("order");
    assert_eq!(
        order.step_ids().iter().map(StepId::as_str).collect::<Vec<_>>(),
        vec!["s1", "s2", "s3"]
    );
}

#[test]
fn unknown_depends_on_targets_and_invalid_ids_are_reported() {
    let plan = PlanDocument {
        task: None,
        steps: vec![
            PlanStepDocument::new("first step", "weather.current")
                .with_argument("city", json!("Oslo")),
            PlanStepDocument::new("s2", "weather.current")
                .with_argument("city", json!("Lima"))
                .after("s9"),
        ],
    };

    let errors = validate_plan(&plan, &registry())
        .expect_err("invalid plan")
        .validation_errors()
        .to_vec();
    assert!(matches!(
        &errors[0],
        ValidationError::InvalidStepId { position: 0, .. }
    ));
    assert_eq!(
        errors[1],
        ValidationError::BadReference {
            step_id: "s2".to_string(),
            argument: "depends_on".to_string(),
            reference: "s9".to_string(),
            reason: "no step with id `s9`".to_string(),
        }
    );
}

#[test]
fn resolver_reports_independence_sets() {
    let plan = PlanDocument {
        task: None,
        steps: vec![
            PlanStepDocument::new("s1", "repo.search").with_argument("q", json!("ml")),
            PlanStepDocument::new("s2", "weather.current").with_argument("city", json!("Tokyo")),
            PlanStepDocument::new("s3", "user.lookup")
                .with_argument("username", json!("${s1.top_owner}")),
        ],
    };
    let validated = validate_plan(&plan, &registry()).expect("valid plan");
    let order = resolve_execution_order(&validated).expect("order");

    let peers = |id: &str| {
        order
            .independent_of(id)
            .expect("step")
            .iter()
            .map(StepId::as_str)
            .collect::<Vec<_>>()
    };
    assert_eq!(peers("s1"), vec!["s2"]);
    assert_eq!(peers("s2"), vec!["s1", "s3"]);
    assert_eq!(peers("s3"), vec!["s2"]);
}
