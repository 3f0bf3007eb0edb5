use crate::plan::document::{PlanDocument, PlanStepDocument};
use crate::plan::error::{PlanError, ValidationError};
use crate::plan::value::{ArgValue, StepReference};
use crate::registry::{CapabilityDescriptor, CapabilityRegistry, ValueKind};
use crate::shared::ids::{CapabilityName, StepId};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

const DEPENDS_ON_ARGUMENT: &str = "depends_on";

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedStep {
    pub id: StepId,
    pub capability: CapabilityName,
    /// Index of the step in the submitted plan.
    pub position: usize,
    pub arguments: BTreeMap<String, ArgValue>,
    /// Steps whose success this step needs: referenced ones plus `depends_on`.
    pub upstream: BTreeSet<StepId>,
    pub critical: bool,
}

/// A plan that passed static validation. Only `validate_plan` builds one.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPlan {
    pub(crate) task: Option<String>,
    pub(crate) steps: Vec<ValidatedStep>,
}

impl ValidatedPlan {
    pub fn task(&self) -> Option<&str> {
        self.task.as_deref()
    }

    pub fn steps(&self) -> &[ValidatedStep] {
        &self.steps
    }

    pub fn step(&self, step_id: &str) -> Option<&ValidatedStep> {
        self.steps.iter().find(|step| step.id.as_str() == step_id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Statically checks `plan` against `registry`, reporting every problem in plan order.
pub fn validate_plan(
    plan: &PlanDocument,
    registry: &CapabilityRegistry,
) -> Result<ValidatedPlan, PlanError> {
    if plan.steps.is_empty() {
        return Err(PlanError::Invalid {
            errors: vec![ValidationError::EmptyPlan],
        });
    }

    let mut first_position: BTreeMap<&str, usize> = BTreeMap::new();
    for (position, step) in plan.steps.iter().enumerate() {
        first_position.entry(step.id.as_str()).or_insert(position);
    }

    let mut errors = Vec::new();
    let mut seen = BTreeSet::new();
    let mut steps = Vec::with_capacity(plan.steps.len());

    for (position, raw) in plan.steps.iter().enumerate() {
        let id = match StepId::parse(&raw.id) {
            Ok(id) => Some(id),
            Err(reason) => {
                errors.push(ValidationError::InvalidStepId {
                    position,
                    step_id: raw.id.clone(),
                    reason,
                });
                None
            }
        };
        if !seen.insert(raw.id.as_str()) {
            errors.push(ValidationError::DuplicateStepId {
                step_id: raw.id.clone(),
            });
        }

        let descriptor = registry.lookup(&raw.capability).ok();
        if descriptor.is_none() {
            errors.push(ValidationError::UnknownCapability {
                step_id: raw.id.clone(),
                capability: raw.capability.clone(),
            });
        }

        let context = StepContext {
            plan,
            registry,
            raw,
            position,
            first_position: &first_position,
        };
        let mut arguments = BTreeMap::new();
        let mut upstream = BTreeSet::new();

        for (name, raw_value) in &raw.arguments {
            let value = match ArgValue::parse(raw_value) {
                Ok(value) => value,
                Err(reason) => {
                    errors.push(ValidationError::BadReference {
                        step_id: raw.id.clone(),
                        argument: name.clone(),
                        reference: raw_value_text(raw_value),
                        reason,
                    });
                    continue;
                }
            };

            for reference in value.references() {
                match context.check_reference(name, reference) {
                    Ok(target) => {
                        upstream.insert(target);
                    }
                    Err(err) => errors.push(err),
                }
            }

            if let Some(descriptor) = descriptor {
                if let Some(err) = context.check_argument(descriptor, name, &value) {
                    errors.push(err);
                }
            }
            arguments.insert(name.clone(), value);
        }

        if let Some(descriptor) = descriptor {
            for param in descriptor.inputs.iter().filter(|param| param.required) {
                if !raw.arguments.contains_key(&param.name) {
                    errors.push(ValidationError::MissingArgument {
                        step_id: raw.id.clone(),
                        capability: raw.capability.clone(),
                        argument: param.name.clone(),
                    });
                }
            }
        }

        for dependency in &raw.depends_on {
            match context.check_earlier(dependency) {
                Ok(target) => {
                    upstream.insert(target);
                }
                Err(reason) => errors.push(ValidationError::BadReference {
                    step_id: raw.id.clone(),
                    argument: DEPENDS_ON_ARGUMENT.to_string(),
                    reference: dependency.clone(),
                    reason,
                }),
            }
        }

        if let (Some(id), Some(descriptor)) = (id, descriptor) {
            steps.push(ValidatedStep {
                id,
                capability: descriptor.name.clone(),
                position,
                arguments,
                upstream,
                critical: raw.critical,
            });
        }
    }

    if !errors.is_empty() {
        return Err(PlanError::Invalid { errors });
    }
    Ok(ValidatedPlan {
        task: plan.task.clone(),
        steps,
    })
}

struct StepContext<'a> {
    plan: &'a PlanDocument,
    registry: &'a CapabilityRegistry,
    raw: &'a PlanStepDocument,
    position: usize,
    first_position: &'a BTreeMap<&'a str, usize>,
}

impl StepContext<'_> {
    fn check_earlier(&self, target: &str) -> Result<StepId, String> {
        if target == self.raw.id {
            return Err("a step cannot reference itself".to_string());
        }
        let target_position = self
            .first_position
            .get(target)
            .copied()
            .ok_or_else(|| format!("no step with id `{target}`"))?;
        if target_position > self.position {
            return Err(format!("step `{target}` runs later in the plan"));
        }
        StepId::parse(target)
            .map_err(|reason| format!("step `{target}` has an invalid id: {reason}"))
    }

    fn check_reference(
        &self,
        argument: &str,
        reference: &StepReference,
    ) -> Result<StepId, ValidationError> {
        let bad_reference = |reason: String| ValidationError::BadReference {
            step_id: self.raw.id.clone(),
            argument: argument.to_string(),
            reference: reference.to_string(),
            reason,
        };

        let target = self.check_earlier(&reference.step_id).map_err(bad_reference)?;
        let target_capability = &self.plan.steps[self.first_position[target.as_str()]].capability;
        // An unknown upstream capability is reported on its own step.
        if let Ok(upstream) = self.registry.lookup(target_capability) {
            if upstream.output(&reference.field).is_none() {
                return Err(bad_reference(format!(
                    "capability `{target_capability}` declares no output field `{}`",
                    reference.field
                )));
            }
        }
        Ok(target)
    }

    fn check_argument(
        &self,
        descriptor: &CapabilityDescriptor,
        name: &str,
        value: &ArgValue,
    ) -> Option<ValidationError> {
        let Some(param) = descriptor.input(name) else {
            return Some(ValidationError::UnknownArgument {
                step_id: self.raw.id.clone(),
                capability: self.raw.capability.clone(),
                argument: name.to_string(),
            });
        };

        let found = match value {
            ArgValue::Literal(literal) if !param.kind.matches(literal) => {
                ValueKind::describe(literal).to_string()
            }
            ArgValue::List(_) if !param.kind.accepts(ValueKind::Array) => "array".to_string(),
            ArgValue::Object(_) if !param.kind.accepts(ValueKind::Object) => {
                "object".to_string()
            }
            ArgValue::Reference(reference) if reference.path.is_empty() => {
                let produced = self.referenced_kind(reference)?;
                if param.kind.accepts(produced) {
                    return None;
                }
                format!("{produced} (from {reference})")
            }
            _ => return None,
        };
        Some(ValidationError::InvalidArgumentType {
            step_id: self.raw.id.clone(),
            argument: name.to_string(),
            expected: param.kind,
            found,
        })
    }

    fn referenced_kind(&self, reference: &StepReference) -> Option<ValueKind> {
        let position = self.first_position.get(reference.step_id.as_str())?;
        let capability = &self.plan.steps[*position].capability;
        let descriptor = self.registry.lookup(capability).ok()?;
        descriptor.output(&reference.field).map(|field| field.kind)
    }
}

fn raw_value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
