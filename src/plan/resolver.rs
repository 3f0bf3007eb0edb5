use crate::plan::error::PlanError;
use crate::plan::validate::{ValidatedPlan, ValidatedStep};
use crate::shared::ids::StepId;
use std::collections::{BTreeMap, BTreeSet};

/// Resolved execution order for a validated plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOrder {
    /// Plan positions in execution order.
    pub(crate) positions: Vec<usize>,
    step_ids: Vec<StepId>,
    independent: BTreeMap<StepId, BTreeSet<StepId>>,
}

impl ExecutionOrder {
    pub fn step_ids(&self) -> &[StepId] {
        &self.step_ids
    }

    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    /// Steps with no data dependency on `step_id` in either direction.
    pub fn independent_of(&self, step_id: &str) -> Option<&BTreeSet<StepId>> {
        self.independent.get(step_id)
    }

    pub fn independence_sets(&self) -> &BTreeMap<StepId, BTreeSet<StepId>> {
        &self.independent
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

pub fn resolve_execution_order(plan: &ValidatedPlan) -> Result<ExecutionOrder, PlanError> {
    order_steps(plan.steps())
}

/// Stable topological sort: among ready steps the earliest plan position wins.
pub(crate) fn order_steps(steps: &[ValidatedStep]) -> Result<ExecutionOrder, PlanError> {
    let index_of: BTreeMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(index, step)| (step.id.as_str(), index))
        .collect();
    let upstream: Vec<Vec<usize>> = steps
        .iter()
        .map(|step| {
            step.upstream
                .iter()
                .filter_map(|id| index_of.get(id.as_str()).copied())
                .collect()
        })
        .collect();

    let mut dependents = vec![Vec::new(); steps.len()];
    let mut pending: Vec<usize> = upstream.iter().map(Vec::len).collect();
    for (index, deps) in upstream.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(index);
        }
    }

    let mut ready: BTreeSet<usize> = (0..steps.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < steps.len() {
        let cycle = find_cycle(&upstream, &pending)
            .into_iter()
            .map(|index| steps[index].id.to_string())
            .collect();
        return Err(PlanError::CyclicDependency { cycle });
    }

    let ancestors = ancestor_sets(&order, &upstream);
    let mut independent = BTreeMap::new();
    for (index, step) in steps.iter().enumerate() {
        let peers = (0..steps.len())
            .filter(|&other| {
                other != index
                    && !ancestors[index].contains(&other)
                    && !ancestors[other].contains(&index)
            })
            .map(|other| steps[other].id.clone())
            .collect();
        independent.insert(step.id.clone(), peers);
    }

    Ok(ExecutionOrder {
        step_ids: order.iter().map(|&index| steps[index].id.clone()).collect(),
        positions: order.iter().map(|&index| steps[index].position).collect(),
        independent,
    })
}

fn ancestor_sets(order: &[usize], upstream: &[Vec<usize>]) -> Vec<BTreeSet<usize>> {
    let mut ancestors = vec![BTreeSet::new(); upstream.len()];
    for &index in order {
        let mut collected = BTreeSet::new();
        for &dep in &upstream[index] {
            collected.insert(dep);
            collected.extend(ancestors[dep].iter().copied());
        }
        ancestors[index] = collected;
    }
    ancestors
}

/// Walks upstream edges among the unsorted steps until a step repeats.
fn find_cycle(upstream: &[Vec<usize>], pending: &[usize]) -> Vec<usize> {
    let Some(start) = (0..upstream.len()).find(|&index| pending[index] > 0) else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut on_path = BTreeMap::from([(start, 0usize)]);
    let mut current = start;
    loop {
        // Every unsorted step keeps at least one unsorted dependency.
        let Some(&next) = upstream[current].iter().find(|&&dep| pending[dep] > 0) else {
            return path;
        };
        if let Some(&at) = on_path.get(&next) {
            let mut cycle = path.split_off(at);
            cycle.push(next);
            return cycle;
        }
        on_path.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ids::CapabilityName;

    fn step(position: usize, id: &str, upstream: &[&str]) -> ValidatedStep {
        ValidatedStep {
            id: StepId::parse(id).expect("step id"),
            capability: CapabilityName::parse("test.noop").expect("capability"),
            position,
            arguments: BTreeMap::new(),
            upstream: upstream
                .iter()
                .map(|id| StepId::parse(id).expect("step id"))
                .collect(),
            critical: false,
        }
    }

    fn ids(order: &ExecutionOrder) -> Vec<&str> {
        order.step_ids().iter().map(StepId::as_str).collect()
    }

    #[test]
    fn independent_steps_keep_plan_order() {
        let order = order_steps(&[step(0, "a", &[]), step(1, "b", &[]), step(2, "c", &[])])
            .expect("order");
        assert_eq!(ids(&order), vec!["a", "b", "c"]);
        assert_eq!(order.positions(), &[0, 1, 2]);
        assert_eq!(order.independent_of("a").expect("a").len(), 2);
    }

    #[test]
    fn dependencies_force_reordering_only_when_needed() {
        // `a` depends on `c`; the sort must pull `c` ahead of `a` but keep `b` first.
        let order = order_steps(&[step(0, "b", &[]), step(1, "a", &["c"]), step(2, "c", &[])])
            .expect("order");
        assert_eq!(ids(&order), vec!["b", "c", "a"]);
    }

    #[test]
    fn independence_is_transitive_through_chains() {
        let order = order_steps(&[
            step(0, "a", &[]),
            step(1, "b", &["a"]),
            step(2, "c", &["b"]),
            step(3, "d", &[]),
        ])
        .expect("order");

        let independent_of_c: Vec<&str> = order
            .independent_of("c")
            .expect("c")
            .iter()
            .map(StepId::as_str)
            .collect();
        assert_eq!(independent_of_c, vec!["d"]);
        assert_eq!(order.independent_of("d").expect("d").len(), 3);
    }

    #[test]
    fn two_step_cycles_are_rejected() {
        let err = order_steps(&[step(0, "a", &["b"]), step(1, "b", &["a"])])
            .expect_err("cycle");
        assert_eq!(
            err,
            PlanError::CyclicDependency {
                cycle: vec!["a".to_string(), "b".to_string(), "a".to_string()],
            }
        );
    }

    #[test]
    fn cycles_behind_healthy_steps_are_found() {
        let err = order_steps(&[
            step(0, "root", &[]),
            step(1, "x", &["root", "z"]),
            step(2, "y", &["x"]),
            step(3, "z", &["y"]),
        ])
        .expect_err("cycle");
        let PlanError::CyclicDependency { cycle } = err else {
            panic!("expected cycle error");
        };
        assert_eq!(cycle, vec!["x", "z", "y", "x"]);
    }
}
