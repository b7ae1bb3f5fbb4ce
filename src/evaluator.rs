//! Kleene fixed-point evaluation of operator entries.
//!
//! Operators are lowered into a flat arena of slots indexed by position;
//! children are resolved to slot indices once, up front. The operator graph
//! is then split into strongly connected components (iterative Tarjan), which
//! come out dependencies first. Acyclic operators are settled in one pass;
//! only cyclic components run Gauss-Seidel rounds, each round overwriting
//! only the evaluated operator's slot. Cycles cost bounded rounds and never
//! stack depth.
//!
//! ## Algorithm
//!
//! 1. Seed slots: facts/references with their authored certainty, valid
//!    operators with 0, invalid operators with their authored certainty
//! 2. Order operators into components, children before readers
//! 3. Per component: evaluate once if acyclic, otherwise repeat up to
//!    `max_rounds` rounds in id order until the largest change is below
//!    `epsilon`
//!
//! Non-convergence is best effort: the last round's values are returned and
//! the report is flagged.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::EvaluationLimits;
use crate::observe::{emit, EngineEvent, EngineObserver};
use crate::types::{clamp_certainty, EntryId, OperatorKind, TruthTable};

/// Conjunction: minimum of the operands.
pub fn and(values: &[f64]) -> f64 {
    clamp_certainty(values.iter().copied().fold(f64::INFINITY, f64::min))
}

/// Disjunction: maximum of the operands.
pub fn or(values: &[f64]) -> f64 {
    clamp_certainty(values.iter().copied().fold(f64::NEG_INFINITY, f64::max))
}

/// Negation: sign flip.
pub fn not(value: f64) -> f64 {
    clamp_certainty(-value)
}

/// Non-committal transform: `1 - 2|x|`. Maps 0 to 1 and ±1 to -1.
pub fn non(value: f64) -> f64 {
    clamp_certainty(1.0 - 2.0 * value.abs())
}

/// Apply a connective to operand values. Arity is the caller's concern.
pub fn apply(op: OperatorKind, values: &[f64]) -> f64 {
    match op {
        OperatorKind::And => and(values),
        OperatorKind::Or => or(values),
        OperatorKind::Not => values.first().copied().map_or(0.0, not),
        OperatorKind::Non => values.first().copied().map_or(0.0, non),
    }
}

/// Error type for operator validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum OperatorError {
    /// Wrong number of children.
    #[error("{op} requires {required} children, found {found}")]
    Arity {
        /// Connective.
        op: OperatorKind,
        /// Requirement text.
        required: String,
        /// Children present.
        found: usize,
    },
    /// Child id does not name a fact, reference or operator in the table.
    #[error("Dangling child reference: {0}")]
    DanglingChild(EntryId),
}

/// An operator excluded from evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidOperator {
    /// Operator entry.
    pub entry_id: EntryId,
    /// Why it was excluded.
    pub error: OperatorError,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Rounds executed by the slowest component. Acyclic graphs take one.
    pub rounds: u32,
    /// Whether every cyclic component's delta fell below epsilon.
    pub converged: bool,
    /// Largest change in the last round of any cyclic component.
    pub final_delta: f64,
    /// Derived certainty of every valid operator.
    pub derived: BTreeMap<EntryId, f64>,
    /// Operators excluded by validation.
    pub invalid: Vec<InvalidOperator>,
    /// Operators whose negative authored certainty was overridden by a
    /// positive derived value.
    pub overrides: Vec<EntryId>,
}

impl EvaluationReport {
    /// Derived certainty of an operator, if it was evaluated.
    pub fn certainty(&self, id: &str) -> Option<f64> {
        self.derived.get(id).copied()
    }
}

struct OpSlot {
    id: EntryId,
    slot: usize,
    op: OperatorKind,
    authored: f64,
    children: Vec<usize>,
}

/// Single-threaded fixed-point evaluator.
#[derive(Debug, Clone, Default)]
pub struct OperatorEvaluator {
    limits: EvaluationLimits,
}

impl OperatorEvaluator {
    /// Create an evaluator with the given limits.
    pub fn new(limits: EvaluationLimits) -> Self {
        Self { limits }
    }

    /// Compute derived certainties without touching the table.
    pub fn evaluate(&self, table: &TruthTable) -> EvaluationReport {
        let mut values: Vec<f64> = Vec::with_capacity(table.len());
        let mut index: HashMap<&EntryId, usize> = HashMap::with_capacity(table.len());

        // Every fact, reference and operator gets a slot.
        for entry in table.iter() {
            if entry.is_static() || entry.kind.operator().is_some() {
                index.insert(&entry.id, values.len());
                values.push(entry.certainty);
            }
        }

        let mut ops: Vec<OpSlot> = Vec::new();
        let mut invalid: Vec<InvalidOperator> = Vec::new();

        for entry in table.iter() {
            let Some((op, children)) = entry.kind.operator() else {
                continue;
            };
            match resolve_children(op, children, &index) {
                Ok(child_slots) => {
                    let slot = index[&entry.id];
                    values[slot] = 0.0;
                    ops.push(OpSlot {
                        id: entry.id.clone(),
                        slot,
                        op,
                        authored: entry.certainty,
                        children: child_slots,
                    });
                }
                Err(error) => {
                    debug!(entry_id = %entry.id, %error, "operator excluded from evaluation");
                    invalid.push(InvalidOperator {
                        entry_id: entry.id.clone(),
                        error,
                    });
                }
            }
        }

        let (rounds, converged, final_delta) = self.iterate(&ops, &mut values);

        let derived: BTreeMap<EntryId, f64> = ops
            .iter()
            .map(|op| (op.id.clone(), values[op.slot]))
            .collect();
        let overrides = ops
            .iter()
            .filter(|op| op.authored < 0.0 && values[op.slot] > 0.0)
            .map(|op| op.id.clone())
            .collect();

        EvaluationReport {
            rounds,
            converged,
            final_delta,
            derived,
            invalid,
            overrides,
        }
    }

    /// Evaluate and write derived certainties back into the table.
    ///
    /// Only operator certainties are written. Non-convergence, invalid
    /// operators and overridden disbelief are reported to the observer.
    pub fn apply(&self, table: &mut TruthTable, observer: &dyn EngineObserver) -> EvaluationReport {
        let report = self.evaluate(table);

        for invalid in &report.invalid {
            emit(
                observer,
                EngineEvent::InvalidOperator {
                    entry_id: invalid.entry_id.clone(),
                    reason: invalid.error.to_string(),
                },
            );
        }
        for id in &report.overrides {
            let authored = table.get(id.as_str()).map_or(0.0, |e| e.certainty);
            emit(
                observer,
                EngineEvent::DisbeliefOverridden {
                    entry_id: id.clone(),
                    authored,
                    derived: report.derived[id],
                },
            );
        }
        if !report.converged {
            emit(
                observer,
                EngineEvent::NonConvergence {
                    rounds: report.rounds,
                    final_delta: report.final_delta,
                },
            );
        }

        for (id, certainty) in &report.derived {
            table.set_certainty(id, *certainty);
        }

        info!(
            operators = report.derived.len(),
            invalid = report.invalid.len(),
            rounds = report.rounds,
            converged = report.converged,
            "operator evaluation complete"
        );
        report
    }

    fn iterate(&self, ops: &[OpSlot], values: &mut [f64]) -> (u32, bool, f64) {
        if ops.is_empty() {
            return (0, true, 0.0);
        }

        let graph = dependency_graph(ops, values.len());
        let mut operands: Vec<f64> = Vec::new();
        let mut rounds = 1;
        let mut converged = true;
        let mut final_delta: f64 = 0.0;

        for component in strongly_connected(&graph) {
            let cyclic = component.len() > 1 || graph[component[0]].contains(&component[0]);
            if !cyclic {
                let op = &ops[component[0]];
                values[op.slot] = evaluate_op(op, values, &mut operands);
                continue;
            }

            let (used, settled, delta) = self.settle(ops, &component, values, &mut operands);
            debug!(operators = component.len(), rounds = used, settled, "cyclic component evaluated");
            rounds = rounds.max(used);
            converged &= settled;
            final_delta = final_delta.max(delta);
        }
        (rounds, converged, final_delta)
    }

    /// Gauss-Seidel rounds over one cyclic component.
    fn settle(
        &self,
        ops: &[OpSlot],
        component: &[usize],
        values: &mut [f64],
        operands: &mut Vec<f64>,
    ) -> (u32, bool, f64) {
        let mut rounds = 0;
        let mut delta = f64::INFINITY;

        while rounds < self.limits.max_rounds {
            rounds += 1;
            delta = 0.0;
            for &i in component {
                let op = &ops[i];
                let next = evaluate_op(op, values, operands);
                delta = delta.max((next - values[op.slot]).abs());
                values[op.slot] = next;
            }
            if delta < self.limits.epsilon {
                return (rounds, true, delta);
            }
        }
        (rounds, false, delta)
    }
}

fn evaluate_op(op: &OpSlot, values: &[f64], operands: &mut Vec<f64>) -> f64 {
    operands.clear();
    operands.extend(op.children.iter().map(|&c| values[c]));
    apply(op.op, operands)
}

/// Operator-to-operator edges, reader to child, by position in `ops`.
fn dependency_graph(ops: &[OpSlot], slots: usize) -> Vec<Vec<usize>> {
    let mut owner: Vec<Option<usize>> = vec![None; slots];
    for (i, op) in ops.iter().enumerate() {
        owner[op.slot] = Some(i);
    }
    ops.iter()
        .map(|op| {
            let mut edges: Vec<usize> = op.children.iter().filter_map(|&c| owner[c]).collect();
            edges.sort_unstable();
            edges.dedup();
            edges
        })
        .collect()
}

/// Tarjan's algorithm with an explicit call stack.
///
/// Components are emitted after every component they reach, so children
/// come before their readers. Members are sorted by position (id order).
fn strongly_connected(graph: &[Vec<usize>]) -> Vec<Vec<usize>> {
    const UNVISITED: usize = usize::MAX;

    let n = graph.len();
    let mut index = vec![UNVISITED; n];
    let mut low = vec![0; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut calls: Vec<(usize, usize)> = Vec::new();
    let mut next_index = 0;
    let mut components = Vec::new();

    for root in 0..n {
        if index[root] != UNVISITED {
            continue;
        }
        index[root] = next_index;
        low[root] = next_index;
        next_index += 1;
        stack.push(root);
        on_stack[root] = true;
        calls.push((root, 0));

        while let Some(&(v, edge)) = calls.last() {
            if let Some(&w) = graph[v].get(edge) {
                let top = calls.len() - 1;
                calls[top].1 += 1;
                if index[w] == UNVISITED {
                    index[w] = next_index;
                    low[w] = next_index;
                    next_index += 1;
                    stack.push(w);
                    on_stack[w] = true;
                    calls.push((w, 0));
                } else if on_stack[w] {
                    low[v] = low[v].min(index[w]);
                }
                continue;
            }

            calls.pop();
            if let Some(&(parent, _)) = calls.last() {
                low[parent] = low[parent].min(low[v]);
            }
            if low[v] == index[v] {
                let mut component = Vec::new();
                while let Some(w) = stack.pop() {
                    on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                component.sort_unstable();
                components.push(component);
            }
        }
    }
    components
}

fn resolve_children(
    op: OperatorKind,
    children: &[EntryId],
    index: &HashMap<&EntryId, usize>,
) -> Result<Vec<usize>, OperatorError> {
    if !op.accepts_arity(children.len()) {
        return Err(OperatorError::Arity {
            op,
            required: op.arity_requirement().to_string(),
            found: children.len(),
        });
    }
    children
        .iter()
        .map(|child| {
            index
                .get(child)
                .copied()
                .ok_or_else(|| OperatorError::DanglingChild(child.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::RecordingObserver;
    use crate::types::TrustEntry;
    use proptest::prelude::*;

    fn evaluator() -> OperatorEvaluator {
        OperatorEvaluator::default()
    }

    #[test]
    fn test_connectives() {
        assert_eq!(and(&[0.3, -0.2, 0.9]), -0.2);
        assert_eq!(or(&[0.3, -0.2, 0.9]), 0.9);
        assert_eq!(not(0.4), -0.4);
        assert_eq!(non(0.0), 1.0);
        assert_eq!(non(1.0), -1.0);
        assert_eq!(non(-1.0), -1.0);
        assert_eq!(non(0.5), 0.0);
    }

    proptest! {
        #[test]
        fn prop_non_is_even(a in -1.0f64..=1.0) {
            prop_assert_eq!(non(a), non(-a));
        }

        #[test]
        fn prop_results_stay_in_range(a in -1.0f64..=1.0, b in -1.0f64..=1.0) {
            for v in [and(&[a, b]), or(&[a, b]), not(a), non(a)] {
                prop_assert!((-1.0..=1.0).contains(&v));
            }
            prop_assert_eq!(and(&[a, b]), a.min(b));
            prop_assert_eq!(or(&[a, b]), a.max(b));
            prop_assert_eq!(not(a), -a);
        }

        #[test]
        fn prop_not_chain_converges(len in 1usize..60, seed in -1.0f64..=1.0) {
            let mut entries = vec![TrustEntry::fact("f", seed)];
            let mut prev = "f".to_string();
            for i in 0..len {
                let id = format!("n{i:03}");
                entries.push(TrustEntry::operator(id.clone(), OperatorKind::Not, [prev.clone()]));
                prev = id;
            }
            let table = TruthTable::from_entries(entries).unwrap();
            let report = evaluator().evaluate(&table);
            prop_assert!(report.converged);
            prop_assert!(report.rounds <= 100);
            let expected = if len % 2 == 0 { seed } else { -seed };
            prop_assert_eq!(report.certainty(&prev).unwrap(), expected);
        }

        #[test]
        fn prop_reversed_not_chain_converges(len in 100usize..240, seed in -1.0f64..=1.0) {
            // Each operator's child sorts after it, so id order is the
            // reverse of dependency order.
            let mut entries = vec![TrustEntry::fact("zz_f", seed)];
            let mut prev = "zz_f".to_string();
            for i in (1..=len).rev() {
                let id = format!("n{i:03}");
                entries.push(TrustEntry::operator(id.clone(), OperatorKind::Not, [prev.clone()]));
                prev = id;
            }
            let table = TruthTable::from_entries(entries).unwrap();
            let report = evaluator().evaluate(&table);
            prop_assert!(report.converged);
            prop_assert_eq!(report.rounds, 1);
            let expected = if len % 2 == 0 { seed } else { -seed };
            prop_assert_eq!(report.certainty("n001").unwrap(), expected);
        }
    }

    #[test]
    fn test_descending_chain_settles_in_one_pass() {
        let mut entries = vec![TrustEntry::fact("zz_f", 0.8)];
        let mut prev = "zz_f".to_string();
        for i in (1..=150).rev() {
            let id = format!("n{i:03}");
            entries.push(TrustEntry::operator(id.clone(), OperatorKind::Not, [prev.clone()]));
            prev = id;
        }
        let mut table = TruthTable::from_entries(entries).unwrap();
        let observer = RecordingObserver::default();

        let report = evaluator().apply(&mut table, &observer);

        assert!(report.converged);
        assert_eq!(report.rounds, 1);
        assert_eq!(report.certainty("n150"), Some(-0.8));
        assert_eq!(report.certainty("n001"), Some(0.8));
        assert_eq!(table.get("n001").unwrap().certainty, 0.8);
        assert_eq!(observer.count("trust_kernel_non_convergence_total"), 0);
    }

    #[test]
    fn test_mixed_cycle_against_id_order() {
        // a reads b, b reads c, c reads a and the fact, so the cycle runs
        // against id order and is fed by a fact sorting last.
        let table = TruthTable::from_entries(vec![
            TrustEntry::operator("a", OperatorKind::Not, ["b"]),
            TrustEntry::operator("b", OperatorKind::Non, ["c"]),
            TrustEntry::operator("c", OperatorKind::Or, ["zf", "a"]),
            TrustEntry::fact("zf", 0.6),
        ])
        .unwrap();

        let report = evaluator().evaluate(&table);

        assert!(report.converged);
        assert!(report.rounds <= 100);
        assert!(report.final_delta < 1e-9);
        assert!((report.certainty("c").unwrap() - 0.6).abs() < 1e-12);
        assert!((report.certainty("b").unwrap() + 0.2).abs() < 1e-12);
        assert!((report.certainty("a").unwrap() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_components_come_children_first() {
        // 0 reads the {1, 2} cycle, which reads 3.
        let graph = vec![vec![2], vec![2, 3], vec![1], vec![]];
        let components = strongly_connected(&graph);
        assert_eq!(components, vec![vec![3], vec![1, 2], vec![0]]);
    }

    #[test]
    fn test_and_of_two_true_facts() {
        let table = TruthTable::from_entries(vec![
            TrustEntry::fact("f1", 1.0),
            TrustEntry::fact("f2", 1.0),
            TrustEntry::operator("d1", OperatorKind::And, ["f1", "f2"]),
        ])
        .unwrap();

        let report = evaluator().evaluate(&table);
        assert!(report.converged);
        assert_eq!(report.certainty("d1"), Some(1.0));
    }

    #[test]
    fn test_operators_over_operators() {
        let table = TruthTable::from_entries(vec![
            TrustEntry::fact("f1", 0.8),
            TrustEntry::fact("f2", -0.6),
            TrustEntry::operator("a_or", OperatorKind::Or, ["f1", "f2"]),
            TrustEntry::operator("b_not", OperatorKind::Not, ["a_or"]),
            TrustEntry::operator("c_non", OperatorKind::Non, ["b_not"]),
        ])
        .unwrap();

        let report = evaluator().evaluate(&table);
        assert!(report.converged);
        assert_eq!(report.certainty("a_or"), Some(0.8));
        assert_eq!(report.certainty("b_not"), Some(-0.8));
        assert!((report.certainty("c_non").unwrap() - (1.0 - 1.6)).abs() < 1e-12);
    }

    #[test]
    fn test_negation_cycle_converges_at_zero() {
        let table = TruthTable::from_entries(vec![
            TrustEntry::operator("a", OperatorKind::Not, ["b"]),
            TrustEntry::operator("b", OperatorKind::Not, ["a"]),
        ])
        .unwrap();

        let report = evaluator().evaluate(&table);
        assert!(report.converged);
        assert_eq!(report.certainty("a"), Some(0.0));
        assert_eq!(report.certainty("b"), Some(0.0));
    }

    #[test]
    fn test_non_self_loop_converges() {
        let table = TruthTable::from_entries(vec![TrustEntry::operator("a", OperatorKind::Non, ["a"])]).unwrap();

        let report = evaluator().evaluate(&table);
        assert!(report.converged);
        assert_eq!(report.certainty("a"), Some(-1.0));
        assert!(report.rounds <= 100);
    }

    #[test]
    fn test_monotone_cycle_converges() {
        let table = TruthTable::from_entries(vec![
            TrustEntry::fact("f1", 0.7),
            TrustEntry::fact("f2", 0.2),
            TrustEntry::operator("x", OperatorKind::And, ["f1", "y"]),
            TrustEntry::operator("y", OperatorKind::Or, ["x", "f2"]),
        ])
        .unwrap();

        let report = evaluator().evaluate(&table);
        assert!(report.converged);
        assert_eq!(report.certainty("x"), Some(0.2));
        assert_eq!(report.certainty("y"), Some(0.2));
    }

    #[test]
    fn test_round_cap_reports_non_convergence() {
        let table = TruthTable::from_entries(vec![TrustEntry::operator("a", OperatorKind::Non, ["a"])]).unwrap();
        let limits = EvaluationLimits {
            epsilon: 1e-9,
            max_rounds: 1,
        };

        let report = OperatorEvaluator::new(limits).evaluate(&table);
        assert!(!report.converged);
        assert_eq!(report.rounds, 1);
        assert_eq!(report.certainty("a"), Some(1.0));
    }

    #[test]
    fn test_invalid_operator_is_isolated() {
        let table = TruthTable::from_entries(vec![
            TrustEntry::fact("f1", 0.5),
            TrustEntry::operator("bad_arity", OperatorKind::And, ["f1"]),
            TrustEntry::operator("dangling", OperatorKind::Not, ["nowhere"]),
            TrustEntry::operator("good", OperatorKind::Not, ["f1"]),
        ])
        .unwrap();

        let report = evaluator().evaluate(&table);
        assert_eq!(report.invalid.len(), 2);
        assert!(matches!(report.invalid[0].error, OperatorError::Arity { found: 1, .. }));
        assert_eq!(
            report.invalid[1].error,
            OperatorError::DanglingChild(EntryId::from("nowhere"))
        );
        assert_eq!(report.certainty("good"), Some(-0.5));
        assert_eq!(report.certainty("bad_arity"), None);
    }

    #[test]
    fn test_invalid_operator_readable_at_authored_value() {
        let table = TruthTable::from_entries(vec![
            TrustEntry::fact("f1", 0.5),
            TrustEntry::operator("bad", OperatorKind::Not, ["f1", "f1"]).with_certainty(0.3),
            TrustEntry::operator("reader", OperatorKind::Not, ["bad"]),
        ])
        .unwrap();

        let report = evaluator().evaluate(&table);
        assert_eq!(report.certainty("reader"), Some(-0.3));
    }

    #[test]
    fn test_authority_child_is_dangling() {
        let table = TruthTable::from_entries(vec![
            TrustEntry::authority("a1", 0.5, "https://example.org/t.jsonl"),
            TrustEntry::operator("d1", OperatorKind::Not, ["a1"]),
        ])
        .unwrap();

        let report = evaluator().evaluate(&table);
        assert_eq!(report.invalid.len(), 1);
    }

    #[test]
    fn test_apply_writes_operators_and_reports_override() {
        let mut table = TruthTable::from_entries(vec![
            TrustEntry::fact("f1", 1.0),
            TrustEntry::fact("f2", 0.9),
            TrustEntry::operator("d1", OperatorKind::Or, ["f1", "f2"]).with_certainty(-0.8),
        ])
        .unwrap();
        let observer = RecordingObserver::default();

        let report = evaluator().apply(&mut table, &observer);

        assert_eq!(table.get("d1").unwrap().certainty, 1.0);
        assert_eq!(table.get("f1").unwrap().certainty, 1.0);
        assert_eq!(report.overrides, vec![EntryId::from("d1")]);
        assert_eq!(observer.count("trust_kernel_disbelief_overridden_total"), 1);
    }

    #[test]
    fn test_empty_table() {
        let report = evaluator().evaluate(&TruthTable::new());
        assert!(report.converged);
        assert_eq!(report.rounds, 0);
    }
}
