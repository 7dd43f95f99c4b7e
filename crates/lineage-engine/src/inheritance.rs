//! Distribution of a seed amount across a root's descendant graph.
//!
//! The walk is an explicit depth-first traversal over a frame stack, never
//! language-level recursion. Two structural bounds keep it finite on any
//! input graph:
//!
//! - **Path**: a child already on the current root→node path is excluded
//!   from its parent's split and reported as a cycle. A node left with no
//!   other children is a leaf.
//! - **Depth**: a node at `generation == max_depth` that still has eligible
//!   children is not expanded; its amount is reported as unresolved.
//!
//! Each expanded node writes all of its sibling records in one atomic batch
//! keyed by natural key, so a halted or crashed run can be resumed by simply
//! distributing again with the same amount.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use lineage_core::allocation::{normalize_children, split_evenly};
use lineage_core::amount::validate_amount;
use lineage_core::constants::{DEFAULT_MAX_DEPTH, MAX_DEPTH_LIMIT};
use lineage_core::error::{DistributionError, LineageError, ValidationError};
use lineage_core::traits::{ObligationRepository, PersonStore, RunClaim};
use lineage_core::types::{
    DistributionRun, ObligationKind, ObligationRecord, PathId, PersonId, RecordKey, RunId,
    RunStatus,
};

/// Cooperative cancellation flag shared between a caller and a running
/// distribution. Checked between nodes.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Caller-tunable bounds for one distribution.
#[derive(Clone, Debug)]
pub struct DistributeOptions {
    /// Deepest generation that receives records.
    pub max_depth: u32,
    /// Maximum number of nodes expanded before halting.
    pub step_budget: Option<u64>,
    pub cancel: Option<CancelToken>,
}

impl Default for DistributeOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            step_budget: None,
            cancel: None,
        }
    }
}

impl DistributeOptions {
    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_step_budget(mut self, budget: u64) -> Self {
        self.step_budget = Some(budget);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Why a traversal stopped before visiting every reachable node.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum HaltReason {
    BudgetExhausted,
    Cancelled,
}

/// Recoverable conditions met during a traversal.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum DistributionWarning {
    /// `child` is already on the path to `parent`; it was left out of the split.
    CycleDetected {
        parent: PersonId,
        child: PersonId,
        generation: u32,
    },
    /// `person` has children but sits at the depth bound; `amount` was not handed down.
    DepthExceeded {
        person: PersonId,
        generation: u32,
        amount: u64,
    },
}

/// Result of [`InheritanceEngine::distribute`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DistributionReport {
    /// The run after this traversal.
    pub run: DistributionRun,
    /// Every record of the run, ordered by natural key.
    pub records: Vec<ObligationRecord>,
    /// Records written by this call.
    pub inserted: usize,
    /// Records that already existed from an earlier pass.
    pub skipped: usize,
    pub warnings: Vec<DistributionWarning>,
    /// Amount stranded at the depth bound.
    pub unresolved_total: u64,
    pub halted: Option<HaltReason>,
}

impl DistributionReport {
    /// True when every reachable amount was handed down to a leaf.
    pub fn is_complete(&self) -> bool {
        self.halted.is_none() && !self.depth_exceeded()
    }

    pub fn cycle_detected(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, DistributionWarning::CycleDetected { .. }))
    }

    pub fn depth_exceeded(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, DistributionWarning::DepthExceeded { .. }))
    }
}

enum Frame {
    Enter {
        person: PersonId,
        generation: u32,
        amount: u64,
        path: PathId,
    },
    Exit(PersonId),
}

#[derive(Default)]
struct Traversal {
    inserted: usize,
    skipped: usize,
    warnings: Vec<DistributionWarning>,
    unresolved_total: u64,
    halted: Option<HaltReason>,
}

impl Traversal {
    fn cycles(&mut self, parent: PersonId, generation: u32, looped: Vec<PersonId>) {
        for child in looped {
            warn!(%parent, %child, generation, "cycle detected; child excluded from split");
            self.warnings.push(DistributionWarning::CycleDetected {
                parent,
                child,
                generation,
            });
        }
    }

    fn cycle_count(&self) -> u32 {
        self.warnings
            .iter()
            .filter(|w| matches!(w, DistributionWarning::CycleDetected { .. }))
            .count() as u32
    }
}

/// Expands seed obligations into per-descendant records.
pub struct InheritanceEngine {
    people: Arc<dyn PersonStore>,
    repo: Arc<dyn ObligationRepository>,
}

impl InheritanceEngine {
    pub fn new(people: Arc<dyn PersonStore>, repo: Arc<dyn ObligationRepository>) -> Self {
        Self { people, repo }
    }

    /// Distribute `root_amount` from `root_id` down its descendant graph.
    ///
    /// With no active run for `(root_id, kind)` a new run is created. An
    /// active run with the same amount is re-traversed, which skips records
    /// already written and resumes a halted run; re-traversal always uses
    /// the run's stored depth. An active run with a different amount is
    /// an error: existing records are never recalculated in place, use
    /// [`redistribute`](Self::redistribute) instead.
    ///
    /// A root with no children other than itself yields an empty report and
    /// persists nothing. If the run is voided while it is being walked, the
    /// void stands and this fails with [`DistributionError::RunVoided`].
    pub fn distribute(
        &self,
        root_id: PersonId,
        root_amount: u64,
        kind: ObligationKind,
        options: &DistributeOptions,
    ) -> Result<DistributionReport, LineageError> {
        self.validate_seed(root_id, root_amount, options)?;

        let existing = self.repo.runs_for_root(root_id, kind)?;
        let has_active = existing.iter().any(DistributionRun::is_active);
        let children = normalize_children(self.people.children(root_id)?);
        if !has_active && children.iter().all(|c| *c == root_id) {
            debug!(%root_id, %kind, "root has no descendants; nothing to distribute");
            let mut out = Traversal::default();
            out.cycles(root_id, 1, children);
            let mut run =
                DistributionRun::new(root_id, kind, root_amount, options.max_depth, existing.len() as u32);
            run.status = RunStatus::Complete;
            run.cycle_count = out.cycle_count();
            return Ok(DistributionReport {
                run,
                records: Vec::new(),
                inserted: 0,
                skipped: 0,
                warnings: out.warnings,
                unresolved_total: 0,
                halted: None,
            });
        }

        let mut run = self.begin_run(root_id, kind, root_amount, options.max_depth, existing.len() as u32)?;
        let traversal = self.traverse(&run, options)?;
        let records = self.repo.records_for_run(&run.run_id)?;

        run.record_count = records.len() as u64;
        run.unresolved_total = traversal.unresolved_total;
        run.cycle_count = traversal.cycle_count();
        if traversal.halted.is_none() {
            run.status = RunStatus::Complete;
        }
        // A void that landed while we were walking wins.
        let run = self.repo.finish_run(&run)?;
        if run.status == RunStatus::Voided {
            warn!(run_id = %run.run_id, inserted = traversal.inserted, "run voided during distribution");
            return Err(DistributionError::RunVoided(run.run_id.to_string()).into());
        }

        match traversal.halted {
            Some(reason) => warn!(
                run_id = %run.run_id,
                ?reason,
                inserted = traversal.inserted,
                "distribution halted; distribute again to resume"
            ),
            None => info!(
                run_id = %run.run_id,
                records = run.record_count,
                inserted = traversal.inserted,
                unresolved = traversal.unresolved_total,
                cycles = run.cycle_count,
                "distribution complete"
            ),
        }

        Ok(DistributionReport {
            run,
            records,
            inserted: traversal.inserted,
            skipped: traversal.skipped,
            warnings: traversal.warnings,
            unresolved_total: traversal.unresolved_total,
            halted: traversal.halted,
        })
    }

    /// Void the active run for `(root_id, kind)`, if any, and distribute
    /// `root_amount` as a fresh run.
    pub fn redistribute(
        &self,
        root_id: PersonId,
        root_amount: u64,
        kind: ObligationKind,
        options: &DistributeOptions,
    ) -> Result<DistributionReport, LineageError> {
        self.validate_seed(root_id, root_amount, options)?;
        if let Some(active) = self.repo.active_run(root_id, kind)? {
            self.void_run(&active.run_id)?;
        }
        self.distribute(root_id, root_amount, kind, options)
    }

    /// Mark a run voided. Its records stay stored but stop counting toward
    /// matching and balances. Voiding twice is a no-op.
    pub fn void_run(&self, run_id: &RunId) -> Result<DistributionRun, LineageError> {
        let run = self
            .repo
            .void_run(run_id)?
            .ok_or_else(|| DistributionError::RunNotFound(run_id.to_string()))?;
        info!(%run_id, root_id = %run.root_id, kind = %run.kind, "run voided");
        Ok(run)
    }

    fn validate_seed(
        &self,
        root_id: PersonId,
        root_amount: u64,
        options: &DistributeOptions,
    ) -> Result<(), LineageError> {
        validate_amount(root_amount)?;
        if options.max_depth == 0 || options.max_depth > MAX_DEPTH_LIMIT {
            return Err(ValidationError::InvalidDepth {
                got: options.max_depth,
                max: MAX_DEPTH_LIMIT,
            }
            .into());
        }
        if !self.people.person_exists(root_id)? {
            return Err(ValidationError::UnknownPerson(root_id.0).into());
        }
        Ok(())
    }

    fn begin_run(
        &self,
        root_id: PersonId,
        kind: ObligationKind,
        root_amount: u64,
        max_depth: u32,
        sequence: u32,
    ) -> Result<DistributionRun, LineageError> {
        let candidate = DistributionRun::new(root_id, kind, root_amount, max_depth, sequence);
        match self.repo.claim_run(&candidate)? {
            RunClaim::Created(run) => {
                info!(run_id = %run.run_id, %root_id, %kind, root_amount, sequence, "distribution run created");
                Ok(run)
            }
            RunClaim::Existing(run) if run.root_amount == root_amount => {
                debug!(run_id = %run.run_id, status = ?run.status, "re-traversing active run");
                Ok(run)
            }
            RunClaim::Existing(run) => Err(DistributionError::ActiveRunExists {
                run_id: run.run_id.to_string(),
                root_amount: run.root_amount,
            }
            .into()),
        }
    }

    fn traverse(
        &self,
        run: &DistributionRun,
        options: &DistributeOptions,
    ) -> Result<Traversal, LineageError> {
        let mut out = Traversal::default();
        let mut on_path: HashSet<PersonId> = HashSet::new();
        let mut steps: u64 = 0;
        let mut stack = vec![Frame::Enter {
            person: run.root_id,
            generation: 0,
            amount: run.root_amount,
            path: PathId::root(run.root_id),
        }];

        while let Some(frame) = stack.pop() {
            let (person, generation, amount, path) = match frame {
                Frame::Exit(person) => {
                    on_path.remove(&person);
                    continue;
                }
                Frame::Enter {
                    person,
                    generation,
                    amount,
                    path,
                } => (person, generation, amount, path),
            };

            if options.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                out.halted = Some(HaltReason::Cancelled);
                break;
            }

            // A child on the path (or the node itself) cannot take a share.
            let child_generation = generation + 1;
            let (eligible, looped): (Vec<PersonId>, Vec<PersonId>) =
                normalize_children(self.people.children(person)?)
                    .into_iter()
                    .partition(|c| *c != person && !on_path.contains(c));
            if eligible.is_empty() {
                out.cycles(person, child_generation, looped);
                continue;
            }

            if generation >= run.max_depth {
                warn!(run_id = %run.run_id, %person, generation, amount, "depth bound reached with descendants remaining");
                out.unresolved_total = out.unresolved_total.saturating_add(amount);
                out.warnings.push(DistributionWarning::DepthExceeded {
                    person,
                    generation,
                    amount,
                });
                continue;
            }

            if options.step_budget.is_some_and(|budget| steps >= budget) {
                out.halted = Some(HaltReason::BudgetExhausted);
                break;
            }
            steps += 1;

            on_path.insert(person);
            stack.push(Frame::Exit(person));
            out.cycles(person, child_generation, looped);

            let shares = split_evenly(amount, &eligible);
            let sibling_count = eligible.len() as u32;
            let batch: Vec<ObligationRecord> = shares
                .iter()
                .map(|(child, share)| {
                    let key = RecordKey {
                        run_id: run.run_id,
                        generation: child_generation,
                        parent_id: person,
                        descendant_id: *child,
                        path_id: path.extend(*child),
                    };
                    ObligationRecord::new(key, run.kind, run.root_id, amount, *share, sibling_count)
                })
                .collect();

            let inserted = self.repo.insert_records_if_absent(&batch)?;
            out.inserted += inserted;
            out.skipped += batch.len() - inserted;
            debug!(%person, generation, amount, siblings = sibling_count, inserted, "expanded node");

            // Reverse so the smallest child id is expanded first.
            for (child, share) in shares.into_iter().rev() {
                stack.push(Frame::Enter {
                    person: child,
                    generation: child_generation,
                    amount: share,
                    path: path.extend(child),
                });
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lineage_core::constants::SHARE_PRECISION;
    use lineage_core::error::StorageError;
    use lineage_core::memory::{MemoryObligationStore, MemoryPersonStore};
    use lineage_core::types::{PaymentCommit, PaymentId, PaymentRecord};

    const MILLION: u64 = 100_000_000;

    fn setup(edges: &[(u64, u64)]) -> (InheritanceEngine, Arc<MemoryPersonStore>, Arc<MemoryObligationStore>) {
        let people = Arc::new(MemoryPersonStore::new());
        for (parent, child) in edges {
            people.add_edge(PersonId(*parent), PersonId(*child));
        }
        let repo = Arc::new(MemoryObligationStore::new());
        let engine = InheritanceEngine::new(people.clone(), repo.clone());
        (engine, people, repo)
    }

    fn debt(engine: &InheritanceEngine, root: u64, amount: u64) -> DistributionReport {
        engine
            .distribute(PersonId(root), amount, ObligationKind::Debt, &DistributeOptions::default())
            .unwrap()
    }

    fn portions_of(report: &DistributionReport, person: u64) -> Vec<u64> {
        report
            .records
            .iter()
            .filter(|r| r.descendant_id == PersonId(person))
            .map(|r| r.inherited_portion)
            .collect()
    }

    // ------------------------------------------------------------------
    // Splitting
    // ------------------------------------------------------------------

    #[test]
    fn two_children_split_a_million() {
        let (engine, _, _) = setup(&[(1, 2), (1, 3)]);
        let report = debt(&engine, 1, MILLION);

        assert_eq!(report.records.len(), 2);
        for record in &report.records {
            assert_eq!(record.inherited_portion, 50_000_000);
            assert_eq!(record.generation, 1);
            assert_eq!(record.sibling_share_ppb, 500_000_000);
            assert_eq!(record.amount_at_this_level, MILLION);
            assert_eq!(record.amount_outstanding, 50_000_000);
        }
        assert!(report.is_complete());
        assert_eq!(report.run.status, RunStatus::Complete);
    }

    #[test]
    fn grandchildren_split_their_parents_share() {
        let (engine, _, _) = setup(&[(1, 2), (1, 3), (2, 4), (2, 5)]);
        let report = debt(&engine, 1, MILLION);

        assert_eq!(report.records.len(), 4);
        for grandchild in [4, 5] {
            let record = report
                .records
                .iter()
                .find(|r| r.descendant_id == PersonId(grandchild))
                .unwrap();
            assert_eq!(record.inherited_portion, 25_000_000);
            assert_eq!(record.generation, 2);
            assert_eq!(record.parent_id, PersonId(2));
            assert_eq!(record.amount_at_this_level, 50_000_000);
        }
    }

    #[test]
    fn single_child_inherits_everything() {
        let (engine, _, _) = setup(&[(1, 2)]);
        let report = debt(&engine, 1, 12_345);
        assert_eq!(report.records[0].inherited_portion, 12_345);
        assert_eq!(report.records[0].sibling_share_ppb, SHARE_PRECISION);
        assert_eq!(report.records[0].sibling_count, 1);
    }

    #[test]
    fn uneven_split_uses_largest_remainder() {
        let (engine, _, _) = setup(&[(1, 7), (1, 3), (1, 5)]);
        let report = debt(&engine, 1, 100);
        assert_eq!(portions_of(&report, 3), vec![34]);
        assert_eq!(portions_of(&report, 5), vec![33]);
        assert_eq!(portions_of(&report, 7), vec![33]);
    }

    #[test]
    fn duplicate_edges_collapse() {
        let (engine, _, _) = setup(&[(1, 2), (1, 2), (1, 3)]);
        let report = debt(&engine, 1, 100);
        assert_eq!(report.records.len(), 2);
        assert!(report.records.iter().all(|r| r.sibling_count == 2));
    }

    #[test]
    fn diamond_conserves_money_below_shared_descendant() {
        // 1 -> {2, 3}, both -> 4, 4 -> 5
        let (engine, _, _) = setup(&[(1, 2), (1, 3), (2, 4), (3, 4), (4, 5)]);
        let report = debt(&engine, 1, 1_000);

        assert_eq!(portions_of(&report, 4), vec![500, 500]);
        assert_eq!(portions_of(&report, 5), vec![500, 500]);
        let leaf_total: u64 = portions_of(&report, 5).iter().sum();
        assert_eq!(leaf_total, 1_000);
    }

    // ------------------------------------------------------------------
    // Validation and empty roots
    // ------------------------------------------------------------------

    #[test]
    fn root_without_children_writes_nothing() {
        let (engine, people, repo) = setup(&[]);
        people.add_person(PersonId(1));
        let report = debt(&engine, 1, MILLION);

        assert!(report.records.is_empty());
        assert!(report.is_complete());
        assert_eq!(repo.record_count(), 0);
        assert!(repo.runs_for_root(PersonId(1), ObligationKind::Debt).unwrap().is_empty());
    }

    #[test]
    fn root_with_only_a_self_loop_writes_nothing() {
        let (engine, _, repo) = setup(&[(1, 1), (1, 1)]);
        let report = debt(&engine, 1, 500);

        assert!(report.records.is_empty());
        assert!(report.cycle_detected());
        assert_eq!(report.run.cycle_count, 1);
        assert_eq!(repo.record_count(), 0);
        assert!(repo.runs_for_root(PersonId(1), ObligationKind::Debt).unwrap().is_empty());
    }

    #[test]
    fn rejects_invalid_seeds_before_writing() {
        let (engine, _, repo) = setup(&[(1, 2)]);
        let opts = DistributeOptions::default();

        let err = engine.distribute(PersonId(9), 100, ObligationKind::Debt, &opts).unwrap_err();
        assert!(matches!(err, LineageError::Validation(ValidationError::UnknownPerson(9))));

        let err = engine.distribute(PersonId(1), 0, ObligationKind::Debt, &opts).unwrap_err();
        assert!(matches!(err, LineageError::Validation(ValidationError::NonPositiveAmount)));

        let err = engine
            .distribute(PersonId(1), 100, ObligationKind::Debt, &opts.clone().with_max_depth(0))
            .unwrap_err();
        assert!(matches!(err, LineageError::Validation(ValidationError::InvalidDepth { .. })));

        assert_eq!(repo.record_count(), 0);
    }

    // ------------------------------------------------------------------
    // Bounds
    // ------------------------------------------------------------------

    #[test]
    fn depth_bound_reports_unresolved_amount() {
        let chain: Vec<(u64, u64)> = (1..15).map(|i| (i, i + 1)).collect();
        let (engine, _, _) = setup(&chain);
        let opts = DistributeOptions::default().with_max_depth(3);
        let report = engine
            .distribute(PersonId(1), 900, ObligationKind::Debt, &opts)
            .unwrap();

        assert_eq!(report.records.len(), 3);
        assert_eq!(report.records.iter().map(|r| r.generation).max(), Some(3));
        assert_eq!(report.unresolved_total, 900);
        assert!(report.depth_exceeded());
        assert!(!report.is_complete());
        assert_eq!(
            report.warnings,
            vec![DistributionWarning::DepthExceeded {
                person: PersonId(4),
                generation: 3,
                amount: 900
            }]
        );
        assert_eq!(report.run.unresolved_total, 900);
    }

    #[test]
    fn leaf_at_depth_bound_is_not_unresolved() {
        let (engine, _, _) = setup(&[(1, 2), (2, 3)]);
        let opts = DistributeOptions::default().with_max_depth(2);
        let report = engine.distribute(PersonId(1), 10, ObligationKind::Debt, &opts).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.unresolved_total, 0);
    }

    #[test]
    fn back_edge_to_ancestor_terminates_with_warning() {
        // 1 -> 2 -> 3 -> {1, 4}
        let (engine, _, _) = setup(&[(1, 2), (2, 3), (3, 1), (3, 4)]);
        let report = debt(&engine, 1, 600);

        assert!(report.cycle_detected());
        assert!(report.records.iter().all(|r| r.descendant_id != PersonId(1)));
        assert_eq!(portions_of(&report, 4), vec![600]);
        assert_eq!(report.run.cycle_count, 1);
        assert!(report.is_complete());
    }

    #[test]
    fn fully_looped_node_keeps_its_amount() {
        let (engine, _, _) = setup(&[(1, 2), (2, 1)]);
        let report = debt(&engine, 1, 500);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].inherited_portion, 500);
        assert!(report.cycle_detected());
    }

    #[test]
    fn back_edge_at_depth_bound_is_a_leaf() {
        let (engine, _, _) = setup(&[(1, 2), (2, 1)]);
        let opts = DistributeOptions::default().with_max_depth(1);
        let report = engine.distribute(PersonId(1), 100, ObligationKind::Debt, &opts).unwrap();

        assert_eq!(portions_of(&report, 2), vec![100]);
        assert_eq!(report.unresolved_total, 0);
        assert!(!report.depth_exceeded());
        assert!(report.cycle_detected());
        assert!(report.is_complete());
    }

    #[test]
    fn depth_bound_ignores_looped_children() {
        // 3 sits at the bound with a back-edge to 1 and a real child 4.
        let (engine, _, _) = setup(&[(1, 2), (2, 3), (3, 1), (3, 4)]);
        let opts = DistributeOptions::default().with_max_depth(2);
        let report = engine.distribute(PersonId(1), 60, ObligationKind::Debt, &opts).unwrap();
        assert_eq!(
            report.warnings,
            vec![DistributionWarning::DepthExceeded {
                person: PersonId(3),
                generation: 2,
                amount: 60
            }]
        );
    }

    #[test]
    fn self_loop_is_excluded() {
        let (engine, _, _) = setup(&[(1, 2), (2, 2), (2, 3)]);
        let report = debt(&engine, 1, 80);
        assert_eq!(portions_of(&report, 3), vec![80]);
        assert_eq!(portions_of(&report, 2), vec![80]);
        assert!(report.cycle_detected());
    }

    #[test]
    fn sibling_revisit_is_not_a_cycle() {
        // 3 appears under both 2 and 4, never on its own path.
        let (engine, _, _) = setup(&[(1, 2), (1, 4), (2, 3), (4, 3)]);
        let report = debt(&engine, 1, 100);
        assert!(!report.cycle_detected());
        assert_eq!(portions_of(&report, 3), vec![50, 50]);
    }

    #[test]
    fn step_budget_halts_and_rerun_resumes() {
        let (engine, _, _) = setup(&[(1, 2), (1, 3), (2, 4), (2, 5), (3, 6)]);
        let full = {
            let (reference, _, _) = setup(&[(1, 2), (1, 3), (2, 4), (2, 5), (3, 6)]);
            debt(&reference, 1, 1_000).records
        };

        let opts = DistributeOptions::default().with_step_budget(1);
        let halted = engine.distribute(PersonId(1), 1_000, ObligationKind::Debt, &opts).unwrap();
        assert_eq!(halted.halted, Some(HaltReason::BudgetExhausted));
        assert_eq!(halted.run.status, RunStatus::InProgress);
        assert_eq!(halted.records.len(), 2);
        assert!(!halted.is_complete());

        let resumed = debt(&engine, 1, 1_000);
        assert_eq!(resumed.run.run_id, halted.run.run_id);
        assert_eq!(resumed.run.status, RunStatus::Complete);
        assert_eq!(resumed.skipped, 2);
        assert_eq!(resumed.inserted, 3);
        assert_eq!(resumed.records, full);
    }

    #[test]
    fn cancelled_token_stops_before_expanding() {
        let (engine, _, repo) = setup(&[(1, 2)]);
        let token = CancelToken::new();
        token.cancel();
        let opts = DistributeOptions::default().with_cancel(token);
        let report = engine.distribute(PersonId(1), 100, ObligationKind::Debt, &opts).unwrap();
        assert_eq!(report.halted, Some(HaltReason::Cancelled));
        assert_eq!(repo.record_count(), 0);
        assert_eq!(report.run.status, RunStatus::InProgress);
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    #[test]
    fn distributing_twice_is_idempotent() {
        let (engine, _, repo) = setup(&[(1, 2), (1, 3), (2, 4)]);
        let first = debt(&engine, 1, MILLION);
        let second = debt(&engine, 1, MILLION);

        assert_eq!(first.run.run_id, second.run.run_id);
        assert_eq!(first.records, second.records);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped, 3);
        assert_eq!(repo.record_count(), 3);
    }

    #[test]
    fn different_amount_with_active_run_is_rejected() {
        let (engine, _, repo) = setup(&[(1, 2)]);
        let first = debt(&engine, 1, 100);
        let err = engine
            .distribute(PersonId(1), 200, ObligationKind::Debt, &DistributeOptions::default())
            .unwrap_err();
        match err {
            LineageError::Distribution(DistributionError::ActiveRunExists { run_id, root_amount }) => {
                assert_eq!(run_id, first.run.run_id.to_string());
                assert_eq!(root_amount, 100);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(repo.record_count(), 1);
    }

    #[test]
    fn debt_and_credit_runs_are_independent() {
        let (engine, _, _) = setup(&[(1, 2)]);
        debt(&engine, 1, 100);
        let credit = engine
            .distribute(PersonId(1), 300, ObligationKind::Credit, &DistributeOptions::default())
            .unwrap();
        assert_eq!(credit.records[0].kind, ObligationKind::Credit);
        assert_eq!(credit.records[0].inherited_portion, 300);
    }

    #[test]
    fn redistribute_voids_and_creates_new_run() {
        let (engine, _, repo) = setup(&[(1, 2), (1, 3)]);
        let old = debt(&engine, 1, 100);
        let new = engine
            .redistribute(PersonId(1), 300, ObligationKind::Debt, &DistributeOptions::default())
            .unwrap();

        assert_ne!(old.run.run_id, new.run.run_id);
        assert_eq!(new.run.sequence, 1);
        assert_eq!(repo.get_run(&old.run.run_id).unwrap().unwrap().status, RunStatus::Voided);
        assert_eq!(repo.record_count(), 4);
        assert_eq!(
            repo.active_run(PersonId(1), ObligationKind::Debt).unwrap().unwrap().run_id,
            new.run.run_id
        );
    }

    #[test]
    fn redistribute_validates_before_voiding() {
        let (engine, _, repo) = setup(&[(1, 2)]);
        let old = debt(&engine, 1, 100);
        assert!(engine
            .redistribute(PersonId(1), 0, ObligationKind::Debt, &DistributeOptions::default())
            .is_err());
        assert!(repo.get_run(&old.run.run_id).unwrap().unwrap().is_active());
    }

    #[test]
    fn void_is_idempotent_and_frees_the_root() {
        let (engine, _, _) = setup(&[(1, 2)]);
        let run = debt(&engine, 1, 100).run;
        assert_eq!(engine.void_run(&run.run_id).unwrap().status, RunStatus::Voided);
        assert_eq!(engine.void_run(&run.run_id).unwrap().status, RunStatus::Voided);
        let next = debt(&engine, 1, 250);
        assert_eq!(next.run.sequence, 1);
    }

    /// Voids the run once, just before the engine stores its outcome, as a
    /// concurrent `void_run` landing mid-walk would.
    struct VoidBeforeFinish {
        inner: MemoryObligationStore,
        armed: AtomicBool,
    }

    impl ObligationRepository for VoidBeforeFinish {
        fn claim_run(&self, candidate: &DistributionRun) -> Result<RunClaim, StorageError> {
            self.inner.claim_run(candidate)
        }
        fn finish_run(&self, run: &DistributionRun) -> Result<DistributionRun, StorageError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.inner.void_run(&run.run_id)?;
            }
            self.inner.finish_run(run)
        }
        fn void_run(&self, run_id: &RunId) -> Result<Option<DistributionRun>, StorageError> {
            self.inner.void_run(run_id)
        }
        fn get_run(&self, run_id: &RunId) -> Result<Option<DistributionRun>, StorageError> {
            self.inner.get_run(run_id)
        }
        fn runs_for_root(
            &self,
            root_id: PersonId,
            kind: ObligationKind,
        ) -> Result<Vec<DistributionRun>, StorageError> {
            self.inner.runs_for_root(root_id, kind)
        }
        fn insert_records_if_absent(&self, records: &[ObligationRecord]) -> Result<usize, StorageError> {
            self.inner.insert_records_if_absent(records)
        }
        fn get_record(&self, key: &RecordKey) -> Result<Option<ObligationRecord>, StorageError> {
            self.inner.get_record(key)
        }
        fn records_for_run(&self, run_id: &RunId) -> Result<Vec<ObligationRecord>, StorageError> {
            self.inner.records_for_run(run_id)
        }
        fn records_for_person(
            &self,
            person: PersonId,
            kind: ObligationKind,
        ) -> Result<Vec<ObligationRecord>, StorageError> {
            self.inner.records_for_person(person, kind)
        }
        fn commit_payment(&self, commit: &PaymentCommit) -> Result<(), StorageError> {
            self.inner.commit_payment(commit)
        }
        fn get_payment(&self, payment_id: &PaymentId) -> Result<Option<PaymentRecord>, StorageError> {
            self.inner.get_payment(payment_id)
        }
        fn payments_for_person(&self, person: PersonId) -> Result<Vec<PaymentRecord>, StorageError> {
            self.inner.payments_for_person(person)
        }
    }

    #[test]
    fn void_during_walk_is_not_overwritten() {
        let people = Arc::new(MemoryPersonStore::new());
        people.add_edge(PersonId(1), PersonId(2));
        people.add_edge(PersonId(1), PersonId(3));
        let repo = Arc::new(VoidBeforeFinish {
            inner: MemoryObligationStore::new(),
            armed: AtomicBool::new(true),
        });
        let engine = InheritanceEngine::new(people, repo.clone());
        let opts = DistributeOptions::default();

        let err = engine
            .distribute(PersonId(1), 100, ObligationKind::Debt, &opts)
            .unwrap_err();
        assert!(matches!(err, LineageError::Distribution(DistributionError::RunVoided(_))));
        let runs = repo.runs_for_root(PersonId(1), ObligationKind::Debt).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Voided);
        assert!(repo.active_run(PersonId(1), ObligationKind::Debt).unwrap().is_none());

        let next = engine
            .redistribute(PersonId(1), 300, ObligationKind::Debt, &opts)
            .unwrap();
        let active: Vec<DistributionRun> = repo
            .runs_for_root(PersonId(1), ObligationKind::Debt)
            .unwrap()
            .into_iter()
            .filter(DistributionRun::is_active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].run_id, next.run.run_id);
        assert_eq!(active[0].status, RunStatus::Complete);
    }

    #[test]
    fn void_unknown_run_fails() {
        let (engine, _, _) = setup(&[]);
        let err = engine.void_run(&RunId([3; 32])).unwrap_err();
        assert!(matches!(err, LineageError::Distribution(DistributionError::RunNotFound(_))));
    }
}
