//! The step execution model: apply/rollback payloads, grouping,
//! transactional vs. non-transactional wrappers, and per-step error
//! tolerance.

use std::collections::HashMap;
use std::io::Write;

use log::{debug, error, info, warn};

use crate::backend::BackendAdapter;
use crate::error::Error;
use crate::value::{QueryResult, Value};

/// Which directions a step is allowed to swallow a database error for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IgnoreErrors {
    #[default]
    None,
    Apply,
    Rollback,
    All,
}

impl IgnoreErrors {
    fn matches(self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (IgnoreErrors::All, _)
                | (IgnoreErrors::Apply, Direction::Apply)
                | (IgnoreErrors::Rollback, Direction::Rollback)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Apply,
    Rollback,
}

/// The body of a step: either a SQL statement run through the backend, or
/// an arbitrary callback given direct access to it (the scripted-migration
/// equivalent of a raw connection callable).
pub enum StepPayload<B: BackendAdapter> {
    Sql(String),
    Scripted(Box<dyn Fn(&mut B) -> Result<(), Error> + Send + Sync>),
}

/// One executable unit within a migration: an apply payload, an optional
/// rollback payload, and the error-tolerance policy for both directions.
pub struct Step<B: BackendAdapter> {
    pub index: usize,
    pub apply_payload: Option<StepPayload<B>>,
    pub rollback_payload: Option<StepPayload<B>>,
    pub ignore_errors: IgnoreErrors,
}

impl<B: BackendAdapter> Step<B> {
    pub fn new(index: usize, apply: Option<StepPayload<B>>, rollback: Option<StepPayload<B>>) -> Self {
        Step {
            index,
            apply_payload: apply,
            rollback_payload: rollback,
            ignore_errors: IgnoreErrors::None,
        }
    }

    pub fn ignore_errors(mut self, policy: IgnoreErrors) -> Self {
        self.ignore_errors = policy;
        self
    }

    fn run_payload(
        payload: &Option<StepPayload<B>>,
        backend: &mut B,
        out: &mut dyn Write,
    ) -> Result<(), Error> {
        let payload = match payload {
            None => return Ok(()),
            Some(p) => p,
        };
        match payload {
            StepPayload::Sql(sql) => {
                debug!(" - executing {sql:?}");
                let result = backend.execute(sql, &HashMap::new())?;
                write_result_table(&result, out);
                Ok(())
            }
            StepPayload::Scripted(callback) => callback(backend),
        }
    }

    /// Run the apply payload. When `use_transactions` is set (the enclosing
    /// migration's setting), the payload runs inside a `transaction()`
    /// scope (a savepoint, if the engine already has a transaction open for
    /// the whole migration); on a tolerated error the scope is rolled back
    /// rather than committed. When unset, the payload runs directly with no
    /// surrounding scope, matching a non-transactional wrapper.
    pub fn apply(
        &self,
        backend: &mut B,
        use_transactions: bool,
        force: bool,
        out: &mut dyn Write,
    ) -> Result<(), Error> {
        info!(" - applying step {}", self.index);
        self.run(Direction::Apply, &self.apply_payload, backend, use_transactions, force, out)
    }

    pub fn rollback(
        &self,
        backend: &mut B,
        use_transactions: bool,
        force: bool,
        out: &mut dyn Write,
    ) -> Result<(), Error> {
        info!(" - rolling back step {}", self.index);
        self.run(
            Direction::Rollback,
            &self.rollback_payload,
            backend,
            use_transactions,
            force,
            out,
        )
    }

    fn run(
        &self,
        direction: Direction,
        payload: &Option<StepPayload<B>>,
        backend: &mut B,
        use_transactions: bool,
        force: bool,
        out: &mut dyn Write,
    ) -> Result<(), Error> {
        let tolerate = |err: Error| -> Result<(), Error> {
            error!("ignored error in step {}: {err}", self.index);
            Ok(())
        };

        if use_transactions {
            let mut scope = GenericTransactionScope::open(backend)?;
            let result = Self::run_payload(payload, scope.backend(), out);
            match result {
                Ok(()) => {
                    scope.finish(true)?;
                    Ok(())
                }
                Err(err) if force || self.ignore_errors.matches(direction) => {
                    scope.finish(false)?;
                    tolerate(err)
                }
                Err(err) => {
                    scope.finish(false)?;
                    Err(err)
                }
            }
        } else {
            match Self::run_payload(payload, backend, out) {
                Ok(()) => Ok(()),
                Err(err) if force || self.ignore_errors.matches(direction) => tolerate(err),
                Err(err) => Err(err),
            }
        }
    }
}

/// A transaction/savepoint scope generic over the concrete backend type,
/// used for step execution so that a scripted step's callback keeps access
/// to `&mut B` rather than a type-erased `&mut dyn BackendAdapter`.
///
/// Mirrors [`crate::backend::TransactionScope`]'s semantics exactly; kept
/// as a separate, smaller type because the ledger and lock manager have no
/// need for the concrete type and use the `dyn`-based scope instead.
struct GenericTransactionScope<'a, B: BackendAdapter> {
    backend: &'a mut B,
    savepoint_id: Option<String>,
    finished: bool,
}

impl<'a, B: BackendAdapter> GenericTransactionScope<'a, B> {
    fn open(backend: &'a mut B) -> Result<Self, Error> {
        let savepoint_id = if backend.in_transaction() {
            let id = format!("sp_{:x}", next_savepoint_counter());
            backend.savepoint(&id)?;
            Some(id)
        } else {
            backend.begin()?;
            None
        };
        Ok(GenericTransactionScope {
            backend,
            savepoint_id,
            finished: false,
        })
    }

    fn backend(&mut self) -> &mut B {
        &mut *self.backend
    }

    fn finish(&mut self, succeeded: bool) -> Result<(), Error> {
        self.finished = true;
        match (&self.savepoint_id, succeeded) {
            (Some(id), true) => self.backend.savepoint_release(id),
            (Some(id), false) => self.backend.savepoint_rollback(id),
            (None, true) => self.backend.commit(),
            (None, false) => self.backend.rollback(),
        }
    }
}

impl<'a, B: BackendAdapter> Drop for GenericTransactionScope<'a, B> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.finish(false);
        }
    }
}

fn next_savepoint_counter() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Runs every step of a migration, in `direction`, inside one enclosing
/// `transaction()` (or `disable_transactions()`) scope for the whole
/// sequence. Each step's own wrapper in [`Step::run`] then opens a savepoint
/// nested inside this scope rather than an independent top-level
/// transaction, so a later step's failure can unwind everything the
/// migration did, not just that one step.
///
/// On a database error: if DDL is transactional and the migration uses
/// transactions, the enclosing scope's rollback (on drop, since it never
/// gets `finish(true)`) undoes the whole migration; re-raise so the caller
/// sees the failure. Otherwise DDL has already been committed out from
/// under us as each step ran, so best-effort undo every previously executed
/// step in reverse before re-raising.
pub(crate) fn run_steps<B: BackendAdapter>(
    steps: &[CollectedStepHandle<B>],
    direction: Direction,
    backend: &mut B,
    use_transactions: bool,
    force: bool,
    has_transactional_ddl: bool,
    out: &mut dyn Write,
) -> Result<(), Error> {
    if use_transactions {
        let mut scope = GenericTransactionScope::open(backend)?;
        let result = run_steps_inner(
            steps,
            direction,
            scope.backend(),
            use_transactions,
            force,
            has_transactional_ddl,
            out,
        );
        scope.finish(result.is_ok())?;
        result
    } else {
        {
            let _scope = crate::backend::disable_transactions(backend)?;
        }
        run_steps_inner(steps, direction, backend, use_transactions, force, has_transactional_ddl, out)
    }
}

fn run_steps_inner<B: BackendAdapter>(
    steps: &[CollectedStepHandle<B>],
    direction: Direction,
    backend: &mut B,
    use_transactions: bool,
    force: bool,
    has_transactional_ddl: bool,
    out: &mut dyn Write,
) -> Result<(), Error> {
    let ordered: Vec<&CollectedStepHandle<B>> = match direction {
        Direction::Apply => steps.iter().collect(),
        Direction::Rollback => steps.iter().rev().collect(),
    };

    let mut executed = Vec::new();
    for step in ordered {
        let result = match direction {
            Direction::Apply => step.apply(backend, use_transactions, force, out),
            Direction::Rollback => step.rollback(backend, use_transactions, force, out),
        };
        match result {
            Ok(()) => executed.push(step),
            Err(err) => {
                if has_transactional_ddl && use_transactions {
                    return Err(err);
                }
                warn!(
                    "step failed on non-transactional-DDL backend; compensating undo of {} prior step(s)",
                    executed.len()
                );
                for done in executed.into_iter().rev() {
                    let compensate = match direction {
                        Direction::Apply => done.rollback(backend, use_transactions, true, out),
                        Direction::Rollback => done.apply(backend, use_transactions, true, out),
                    };
                    if let Err(compensate_err) = compensate {
                        warn!("compensating undo failed: {compensate_err}");
                    }
                }
                return Err(err);
            }
        }
    }
    Ok(())
}

/// An ordered sequence of child steps treated as a single unit: apply runs
/// children in order, rollback in reverse order, and `ignore_errors`
/// applies to the group as a whole rather than to individual children.
pub struct StepGroup<B: BackendAdapter> {
    pub children: Vec<Step<B>>,
    pub ignore_errors: IgnoreErrors,
}

impl<B: BackendAdapter> StepGroup<B> {
    pub fn apply(
        &self,
        backend: &mut B,
        use_transactions: bool,
        force: bool,
        out: &mut dyn Write,
    ) -> Result<(), Error> {
        for child in &self.children {
            let force = force || self.ignore_errors.matches(Direction::Apply);
            child.apply(backend, use_transactions, force, out)?;
        }
        Ok(())
    }

    pub fn rollback(
        &self,
        backend: &mut B,
        use_transactions: bool,
        force: bool,
        out: &mut dyn Write,
    ) -> Result<(), Error> {
        for child in self.children.iter().rev() {
            let force = force || self.ignore_errors.matches(Direction::Rollback);
            child.rollback(backend, use_transactions, force, out)?;
        }
        Ok(())
    }
}

fn write_result_table(result: &QueryResult, out: &mut dyn Write) {
    if result.columns.is_empty() || result.rows.is_empty() {
        return;
    }

    let mut widths: Vec<usize> = result.columns.iter().map(|c| c.len()).collect();
    let rendered: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|row| row.0.iter().map(render_value).collect())
        .collect();
    for row in &rendered {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let _ = writeln!(
        out,
        "{}",
        result
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| format!(" {name:<width$} ", width = widths[i]))
            .collect::<Vec<_>>()
            .join("|")
    );
    let _ = writeln!(
        out,
        "{}",
        widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+")
    );
    for row in &rendered {
        let _ = writeln!(
            out,
            "{}",
            row.iter()
                .enumerate()
                .map(|(i, cell)| format!(" {cell:<width$} ", width = widths[i]))
                .collect::<Vec<_>>()
                .join("|")
        );
    }
    let noun = if result.rows.len() == 1 { "row" } else { "rows" };
    let _ = writeln!(out, "({} {noun})", result.rows.len());
}

fn render_value(value: &Value) -> String {
    value.to_string()
}

/// Passed to [`crate::step::ScriptedMigration::build`]; mirrors the source
/// library's `step`/`group` free functions as methods on an explicit
/// collector value rather than functions that register into call-stack
/// state.
pub struct StepCollector<B: BackendAdapter> {
    steps: Vec<CollectedStep<B>>,
}

enum CollectedStep<B: BackendAdapter> {
    Single(Step<B>),
    Group(StepGroup<B>),
}

impl<B: BackendAdapter> StepCollector<B> {
    pub fn new() -> Self {
        StepCollector { steps: Vec::new() }
    }

    pub fn step(&mut self, apply: StepPayload<B>, rollback: Option<StepPayload<B>>) -> &mut Self {
        let index = self.steps.len();
        self.steps
            .push(CollectedStep::Single(Step::new(index, Some(apply), rollback)));
        self
    }

    pub fn step_ignoring_errors(
        &mut self,
        apply: StepPayload<B>,
        rollback: Option<StepPayload<B>>,
        ignore_errors: IgnoreErrors,
    ) -> &mut Self {
        let index = self.steps.len();
        self.steps.push(CollectedStep::Single(
            Step::new(index, Some(apply), rollback).ignore_errors(ignore_errors),
        ));
        self
    }

    /// Group the last `n` collected steps into a single `StepGroup`,
    /// mirroring `group(a, b, ...)` consuming its argument step builders
    /// out of the top-level sequence.
    pub fn group_last(&mut self, n: usize, ignore_errors: IgnoreErrors) -> &mut Self {
        let start = self.steps.len().saturating_sub(n);
        let drained: Vec<Step<B>> = self
            .steps
            .drain(start..)
            .map(|s| match s {
                CollectedStep::Single(step) => step,
                CollectedStep::Group(_) => {
                    panic!("group_last cannot re-group an already-grouped step")
                }
            })
            .collect();
        self.steps.push(CollectedStep::Group(StepGroup {
            children: drained,
            ignore_errors,
        }));
        self
    }

    pub fn into_steps(self) -> Vec<CollectedStepHandle<B>> {
        self.steps.into_iter().map(CollectedStepHandle).collect()
    }
}

impl<B: BackendAdapter> Default for StepCollector<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque handle over a collected step or group, applied/rolled back
/// uniformly by the engine without needing to match on the variant.
pub struct CollectedStepHandle<B: BackendAdapter>(CollectedStep<B>);

impl<B: BackendAdapter> CollectedStepHandle<B> {
    pub fn apply(
        &self,
        backend: &mut B,
        use_transactions: bool,
        force: bool,
        out: &mut dyn Write,
    ) -> Result<(), Error> {
        match &self.0 {
            CollectedStep::Single(step) => step.apply(backend, use_transactions, force, out),
            CollectedStep::Group(group) => group.apply(backend, use_transactions, force, out),
        }
    }

    pub fn rollback(
        &self,
        backend: &mut B,
        use_transactions: bool,
        force: bool,
        out: &mut dyn Write,
    ) -> Result<(), Error> {
        match &self.0 {
            CollectedStep::Single(step) => step.rollback(backend, use_transactions, force, out),
            CollectedStep::Group(group) => group.rollback(backend, use_transactions, force, out),
        }
    }
}

/// A scripted migration: a Rust value that builds its steps through an
/// explicit collector rather than relying on call-stack introspection or a
/// global registry.
pub trait ScriptedMigration<B: BackendAdapter>: Send + Sync {
    fn depends(&self) -> &[&str] {
        &[]
    }

    fn use_transactions(&self) -> bool {
        true
    }

    fn build(&self, steps: &mut StepCollector<B>);
}
