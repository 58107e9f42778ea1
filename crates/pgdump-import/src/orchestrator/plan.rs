//! Phase queue and batch construction.

use crate::config::{ExecutionOrder, ResumePoint};
use crate::parser::{Statement, StatementKind};
use crate::session::ImportPhase;
use std::collections::HashMap;

/// A statement scheduled for execution together with its reporting phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedStatement {
    /// Index into the parsed file's statement list.
    pub index: usize,
    pub phase: ImportPhase,
}

/// Statements sent to the execution channel in one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub items: Vec<PlannedStatement>,
    /// Position among the batches sharing this batch's phase.
    pub ordinal: usize,
}

impl Batch {
    /// Phase of the first statement, used for progress reporting.
    pub fn phase(&self) -> Option<ImportPhase> {
        self.items.first().map(|i| i.phase)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub batches: Vec<Batch>,
    pub total_statements: usize,
}

impl ExecutionPlan {
    /// Plan that dispatches `items` as given, `batch_size` at a time.
    pub fn chunked(items: &[PlannedStatement], batch_size: usize) -> Self {
        Self {
            batches: chunk(items, batch_size.max(1)),
            total_statements: items.len(),
        }
    }

    /// Statements in dispatch order.
    pub fn statements(&self) -> impl Iterator<Item = &PlannedStatement> {
        self.batches.iter().flat_map(|b| b.items.iter())
    }

    /// Index of the first batch still to run when resuming at `point`.
    ///
    /// Earlier phases count as complete. If the phase has fewer batches
    /// than `point` claims, execution continues after its last one.
    /// `None` when the phase does not occur in this plan.
    pub fn resume_position(&self, point: &ResumePoint) -> Option<usize> {
        let mut after_phase = None;
        for (position, batch) in self.batches.iter().enumerate() {
            if batch.phase() != Some(point.phase) {
                continue;
            }
            if batch.ordinal >= point.batch_index {
                return Some(position);
            }
            after_phase = Some(position + 1);
        }
        after_phase
    }

    /// Drop the first `count` batches. Returns the statements removed.
    pub fn skip_batches(&mut self, count: usize) -> usize {
        let count = count.min(self.batches.len());
        let skipped: usize = self.batches.drain(..count).map(|b| b.len()).sum();
        self.total_statements -= skipped;
        skipped
    }
}

/// Phase sequence for a phased order. File order has none.
pub fn phase_sequence(order: ExecutionOrder) -> &'static [ImportPhase] {
    use ImportPhase::*;
    match order {
        ExecutionOrder::SchemaFirst => &[Schema, Data, Constraints, Indexes, Functions, Policies],
        ExecutionOrder::DataFirst => &[Schema, Data, Indexes, Constraints, Functions, Policies],
        ExecutionOrder::FileOrder => &[],
    }
}

/// Build the execution plan for `statements`, which must already be
/// filtered and, for phased orders, have their data statements ordered.
///
/// Batches never mix phases and never exceed `batch_size` statements.
pub fn build_plan(statements: &[&Statement], order: ExecutionOrder, batch_size: usize) -> ExecutionPlan {
    let batch_size = batch_size.max(1);
    let planned: Vec<PlannedStatement> = match order {
        ExecutionOrder::FileOrder => {
            let mut in_file: Vec<&&Statement> = statements.iter().collect();
            in_file.sort_by_key(|s| s.index);
            in_file
                .into_iter()
                .map(|s| PlannedStatement {
                    index: s.index,
                    phase: ImportPhase::of_kind(s.kind),
                })
                .collect()
        }
        phased => phase_sequence(phased)
            .iter()
            .flat_map(|phase| {
                statements
                    .iter()
                    .filter(move |s| ImportPhase::of_kind(s.kind) == *phase)
                    .map(move |s| PlannedStatement {
                        index: s.index,
                        phase: *phase,
                    })
            })
            .collect(),
    };

    let total_statements = planned.len();
    let batches = match order {
        ExecutionOrder::FileOrder => chunk(&planned, batch_size),
        _ => {
            let mut batches = Vec::new();
            let mut start = 0;
            while start < planned.len() {
                let phase = planned[start].phase;
                let end = planned[start..]
                    .iter()
                    .position(|p| p.phase != phase)
                    .map_or(planned.len(), |off| start + off);
                batches.extend(chunk(&planned[start..end], batch_size));
                start = end;
            }
            batches
        }
    };

    ExecutionPlan {
        batches,
        total_statements,
    }
}

fn chunk(items: &[PlannedStatement], size: usize) -> Vec<Batch> {
    let mut ordinals: HashMap<ImportPhase, usize> = HashMap::new();
    items
        .chunks(size)
        .map(|c| {
            let ordinal = ordinals.entry(c[0].phase).or_insert(0);
            let batch = Batch {
                items: c.to_vec(),
                ordinal: *ordinal,
            };
            *ordinal += 1;
            batch
        })
        .collect()
}

/// Whether the statement creates a table that may already exist.
pub(crate) fn is_table_creation(stmt: &Statement) -> bool {
    stmt.kind == StatementKind::TableDdl && stmt.target.is_some()
}
