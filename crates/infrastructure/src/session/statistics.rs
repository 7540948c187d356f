//! Statement instrumentation.

use crate::query::{CompiledQuery, StatementKind};
use serde::Serialize;

/// One statement sent to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatementRecord {
    #[serde(skip)]
    pub kind: StatementKind,
    pub sql: String,
    pub params: usize,
}

/// Counters for one session.
///
/// Every statement is recorded before it reaches the store, so a statement
/// that fails still counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStatistics {
    statements: Vec<StatementRecord>,
    flushes: u64,
    entities_loaded: u64,
}

impl SessionStatistics {
    pub(crate) fn record(&mut self, query: &CompiledQuery) {
        self.statements.push(StatementRecord {
            kind: query.kind(),
            sql: query.sql.clone(),
            params: query.params.len(),
        });
    }

    pub(crate) fn record_flush(&mut self) {
        self.flushes += 1;
    }

    pub(crate) fn record_loaded(&mut self, count: u64) {
        self.entities_loaded += count;
    }

    /// Every statement in execution order.
    pub fn statements(&self) -> &[StatementRecord] {
        &self.statements
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    /// Statements of one kind.
    pub fn count_of(&self, kind: StatementKind) -> usize {
        self.statements.iter().filter(|s| s.kind == kind).count()
    }

    /// Selects and counts; writes excluded.
    pub fn query_count(&self) -> usize {
        self.count_of(StatementKind::Select) + self.count_of(StatementKind::Count)
    }

    pub fn count_query_count(&self) -> usize {
        self.count_of(StatementKind::Count)
    }

    /// Flushes that wrote at least one row.
    pub fn flush_count(&self) -> u64 {
        self.flushes
    }

    /// Entities newly placed in the identity map by queries.
    pub fn entities_loaded(&self) -> u64 {
        self.entities_loaded
    }

    pub fn last_statement(&self) -> Option<&StatementRecord> {
        self.statements.last()
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}
