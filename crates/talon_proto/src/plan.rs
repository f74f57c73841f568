//! Plan trees shipped from the SQL compiler.
//!
//! The region core executes these without a cost model: node kinds are a
//! closed sum type (the source system's polymorphic nodes flattened), and
//! expressions are a small tree evaluated by the executor.

use serde::{Deserialize, Serialize};

use crate::record::Record;
use talon_common::value::{Value, ValueType};

/// One output slot of a tuple: where the executor materializes a field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotDescriptor {
    pub slot_id: u32,
    pub field_id: u32,
    pub value_type: ValueType,
}

/// Row layout requested by the client for one tuple id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TupleDescriptor {
    pub tuple_id: u32,
    pub slots: Vec<SlotDescriptor>,
}

/// Comparison / combination operators of the predicate language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExprOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Predicate / scalar expression tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expr {
    Literal(Value),
    /// Reference to a field of the scanned row.
    FieldRef { field_id: u32 },
    Binary { op: ExprOp, left: Box<Expr>, right: Box<Expr> },
    In { field_id: u32, list: Vec<Value> },
    /// `field LIKE 'prefix%'` — only prefix patterns reach the region core.
    LikePrefix { field_id: u32, prefix: String },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    /// Fulltext match against one indexed column.
    MatchAgainst { index_id: u64, query: String },
}

impl Expr {
    /// Field ids referenced anywhere in this expression.
    pub fn referenced_fields(&self, out: &mut Vec<u32>) {
        match self {
            Expr::Literal(_) => {}
            Expr::FieldRef { field_id } => out.push(*field_id),
            Expr::Binary { left, right, .. } => {
                left.referenced_fields(out);
                right.referenced_fields(out);
            }
            Expr::In { field_id, .. } | Expr::LikePrefix { field_id, .. } => out.push(*field_id),
            Expr::And(list) | Expr::Or(list) => {
                for e in list {
                    e.referenced_fields(out);
                }
            }
            Expr::Not(inner) => inner.referenced_fields(out),
            Expr::MatchAgainst { .. } => {}
        }
    }
}

/// A bounded range over one index, as produced by the planner.
/// `left_field_cnt`/`right_field_cnt` say how many leading index fields the
/// bound records actually constrain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexRange {
    pub index_id: u64,
    pub left: Vec<Value>,
    pub right: Vec<Value>,
    pub left_open: bool,
    pub right_open: bool,
    pub left_field_cnt: u32,
    pub right_field_cnt: u32,
    /// Set for `LIKE 'abc%'` pushdown: scan keys with this byte prefix.
    pub like_prefix: Option<Vec<u8>>,
}

/// Requested output ordering; the scan satisfies it when the chosen index
/// matches, otherwise the upper layers sort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortField {
    pub field_id: u32,
    pub descending: bool,
}

/// How multiple fulltext terms combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FulltextCombine {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanNode {
    pub table_id: u64,
    pub tuple_id: u32,
    /// Candidate ranges, one or more per usable index.
    pub ranges: Vec<IndexRange>,
    /// Conjuncts to evaluate; the executor pushes coverable ones into the
    /// index iterator.
    pub conjuncts: Vec<Expr>,
    pub limit: Option<u64>,
    pub sort: Option<SortField>,
    pub fulltext_combine: FulltextCombine,
    /// Backward scan when set.
    pub reverse: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsertNode {
    pub table_id: u64,
    pub records: Vec<Record>,
    /// INSERT ... ON DUPLICATE KEY UPDATE-free path: plain inserts only.
    pub need_presence_check: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteNode {
    pub table_id: u64,
    /// Row selection re-uses the scan shape.
    pub scan: ScanNode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateNode {
    pub table_id: u64,
    pub scan: ScanNode,
    /// field_id → new value expression.
    pub assignments: Vec<(u32, Expr)>,
}

/// Plan node kinds (closed set).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PlanNode {
    Scan(ScanNode),
    Insert(InsertNode),
    Delete(DeleteNode),
    Update(UpdateNode),
}

/// A plan tree; the region core only ever receives a single root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub root: PlanNode,
}

impl Default for Plan {
    fn default() -> Self {
        Plan { root: PlanNode::Scan(ScanNode::default()) }
    }
}
