use crate::error::{AnalyzeError, Result};
use crate::expr::cast_target;
use crate::util::{
    self, MATREL_COMBINE, func_arg_exprs, func_is_distinct, func_name, parse_query, query_select,
};
use freshet_aggregate::{Aggregate, lookup};
use freshet_common::tuple::{ARRIVAL_TIMESTAMP, Column, TupleDesc};
use freshet_common::value::DataType;
use sqlparser::ast::{Expr, Select, SelectItem, TableFactor};
use std::sync::Arc;

/// A planned aggregate call inside a worker target.
#[derive(Clone)]
pub struct PlannedAgg {
    pub agg: Arc<dyn Aggregate>,
    pub args: Vec<Expr>,
    /// count(*) style call with no per-row arguments.
    pub star: bool,
    pub filter: Option<Expr>,
    /// A combine() over an upstream view's output stream: the argument is
    /// an already-built transition state merged into the running state
    /// instead of a raw value transitioned over. Set by the combine
    /// resolver, which also swaps the dummy for the terminal aggregate.
    pub combines_state: bool,
}

/// One worker output column.
#[derive(Clone)]
pub enum WorkerTarget {
    Scalar { name: String, expr: Expr },
    Agg { name: String, agg: PlannedAgg },
}

impl WorkerTarget {
    pub fn name(&self) -> &str {
        match self {
            WorkerTarget::Scalar { name, .. } | WorkerTarget::Agg { name, .. } => name,
        }
    }
}

/// A relation joined against the stream.
#[derive(Clone, Debug)]
pub struct JoinRel {
    pub table: String,
    pub alias: Option<String>,
    pub constraint: Option<Expr>,
}

/// Projection/filter of a single-level sub-SELECT in FROM.
#[derive(Clone)]
pub struct SubPlan {
    pub targets: Vec<(String, Expr)>,
    pub filter: Option<Expr>,
}

/// Hash-based duplicate elimination standing in for a Unique-over-Sort
/// plan; worker outputs are unordered but the pipeline dedups by hash.
#[derive(Clone, Debug)]
pub struct ContinuousUnique {
    pub on: Vec<Expr>,
}

/// The compiled worker query: stream scan, optional subquery projection,
/// joins, filter, grouping and partial aggregation.
#[derive(Clone)]
pub struct WorkerPlan {
    pub stream: String,
    pub stream_alias: Option<String>,
    pub subquery: Option<SubPlan>,
    pub joins: Vec<JoinRel>,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub targets: Vec<WorkerTarget>,
    pub unique: Option<ContinuousUnique>,
}

impl WorkerPlan {
    pub fn target_index(&self, name: &str) -> Option<usize> {
        self.targets
            .iter()
            .position(|t| t.name().eq_ignore_ascii_case(name))
    }

    pub fn has_aggs(&self) -> bool {
        self.targets
            .iter()
            .any(|t| matches!(t, WorkerTarget::Agg { .. }))
    }
}

/// How the combiner produces one matrel column from a partial-result tuple.
#[derive(Clone)]
pub enum CombinerColumn {
    /// Group column, copied through.
    Group { idx: usize },
    /// Transition state merged with the existing matrel state.
    Combine {
        idx: usize,
        agg: Arc<dyn Aggregate>,
    },
    /// Constant expression re-evaluated in the combiner.
    Const(Expr),
}

/// The compiled combiner query: a tuplestore scan over worker output in
/// place of the planner's matrel join search.
#[derive(Clone)]
pub struct CombinerPlan {
    pub columns: Vec<(String, CombinerColumn)>,
    /// Output positions forming the group key, in GROUP BY order.
    pub group_idxs: Vec<usize>,
}

/// Shape of one matrel column as the overlay sees it.
#[derive(Clone)]
pub enum MatrelColumn {
    Group,
    Agg(Arc<dyn Aggregate>),
}

/// The compiled overlay: finalize matrel states and present user rows.
#[derive(Clone)]
pub struct OverlayPlan {
    pub matrel_columns: Vec<MatrelColumn>,
    pub targets: Vec<(String, Expr)>,
    pub where_clause: Option<Expr>,
    pub distinct_on: Vec<Expr>,
    /// User-group references for the sliding-window read-side merge.
    pub group_by: Vec<Expr>,
    pub view_combines: bool,
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
}

fn select_targets(select: &Select) -> Result<Vec<(String, Expr)>> {
    let mut out = Vec::with_capacity(select.projection.len());
    for item in &select.projection {
        match item {
            SelectItem::ExprWithAlias { expr, alias } => {
                out.push((alias.value.clone(), expr.clone()));
            }
            SelectItem::UnnamedExpr(expr) => {
                out.push((util::figure_colname(expr), expr.clone()));
            }
            _ => {
                return Err(AnalyzeError::Rewrite(
                    "wildcard in a generated query".to_owned(),
                ));
            }
        }
    }
    Ok(out)
}

fn strip(expr: &Expr) -> &Expr {
    match expr {
        Expr::Nested(inner) => strip(inner),
        other => other,
    }
}

fn planned_agg(func: &sqlparser::ast::Function) -> Result<PlannedAgg> {
    let name = func_name(func);
    let agg = lookup(&name).ok_or_else(|| AnalyzeError::UnknownAggregate(name.clone()))?;
    let (args, star) = func_arg_exprs(func);
    if func_is_distinct(func) {
        // DISTINCT should have been replaced by a set/approximate variant
        return Err(AnalyzeError::Rewrite(format!(
            "DISTINCT aggregate {name} survived rewriting"
        )));
    }
    Ok(PlannedAgg {
        agg,
        args,
        star: star || func_name(func) == "count" && func_args_empty(func),
        filter: func.filter.as_deref().cloned(),
        combines_state: false,
    })
}

fn func_args_empty(func: &sqlparser::ast::Function) -> bool {
    let (args, star) = func_arg_exprs(func);
    args.is_empty() && !star
}

/// Compiles worker SQL into a worker plan. The FROM must be a stream,
/// optionally joined to relations, or a single sub-SELECT over one.
pub fn compile_worker(worker_sql: &str, is_stream: &dyn Fn(&str) -> bool) -> Result<WorkerPlan> {
    let query = parse_query(worker_sql)?;
    let select = query_select(&query)?;

    let twj = select
        .from
        .first()
        .ok_or_else(|| AnalyzeError::Rewrite("worker query has no FROM".to_owned()))?;

    let mut subquery = None;
    let (stream, stream_alias) = match &twj.relation {
        TableFactor::Table { name, alias, .. } => {
            let table = name
                .0
                .last()
                .map(|i| i.value.to_ascii_lowercase())
                .unwrap_or_default();
            (table, alias.as_ref().map(|a| a.name.value.clone()))
        }
        TableFactor::Derived {
            subquery: inner,
            alias,
            ..
        } => {
            let inner_select = query_select(inner)?;
            let inner_twj = inner_select
                .from
                .first()
                .ok_or_else(|| AnalyzeError::Rewrite("subquery has no FROM".to_owned()))?;
            let TableFactor::Table { name, alias: stream_alias, .. } = &inner_twj.relation else {
                return Err(AnalyzeError::Rewrite(
                    "nested subqueries are not supported in workers".to_owned(),
                ));
            };
            let table = name
                .0
                .last()
                .map(|i| i.value.to_ascii_lowercase())
                .unwrap_or_default();
            subquery = Some(SubPlan {
                targets: select_targets(inner_select)?,
                filter: inner_select.selection.clone(),
            });
            let outer_alias = alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .or_else(|| stream_alias.as_ref().map(|a| a.name.value.clone()));
            (table, outer_alias)
        }
        other => {
            return Err(AnalyzeError::Rewrite(format!(
                "unsupported FROM item {other}"
            )));
        }
    };

    if !is_stream(&stream) {
        return Err(AnalyzeError::StreamOutsideCont);
    }

    let mut joins = Vec::new();
    for join in &twj.joins {
        let TableFactor::Table { name, alias, .. } = &join.relation else {
            return Err(AnalyzeError::Rewrite(
                "only table joins are supported in workers".to_owned(),
            ));
        };
        let constraint = match &join.join_operator {
            sqlparser::ast::JoinOperator::Inner(sqlparser::ast::JoinConstraint::On(e)) => {
                Some(e.clone())
            }
            sqlparser::ast::JoinOperator::Inner(sqlparser::ast::JoinConstraint::None)
            | sqlparser::ast::JoinOperator::CrossJoin => None,
            other => {
                return Err(AnalyzeError::Rewrite(format!(
                    "unsupported join type {other:?}"
                )));
            }
        };
        joins.push(JoinRel {
            table: name
                .0
                .last()
                .map(|i| i.value.to_ascii_lowercase())
                .unwrap_or_default(),
            alias: alias.as_ref().map(|a| a.name.value.clone()),
            constraint,
        });
    }
    // comma-joined relations behave like cross joins filtered by WHERE
    for extra in select.from.iter().skip(1) {
        let TableFactor::Table { name, alias, .. } = &extra.relation else {
            return Err(AnalyzeError::Rewrite(
                "only table joins are supported in workers".to_owned(),
            ));
        };
        joins.push(JoinRel {
            table: name
                .0
                .last()
                .map(|i| i.value.to_ascii_lowercase())
                .unwrap_or_default(),
            alias: alias.as_ref().map(|a| a.name.value.clone()),
            constraint: None,
        });
    }

    let mut targets = Vec::new();
    for (name, expr) in select_targets(select)? {
        match strip(&expr) {
            Expr::Function(func) if util::is_aggregate_fn(&func_name(func)) => {
                targets.push(WorkerTarget::Agg {
                    name,
                    agg: planned_agg(func)?,
                });
            }
            _ => targets.push(WorkerTarget::Scalar { name, expr }),
        }
    }

    let unique = match &select.distinct {
        Some(sqlparser::ast::Distinct::On(exprs)) => Some(ContinuousUnique { on: exprs.clone() }),
        Some(sqlparser::ast::Distinct::Distinct) => Some(ContinuousUnique { on: Vec::new() }),
        None => None,
    };

    Ok(WorkerPlan {
        stream,
        stream_alias,
        subquery,
        joins,
        filter: select.selection.clone(),
        group_by: util::group_exprs(select),
        targets,
        unique,
    })
}

/// Compiles combiner SQL against the worker plan that feeds it. The input
/// relation is always the worker's partial-result tuplestore, never the
/// matrel scan the planner would pick.
pub fn compile_combiner(combiner_sql: &str, worker: &WorkerPlan) -> Result<CombinerPlan> {
    let query = parse_query(combiner_sql)?;
    let select = query_select(&query)?;

    let mut columns = Vec::new();
    for (name, expr) in select_targets(select)? {
        let column = match strip(&expr) {
            Expr::Function(func) if func_name(func) == MATREL_COMBINE => {
                let (args, _) = func_arg_exprs(func);
                let arg = args.first().ok_or(AnalyzeError::BadCombineArg)?;
                let colname = util::figure_colname(arg);
                let idx = worker
                    .target_index(&colname)
                    .ok_or_else(|| AnalyzeError::UnknownColumn(colname.clone()))?;
                let WorkerTarget::Agg { agg, .. } = &worker.targets[idx] else {
                    return Err(AnalyzeError::BadCombineArg);
                };
                CombinerColumn::Combine {
                    idx,
                    agg: agg.agg.clone(),
                }
            }
            Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
                let colname = util::figure_colname(&expr);
                let idx = worker
                    .target_index(&colname)
                    .ok_or_else(|| AnalyzeError::UnknownColumn(colname))?;
                CombinerColumn::Group { idx }
            }
            _ => CombinerColumn::Const(expr.clone()),
        };
        columns.push((name, column));
    }

    let mut group_idxs = Vec::new();
    for group_expr in util::group_exprs(select) {
        let name = util::figure_colname(&group_expr);
        let idx = columns
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(&name))
            .ok_or_else(|| AnalyzeError::UnknownColumn(name))?;
        group_idxs.push(idx);
    }

    Ok(CombinerPlan {
        columns,
        group_idxs,
    })
}

/// Compiles the overlay view. combine() wrappers are structural: they mark
/// the read-side merge the executor performs, so they reduce to their
/// argument here.
pub fn compile_overlay(
    overlay_sql: &str,
    worker: &WorkerPlan,
    view_combines: bool,
) -> Result<OverlayPlan> {
    let query = parse_query(overlay_sql)?;
    let select = query_select(&query)?;

    let matrel_columns = worker
        .targets
        .iter()
        .map(|t| match t {
            WorkerTarget::Scalar { .. } => MatrelColumn::Group,
            WorkerTarget::Agg { agg, .. } => MatrelColumn::Agg(agg.agg.clone()),
        })
        .collect();

    let mut targets = Vec::new();
    for (name, mut expr) in select_targets(select)? {
        util::mutate_exprs(&mut expr, &mut |e| {
            if let Expr::Function(func) = e
                && func_name(func) == MATREL_COMBINE
            {
                let (args, _) = func_arg_exprs(func);
                if let Some(arg) = args.first() {
                    *e = arg.clone();
                }
            }
        });
        targets.push((name, expr));
    }

    let distinct_on = match &select.distinct {
        Some(sqlparser::ast::Distinct::On(exprs)) => exprs.clone(),
        _ => Vec::new(),
    };

    Ok(OverlayPlan {
        matrel_columns,
        targets,
        where_clause: select.selection.clone(),
        distinct_on,
        group_by: util::group_exprs(select),
        view_combines,
        limit: query.limit.clone(),
        offset: query.offset.as_ref().map(|o| o.value.clone()),
    })
}

/// Best-effort type inference for the matrel descriptor.
pub fn infer_type(expr: &Expr, stream_desc: Option<&TupleDesc>) -> DataType {
    match strip(expr) {
        Expr::Identifier(ident) => {
            let name = ident.value.to_ascii_lowercase();
            if name == ARRIVAL_TIMESTAMP {
                return DataType::Timestamp;
            }
            stream_desc
                .and_then(|d| d.attr(&name).map(|i| d.columns[i].data_type))
                .unwrap_or(DataType::Text)
        }
        Expr::CompoundIdentifier(parts) => {
            let name = parts
                .last()
                .map(|i| i.value.to_ascii_lowercase())
                .unwrap_or_default();
            if name == ARRIVAL_TIMESTAMP {
                return DataType::Timestamp;
            }
            stream_desc
                .and_then(|d| d.attr(&name).map(|i| d.columns[i].data_type))
                .unwrap_or(DataType::Text)
        }
        Expr::Cast { data_type, .. } => cast_target(data_type).unwrap_or(DataType::Text),
        Expr::Function(func) => match func_name(func).as_str() {
            "date_round" | "date_trunc" | "clock_timestamp" | "now" => DataType::Timestamp,
            _ => DataType::Text,
        },
        Expr::Value(v) => match v {
            sqlparser::ast::Value::Number(text, _) => {
                if text.parse::<i64>().is_ok() {
                    DataType::Int
                } else {
                    DataType::Float
                }
            }
            sqlparser::ast::Value::Boolean(_) => DataType::Bool,
            _ => DataType::Text,
        },
        Expr::BinaryOp { left, .. } => infer_type(left, stream_desc),
        _ => DataType::Text,
    }
}

/// Builds the matrel tuple descriptor from the worker plan: group columns in
/// their natural types, aggregate columns in their state types.
pub fn matrel_desc(worker: &WorkerPlan, stream_desc: Option<&TupleDesc>) -> Result<TupleDesc> {
    let mut columns = Vec::with_capacity(worker.targets.len());
    for target in &worker.targets {
        let (name, data_type) = match target {
            WorkerTarget::Scalar { name, expr } => (name.clone(), infer_type(expr, stream_desc)),
            WorkerTarget::Agg { name, agg } => (name.clone(), agg.agg.state_type()),
        };
        if columns
            .iter()
            .any(|c: &Column| c.name.eq_ignore_ascii_case(&name))
        {
            return Err(AnalyzeError::DuplicateColumn(name));
        }
        columns.push(Column::new(name, data_type));
    }
    Ok(TupleDesc::new(columns))
}
