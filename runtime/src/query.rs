use crate::engine::{EngineCore, QueryResult};
use crate::executor::{finalize_matrel_rows, keys_eq, overlay_desc, run_overlay};
use anyhow::{Context, Result, anyhow, bail};
use freshet_aggregate::{AggState, Aggregate, lookup};
use freshet_catalog::types::ContAction;
use freshet_common::hash::hash_group;
use freshet_common::tuple::{Column, Row, TupleDesc};
use freshet_common::value::Value;
use freshet_sql::combine::{is_combine_call, resolve_combine};
use freshet_sql::error::AnalyzeError;
use freshet_sql::expr::{Scope, eval, eval_const};
use freshet_sql::plan::infer_type;
use freshet_sql::util::{
    self, figure_colname, func_arg_exprs, func_name, parse_query, query_select,
};
use sqlparser::ast::{Expr, SelectItem, TableFactor};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// One projected output column of a user query.
enum UserTarget {
    Scalar { name: String, expr: Expr },
    Agg { name: String, expr: Expr },
}

/// Executes a one-shot SELECT over a continuous view: the overlay supplies
/// finalized rows, combine() calls reach through to the matrel's transition
/// states, and plain aggregates run over the view output.
pub fn run_user_query(core: &Arc<EngineCore>, sql: &str) -> Result<QueryResult> {
    let query = parse_query(sql)?;
    let select = query_select(&query)?;

    // resolve the FROM relation: continuous views only; streams are not
    // directly readable
    let twj = select
        .from
        .first()
        .ok_or_else(|| anyhow!("query has no FROM clause"))?;
    let TableFactor::Table { name, .. } = &twj.relation else {
        bail!("only continuous views can be queried here");
    };
    let relation = name
        .0
        .last()
        .map(|i| i.value.to_ascii_lowercase())
        .unwrap_or_default();

    if core.cache.stream_by_name(&relation).is_some() {
        return Err(AnalyzeError::StreamOutsideCont.into());
    }
    let cv = core
        .cache
        .query_by_name(&relation)
        .ok_or_else(|| anyhow!("relation \"{relation}\" does not exist"))?;
    if cv.action != ContAction::Materialize {
        bail!("continuous transform \"{relation}\" has no materialized results");
    }
    let runtime = core
        .plans
        .get(core, cv.id)?
        .ok_or_else(|| anyhow!("continuous view \"{relation}\" does not exist"))?;

    let now = core.now();
    let matrel_rows = core.matrels.scan(cv.matrel);
    let view_desc = overlay_desc(&runtime.overlay, &cv.matrel_desc);

    // expand the projection
    let mut targets: Vec<UserTarget> = Vec::new();
    let mut has_aggs = false;
    let mut has_combine = false;
    for item in &select.projection {
        match item {
            SelectItem::Wildcard(_) => {
                for column in &view_desc.columns {
                    targets.push(UserTarget::Scalar {
                        name: column.name.clone(),
                        expr: util::parse_expr(&util::ident_sql(&column.name))?,
                    });
                }
            }
            SelectItem::QualifiedWildcard(..) => {
                for column in &view_desc.columns {
                    targets.push(UserTarget::Scalar {
                        name: column.name.clone(),
                        expr: util::parse_expr(&util::ident_sql(&column.name))?,
                    });
                }
            }
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                let name = match item {
                    SelectItem::ExprWithAlias { alias, .. } => alias.value.clone(),
                    _ => figure_colname(expr),
                };
                let aggs = util::collect_agg_funcs(expr);
                if aggs.is_empty() {
                    targets.push(UserTarget::Scalar {
                        name,
                        expr: expr.clone(),
                    });
                } else {
                    has_aggs = true;
                    if aggs.iter().any(is_combine_call) {
                        has_combine = true;
                    }
                    targets.push(UserTarget::Agg {
                        name,
                        expr: expr.clone(),
                    });
                }
            }
        }
    }

    let group_by = util::group_exprs(select);

    // base rows: finalized view rows, with raw matrel rows alongside when
    // combine() needs the unfinalized states
    let base: Vec<(Row, Option<Row>)> = if has_combine {
        finalize_matrel_rows(&runtime.overlay, &cv.matrel_desc, &matrel_rows, now)?
            .into_iter()
            .map(|f| {
                let mut scope = Scope::new(now);
                scope.push_row(&cv.matrel_desc, &f.finalized, None);
                let values: Result<Vec<Value>> = runtime
                    .overlay
                    .targets
                    .iter()
                    .map(|(_, e)| eval(e, &scope).map_err(Into::into))
                    .collect();
                values.map(|v| (Row::new(v), Some(f.raw)))
            })
            .collect::<Result<Vec<_>>>()?
    } else {
        run_overlay(&runtime.overlay, &cv.matrel_desc, &matrel_rows, now)?
            .into_iter()
            .map(|row| (row, None))
            .collect()
    };

    // WHERE over the view columns
    let mut filtered: Vec<(Row, Option<Row>)> = Vec::new();
    for (row, raw) in base {
        let keep = match &select.selection {
            Some(filter) => {
                let mut scope = Scope::new(now);
                scope.push_row(&view_desc, &row, Some(relation.as_str()));
                eval(filter, &scope)
                    .with_context(|| "WHERE clause")?
                    .as_bool()
                    == Some(true)
            }
            None => true,
        };
        if keep {
            filtered.push((row, raw));
        }
    }

    let mut out_desc_cols = Vec::with_capacity(targets.len());
    for target in &targets {
        let (name, expr) = match target {
            UserTarget::Scalar { name, expr } | UserTarget::Agg { name, expr } => (name, expr),
        };
        out_desc_cols.push(Column::new(name.clone(), infer_type(expr, Some(&view_desc))));
    }
    let out_desc = TupleDesc::new(out_desc_cols);

    let mut out_rows: Vec<Row> = if has_aggs || !group_by.is_empty() {
        run_grouped(
            core,
            &cv,
            &targets,
            &group_by,
            &filtered,
            &view_desc,
            &relation,
            now,
        )?
    } else {
        let mut rows = Vec::with_capacity(filtered.len());
        for (row, _) in &filtered {
            let mut scope = Scope::new(now);
            scope.push_row(&view_desc, row, Some(relation.as_str()));
            let mut values = Vec::with_capacity(targets.len());
            for target in &targets {
                let UserTarget::Scalar { expr, .. } = target else {
                    unreachable!("aggregate target in scalar path");
                };
                values.push(eval(expr, &scope).with_context(|| "projection")?);
            }
            rows.push(Row::new(values));
        }
        rows
    };

    // ORDER BY / LIMIT / OFFSET over the result
    if let Some(order_by) = &query.order_by {
        sort_rows(&mut out_rows, &out_desc, &order_by.exprs, now)?;
    }
    if let Some(offset) = &query.offset {
        let n = usize_const(&offset.value)?;
        out_rows = out_rows.into_iter().skip(n).collect();
    }
    if let Some(limit) = &query.limit {
        let n = usize_const(limit)?;
        out_rows.truncate(n);
    }

    Ok(QueryResult {
        desc: out_desc,
        rows: out_rows,
    })
}

struct GroupAcc {
    key: Vec<Value>,
    first_row: Row,
    members: Vec<usize>,
}

#[allow(clippy::too_many_arguments)]
fn run_grouped(
    core: &Arc<EngineCore>,
    cv: &Arc<freshet_catalog::types::ContQueryRow>,
    targets: &[UserTarget],
    group_by: &[Expr],
    rows: &[(Row, Option<Row>)],
    view_desc: &TupleDesc,
    relation: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<Row>> {
    let mut index: HashMap<u64, Vec<usize>> = HashMap::new();
    let mut groups: Vec<GroupAcc> = Vec::new();

    for (row_idx, (row, _)) in rows.iter().enumerate() {
        let mut scope = Scope::new(now);
        scope.push_row(view_desc, row, Some(relation));
        let mut key = Vec::with_capacity(group_by.len());
        for expr in group_by {
            key.push(eval(expr, &scope).with_context(|| "GROUP BY expression")?);
        }
        let hash = hash_group(&key);
        let found = index
            .entry(hash)
            .or_default()
            .iter()
            .copied()
            .find(|i| keys_eq(&groups[*i].key, &key));
        match found {
            Some(i) => groups[i].members.push(row_idx),
            None => {
                groups.push(GroupAcc {
                    key,
                    first_row: row.clone(),
                    members: vec![row_idx],
                });
                index.entry(hash).or_default().push(groups.len() - 1);
            }
        }
    }

    // an aggregate over an empty input still yields one group
    if groups.is_empty() && group_by.is_empty() {
        groups.push(GroupAcc {
            key: Vec::new(),
            first_row: Row::default(),
            members: Vec::new(),
        });
    }

    let mut out = Vec::with_capacity(groups.len());
    for group in &groups {
        let mut values = Vec::with_capacity(targets.len());
        for target in targets {
            match target {
                UserTarget::Scalar { expr, .. } => {
                    let mut scope = Scope::new(now);
                    scope.push_row(view_desc, &group.first_row, Some(relation));
                    values.push(eval(expr, &scope).with_context(|| "group column")?);
                }
                UserTarget::Agg { expr, .. } => {
                    let mut rewritten = expr.clone();
                    let mut failure: Option<anyhow::Error> = None;
                    util::mutate_exprs(&mut rewritten, &mut |e| {
                        if let Expr::Function(func) = e
                            && util::is_aggregate_fn(&func_name(func))
                        {
                            match eval_group_agg(core, cv, func, group, rows, view_desc, relation, now)
                            {
                                Ok(value) => *e = value_literal(&value),
                                Err(err) => failure = Some(err),
                            }
                        }
                    });
                    if let Some(err) = failure {
                        return Err(err);
                    }
                    let mut scope = Scope::new(now);
                    scope.push_row(view_desc, &group.first_row, Some(relation));
                    values.push(eval(&rewritten, &scope).with_context(|| "aggregate target")?);
                }
            }
        }
        out.push(Row::new(values));
    }
    Ok(out)
}

/// Evaluates one aggregate call over a group of view rows. combine() merges
/// the matrel transition states behind the referenced column; everything
/// else transitions over the finalized values.
#[allow(clippy::too_many_arguments)]
fn eval_group_agg(
    core: &Arc<EngineCore>,
    cv: &Arc<freshet_catalog::types::ContQueryRow>,
    func: &sqlparser::ast::Function,
    group: &GroupAcc,
    rows: &[(Row, Option<Row>)],
    view_desc: &TupleDesc,
    relation: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Value> {
    if is_combine_call(func) {
        let (args, _) = func_arg_exprs(func);
        let arg = args.first().ok_or(AnalyzeError::BadCombineArg)?;
        let resolved = resolve_combine(cv, arg, &core.cache)?;
        let mut merged: Option<AggState> = None;
        for row_idx in &group.members {
            let Some(raw) = rows[*row_idx].1.as_ref() else {
                bail!("combine() requires matrel-backed rows");
            };
            let incoming = resolved.agg.datum_to_state(raw.get(resolved.matrel_attr))?;
            match &mut merged {
                Some(held) => resolved.agg.combine(held, &incoming)?,
                slot @ None => *slot = Some(incoming),
            }
        }
        let state = merged.unwrap_or_else(|| resolved.agg.init());
        return Ok(resolved.agg.finalize(&state)?);
    }

    let name = func_name(func);
    let agg: Arc<dyn Aggregate> =
        lookup(&name).ok_or_else(|| AnalyzeError::UnknownAggregate(name.clone()))?;
    let (args, star) = func_arg_exprs(func);
    let mut state = agg.init();
    for row_idx in &group.members {
        let (row, _) = &rows[*row_idx];
        let mut scope = Scope::new(now);
        scope.push_row(view_desc, row, Some(relation));
        if star || args.is_empty() {
            agg.transition(&mut state, &[])?;
        } else {
            let mut evaled = Vec::with_capacity(args.len());
            for arg in &args {
                evaled.push(eval(arg, &scope).with_context(|| "aggregate argument")?);
            }
            agg.transition(&mut state, &evaled)?;
        }
    }
    Ok(agg.finalize(&state)?)
}

/// Reinjects a computed value into an expression tree as a literal.
fn value_literal(value: &Value) -> Expr {
    let text = match value {
        Value::Null => "NULL".to_owned(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => format!("{f:?}"),
        other => format!("'{}'", other.output().replace('\'', "''")),
    };
    util::parse_expr(&text).unwrap_or(Expr::Value(sqlparser::ast::Value::Null))
}

fn usize_const(expr: &Expr) -> Result<usize> {
    match eval_const(expr) {
        Ok(Value::Int(i)) if i >= 0 => Ok(i as usize),
        other => Err(anyhow!("expected a non-negative integer, got {other:?}")),
    }
}

fn sort_rows(
    rows: &mut [Row],
    desc: &TupleDesc,
    order: &[sqlparser::ast::OrderByExpr],
    now: chrono::DateTime<chrono::Utc>,
) -> Result<()> {
    let mut keys: Vec<(usize, Vec<(Value, bool)>)> = Vec::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        let mut scope = Scope::new(now);
        scope.push_row(desc, row, None);
        let mut key = Vec::with_capacity(order.len());
        for item in order {
            let value = eval(&item.expr, &scope).with_context(|| "ORDER BY expression")?;
            key.push((value, item.asc.unwrap_or(true)));
        }
        keys.push((idx, key));
    }

    keys.sort_by(|(_, a), (_, b)| {
        for ((va, asc), (vb, _)) in a.iter().zip(b.iter()) {
            let ord = match (va.is_null(), vb.is_null()) {
                (true, true) => Ordering::Equal,
                // nulls sort last in ascending order
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => va.sql_cmp(vb).unwrap_or(Ordering::Equal),
            };
            let ord = if *asc { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });

    let sorted: Vec<Row> = keys.iter().map(|(idx, _)| rows[*idx].clone()).collect();
    rows.clone_from_slice(&sorted);
    Ok(())
}
