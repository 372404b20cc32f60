use crate::host_tables::HostTables;
use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use freshet_aggregate::AggState;
use freshet_common::hash::{hash_group, ls_hash_group};
use freshet_common::tuple::{Row, TupleDesc};
use freshet_common::value::Value;
use freshet_sql::expr::{Scope, eval, eval_const};
use freshet_sql::plan::{MatrelColumn, OverlayPlan, WorkerPlan, WorkerTarget};
use sqlparser::ast::Expr;
use std::collections::HashMap;

/// Maps an output-column alias back to the expression that produces it.
fn resolve_output_alias(expr: &Expr, plan: &WorkerPlan) -> Expr {
    if let Expr::Identifier(ident) = expr
        && let Some(idx) = plan.target_index(&ident.value)
        && let WorkerTarget::Scalar { expr: target, .. } = &plan.targets[idx]
    {
        return target.clone();
    }
    expr.clone()
}

/// Partial-result rows plus the shard hash annotation used to partition
/// them across combiners.
pub struct WorkerOutput {
    pub rows: Vec<Row>,
    pub hashes: Vec<u64>,
}

struct GroupAcc {
    key: Vec<Value>,
    scalars: Vec<Option<Value>>,
    aggs: Vec<Option<AggState>>,
}

fn truthy(value: &Value) -> bool {
    value.as_bool() == Some(true)
}

/// Evaluates the group hash of a worker output row over its group columns.
/// Large or variable-width group values use the large-state variant.
pub fn output_hash(row: &Row, group_idxs: &[usize]) -> u64 {
    let key: Vec<Value> = group_idxs.iter().map(|i| row.get(*i).clone()).collect();
    let large = key.iter().any(|v| {
        matches!(
            v,
            Value::Array(_) | Value::Json(_) | Value::Record(_) | Value::Bytes(_)
        )
    });
    if large {
        ls_hash_group(&key)
    } else {
        hash_group(&key)
    }
}

/// Executes the worker plan over one microbatch of projected stream rows.
pub fn run_worker_plan(
    plan: &WorkerPlan,
    group_out_idxs: &[usize],
    stream_desc: &TupleDesc,
    tuples: &[Row],
    tables: &HostTables,
    now: DateTime<Utc>,
) -> Result<WorkerOutput> {
    // stream scan -> optional subquery projection -> joins -> filter
    let mut scopes: Vec<Scope> = Vec::new();
    for tuple in tuples {
        let mut scope = Scope::new(now);
        scope.push_row(stream_desc, tuple, plan.stream_alias.as_deref());

        let scope = match &plan.subquery {
            Some(sub) => {
                if let Some(filter) = &sub.filter
                    && !truthy(&eval(filter, &scope).with_context(|| "subquery filter")?)
                {
                    continue;
                }
                let mut projected = Scope::new(now);
                for (name, expr) in &sub.targets {
                    let value = eval(expr, &scope).with_context(|| "subquery target")?;
                    projected.push_col(name, value);
                }
                projected
            }
            None => scope,
        };

        let mut joined = vec![scope];
        for join in &plan.joins {
            let (desc, rows) = match tables.scan(&join.table) {
                Ok(found) => found,
                Err(e) => {
                    // a dropped join table aborts quietly; the plan is not
                    // re-planned until the next invalidation
                    tracing::warn!("stream-table join skipped: {e}");
                    return Ok(WorkerOutput {
                        rows: Vec::new(),
                        hashes: Vec::new(),
                    });
                }
            };
            let alias = join.alias.clone().unwrap_or_else(|| join.table.clone());
            let mut next = Vec::new();
            for scope in &joined {
                for table_row in &rows {
                    let mut candidate = scope.clone();
                    candidate.push_row(&desc, table_row, Some(alias.as_str()));
                    let keep = match &join.constraint {
                        Some(constraint) => truthy(
                            &eval(constraint, &candidate).with_context(|| "join constraint")?,
                        ),
                        None => true,
                    };
                    if keep {
                        next.push(candidate);
                    }
                }
            }
            joined = next;
        }

        for scope in joined {
            let keep = match &plan.filter {
                Some(filter) => truthy(&eval(filter, &scope).with_context(|| "worker filter")?),
                None => true,
            };
            if keep {
                scopes.push(scope);
            }
        }
    }

    let has_aggs = plan.has_aggs();
    let grouped = !plan.group_by.is_empty();

    // grouping and dedup expressions may reference output columns by name,
    // the way SQL lets GROUP BY name an alias; rewrite those to the target
    // expression so they evaluate against the input scope
    let group_by: Vec<Expr> = plan
        .group_by
        .iter()
        .map(|e| resolve_output_alias(e, plan))
        .collect();
    let unique_on: Option<Vec<Expr>> = plan.unique.as_ref().map(|u| {
        u.on.iter().map(|e| resolve_output_alias(e, plan)).collect()
    });

    let mut rows = Vec::new();
    if has_aggs || grouped {
        let mut acc_index: HashMap<u64, Vec<usize>> = HashMap::new();
        let mut accs: Vec<GroupAcc> = Vec::new();

        for scope in &scopes {
            let mut key = Vec::with_capacity(group_by.len());
            for expr in &group_by {
                key.push(eval(expr, scope).with_context(|| "group expression")?);
            }
            let hash = hash_group(&key);
            let idx = acc_index
                .entry(hash)
                .or_default()
                .iter()
                .copied()
                .find(|i| keys_eq(&accs[*i].key, &key));
            let idx = match idx {
                Some(found) => found,
                None => {
                    accs.push(GroupAcc {
                        key,
                        scalars: vec![None; plan.targets.len()],
                        aggs: vec![None; plan.targets.len()],
                    });
                    let new_idx = accs.len() - 1;
                    acc_index.entry(hash).or_default().push(new_idx);
                    new_idx
                }
            };

            let acc = &mut accs[idx];
            for (t_idx, target) in plan.targets.iter().enumerate() {
                match target {
                    WorkerTarget::Scalar { expr, .. } => {
                        if acc.scalars[t_idx].is_none() {
                            acc.scalars[t_idx] =
                                Some(eval(expr, scope).with_context(|| "scalar target")?);
                        }
                    }
                    WorkerTarget::Agg { agg, .. } => {
                        if let Some(filter) = &agg.filter
                            && !truthy(&eval(filter, scope).with_context(|| "aggregate filter")?)
                        {
                            continue;
                        }
                        let state = acc.aggs[t_idx].get_or_insert_with(|| agg.agg.init());
                        if agg.combines_state {
                            // the argument is an upstream transition state
                            // read off an output-stream delta, not a raw
                            // input value
                            let arg = agg.args.first().ok_or_else(|| {
                                anyhow!("combine() call without an argument")
                            })?;
                            let datum =
                                eval(arg, scope).with_context(|| "combine argument")?;
                            let incoming = agg.agg.datum_to_state(&datum)?;
                            agg.agg.combine(state, &incoming)?;
                        } else if agg.star {
                            agg.agg.transition(state, &[])?;
                        } else {
                            let mut args = Vec::with_capacity(agg.args.len());
                            for arg in &agg.args {
                                args.push(eval(arg, scope).with_context(|| "aggregate argument")?);
                            }
                            agg.agg.transition(state, &args)?;
                        }
                    }
                }
            }
        }

        for acc in accs {
            let mut values = Vec::with_capacity(plan.targets.len());
            for (t_idx, target) in plan.targets.iter().enumerate() {
                match target {
                    WorkerTarget::Scalar { .. } => {
                        values.push(acc.scalars[t_idx].clone().unwrap_or(Value::Null));
                    }
                    WorkerTarget::Agg { agg, .. } => {
                        let state = match &acc.aggs[t_idx] {
                            Some(state) => state.clone(),
                            None => agg.agg.init(),
                        };
                        values.push(agg.agg.state_to_datum(&state)?);
                    }
                }
            }
            rows.push(Row::new(values));
        }
    } else {
        // projection-only worker, deduped by hash when the plan is unique
        let mut seen = std::collections::HashSet::new();
        for scope in &scopes {
            let mut values = Vec::with_capacity(plan.targets.len());
            for target in &plan.targets {
                let WorkerTarget::Scalar { expr, .. } = target else {
                    bail!("aggregate target in projection-only worker plan");
                };
                values.push(eval(expr, scope).with_context(|| "projection target")?);
            }
            if let Some(on) = &unique_on {
                let key: Vec<Value> = if on.is_empty() {
                    values.clone()
                } else {
                    let mut key = Vec::with_capacity(on.len());
                    for expr in on {
                        key.push(eval(expr, scope).with_context(|| "distinct expression")?);
                    }
                    key
                };
                if !seen.insert(hash_group(&key)) {
                    continue;
                }
            }
            rows.push(Row::new(values));
        }
    }

    let hashes = rows
        .iter()
        .map(|row| output_hash(row, group_out_idxs))
        .collect();
    Ok(WorkerOutput { rows, hashes })
}

pub fn keys_eq(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.group_eq(y))
}

/// A matrel row with its aggregate columns finalized for reading.
pub struct FinalizedRow {
    pub row_id: crate::matrel::RowId,
    pub raw: Row,
    pub finalized: Row,
}

/// Applies the overlay's window predicate and finalizes every surviving
/// matrel row, without the read-side merge. The combine-aggregate path
/// reads these to get at unfinalized states.
pub fn finalize_matrel_rows(
    plan: &OverlayPlan,
    matrel_desc: &TupleDesc,
    rows: &[(crate::matrel::RowId, Row)],
    now: DateTime<Utc>,
) -> Result<Vec<FinalizedRow>> {
    let mut out = Vec::new();
    for (row_id, raw) in rows {
        let mut scope = Scope::new(now);
        scope.push_row(matrel_desc, raw, None);
        if let Some(where_clause) = &plan.where_clause
            && !truthy(&eval(where_clause, &scope).with_context(|| "window predicate")?)
        {
            continue;
        }

        let mut finalized = Vec::with_capacity(raw.arity());
        for (idx, column) in plan.matrel_columns.iter().enumerate() {
            match column {
                MatrelColumn::Group => finalized.push(raw.get(idx).clone()),
                MatrelColumn::Agg(agg) => {
                    let state = agg.datum_to_state(raw.get(idx))?;
                    finalized.push(agg.finalize(&state)?);
                }
            }
        }
        out.push(FinalizedRow {
            row_id: *row_id,
            raw: raw.clone(),
            finalized: Row::new(finalized),
        });
    }
    Ok(out)
}

/// Executes the overlay plan over matrel rows: window predicate, read-side
/// combine for sliding windows, finalize, projection, DISTINCT ON.
pub fn run_overlay(
    plan: &OverlayPlan,
    matrel_desc: &TupleDesc,
    rows: &[(crate::matrel::RowId, Row)],
    now: DateTime<Utc>,
) -> Result<Vec<Row>> {
    let mut pseudo_rows: Vec<Row> = Vec::new();

    if plan.view_combines {
        // one output row per user group; matrel rows of the group merge
        // their transition states before finalizing
        let mut index: HashMap<u64, Vec<usize>> = HashMap::new();
        let mut groups: Vec<(Vec<Value>, Row, Vec<Option<AggState>>)> = Vec::new();

        for (_, raw) in rows {
            let mut scope = Scope::new(now);
            scope.push_row(matrel_desc, raw, None);
            if let Some(where_clause) = &plan.where_clause
                && !truthy(&eval(where_clause, &scope).with_context(|| "window predicate")?)
            {
                continue;
            }

            let mut key = Vec::with_capacity(plan.group_by.len());
            for expr in &plan.group_by {
                key.push(eval(expr, &scope).with_context(|| "view group expression")?);
            }
            let hash = hash_group(&key);
            let idx = index
                .entry(hash)
                .or_default()
                .iter()
                .copied()
                .find(|i| keys_eq(&groups[*i].0, &key));
            let idx = match idx {
                Some(found) => found,
                None => {
                    groups.push((key, raw.clone(), vec![None; plan.matrel_columns.len()]));
                    let new_idx = groups.len() - 1;
                    index.entry(hash).or_default().push(new_idx);
                    new_idx
                }
            };

            let (_, _, states) = &mut groups[idx];
            for (col_idx, column) in plan.matrel_columns.iter().enumerate() {
                if let MatrelColumn::Agg(agg) = column {
                    let incoming = agg.datum_to_state(raw.get(col_idx))?;
                    match &mut states[col_idx] {
                        Some(held) => agg.combine(held, &incoming)?,
                        slot @ None => *slot = Some(incoming),
                    }
                }
            }
        }

        for (_, first_raw, states) in groups {
            let mut values = Vec::with_capacity(plan.matrel_columns.len());
            for (col_idx, column) in plan.matrel_columns.iter().enumerate() {
                match column {
                    MatrelColumn::Group => values.push(first_raw.get(col_idx).clone()),
                    MatrelColumn::Agg(agg) => {
                        let state = match &states[col_idx] {
                            Some(state) => state.clone(),
                            None => agg.init(),
                        };
                        values.push(agg.finalize(&state)?);
                    }
                }
            }
            pseudo_rows.push(Row::new(values));
        }
    } else {
        for finalized in finalize_matrel_rows(plan, matrel_desc, rows, now)? {
            pseudo_rows.push(finalized.finalized);
        }
    }

    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for pseudo in &pseudo_rows {
        let mut scope = Scope::new(now);
        scope.push_row(matrel_desc, pseudo, None);
        let mut values = Vec::with_capacity(plan.targets.len());
        for (_, expr) in &plan.targets {
            values.push(eval(expr, &scope).with_context(|| "overlay target")?);
        }
        if !plan.distinct_on.is_empty() {
            let mut key = Vec::with_capacity(plan.distinct_on.len());
            for expr in &plan.distinct_on {
                key.push(eval(expr, &scope).with_context(|| "distinct expression")?);
            }
            if !seen.insert(hash_group(&key)) {
                continue;
            }
        }
        out.push(Row::new(values));
    }

    // limits apply after the merge and dedup
    if let Some(offset) = &plan.offset {
        let n = const_usize(offset)?;
        out = out.into_iter().skip(n).collect();
    }
    if let Some(limit) = &plan.limit {
        let n = const_usize(limit)?;
        out.truncate(n);
    }
    Ok(out)
}

fn const_usize(expr: &sqlparser::ast::Expr) -> Result<usize> {
    match eval_const(expr) {
        Ok(Value::Int(i)) if i >= 0 => Ok(i as usize),
        other => Err(anyhow!("expected a non-negative integer, got {other:?}")),
    }
}

/// The tuple shape of overlay output.
pub fn overlay_desc(plan: &OverlayPlan, matrel_desc: &TupleDesc) -> TupleDesc {
    let columns = plan
        .targets
        .iter()
        .map(|(name, expr)| {
            let data_type = freshet_sql::plan::infer_type(expr, Some(matrel_desc));
            freshet_common::tuple::Column::new(name.clone(), data_type)
        })
        .collect();
    TupleDesc::new(columns)
}
