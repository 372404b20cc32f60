use crate::error::{AnalyzeError, Result};
use crate::plan::{WorkerPlan, WorkerTarget};
use crate::util::{self, func_arg_exprs, func_name, parse_query, query_select};
use freshet_aggregate::{Aggregate, lookup, lookup_combine_target};
use freshet_catalog::cache::{CacheId, CatalogCache, CatalogTuple};
use freshet_catalog::types::ContQueryRow;
use freshet_common::value::Value;
use sqlparser::ast::{Expr, Function, Query, SelectItem, TableFactor};
use std::sync::Arc;

/// Follow at most this many output-stream hops before declaring a cycle;
/// the catalog prevents self-reference, so a legal chain is always finite.
const MAX_COMBINE_HOPS: usize = 32;

/// A user-facing combine() call resolved against the continuous view that
/// produced the referenced column.
pub struct ResolvedCombine {
    /// Matrel attribute holding the transition state.
    pub matrel_attr: usize,
    /// The aggregate whose combine function merges those states.
    pub agg: Arc<dyn Aggregate>,
}

/// True when the call is the combine() pseudo-aggregate, identified by the
/// registry's explicit flag.
pub fn is_combine_call(func: &Function) -> bool {
    lookup(&func_name(func)).is_some_and(|agg| agg.is_combine())
}

fn strip(expr: &Expr) -> &Expr {
    match expr {
        Expr::Nested(inner) => strip(inner),
        other => other,
    }
}

/// The matrel column a combine() argument names: `(new).col`, `(old).col`
/// or a bare column reference.
fn delta_column_name(arg: &Expr) -> Option<String> {
    match strip(arg) {
        Expr::CompositeAccess { key, .. } => Some(key.value.to_ascii_lowercase()),
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
            Some(util::figure_colname(arg).to_ascii_lowercase())
        }
        _ => None,
    }
}

/// The stream a worker query reads from.
fn worker_stream_of(worker_query: &Query) -> Result<String> {
    let select = query_select(worker_query)?;
    let twj = select.from.first().ok_or(AnalyzeError::BadCombineArg)?;
    match &twj.relation {
        TableFactor::Table { name, .. } => Ok(name
            .0
            .last()
            .map(|i| i.value.to_ascii_lowercase())
            .unwrap_or_default()),
        _ => Err(AnalyzeError::BadCombineArg),
    }
}

/// Finds a worker target by name and returns its expression.
fn worker_target_expr(worker_query: &Query, colname: &str) -> Result<Option<(usize, Expr)>> {
    let select = query_select(worker_query)?;
    for (idx, item) in select.projection.iter().enumerate() {
        let (name, expr) = match item {
            SelectItem::ExprWithAlias { expr, alias } => (alias.value.clone(), expr),
            SelectItem::UnnamedExpr(expr) => (util::figure_colname(expr), expr),
            _ => continue,
        };
        if name.eq_ignore_ascii_case(colname) {
            return Ok(Some((idx, expr.clone())));
        }
    }
    Ok(None)
}

/// Maps a terminal worker aggregate to its combine aggregate: the catalog
/// index on the four-function signature first, then the explicit registry
/// mapping.
fn resolve_signature(
    catalog: &CatalogCache,
    agg: &Arc<dyn Aggregate>,
) -> Result<Arc<dyn Aggregate>> {
    let keys = [
        Value::from(agg.combinefn()),
        Value::from(agg.finalfn()),
        Value::from(agg.serializefn()),
        Value::from(agg.deserializefn()),
    ];
    let resolved = match catalog.lookup(CacheId::CombineBySignature, &keys) {
        Some(CatalogTuple::Combine(row)) => lookup(&row.combine_agg),
        _ => lookup_combine_target(
            &agg.combinefn(),
            &agg.finalfn(),
            &agg.serializefn(),
            &agg.deserializefn(),
        ),
    };
    resolved.ok_or_else(|| AnalyzeError::UnknownAggregate(util::MATREL_COMBINE.to_owned()))
}

/// Resolves a combine() whose input is an upstream view's output stream,
/// following the chain of delta columns until a real aggregate is found.
/// Each hop maps `(new).col` on an osrel to the worker target producing
/// `col` in the view that owns it; a target that is itself a combine sends
/// the walk one view further upstream.
pub fn resolve_osrel_combine(
    catalog: &CatalogCache,
    stream_name: &str,
    arg: &Expr,
) -> Result<Arc<dyn Aggregate>> {
    let mut stream_name = stream_name.to_owned();
    let mut arg = arg.clone();

    for _ in 0..MAX_COMBINE_HOPS {
        let stream = catalog
            .stream_by_name(&stream_name)
            .ok_or(AnalyzeError::BadCombineArg)?;
        if !stream.is_output {
            return Err(AnalyzeError::BadCombineArg);
        }
        let upstream = match catalog.lookup(
            CacheId::QueryByOsrel,
            &[Value::Int(i64::from(stream.relid))],
        ) {
            Some(CatalogTuple::Query(q)) => q,
            _ => return Err(AnalyzeError::BadCombineArg),
        };

        let colname = delta_column_name(&arg).ok_or(AnalyzeError::BadCombineArg)?;
        let worker_query = parse_query(&upstream.worker_sql)?;
        let Some((_, expr)) = worker_target_expr(&worker_query, &colname)? else {
            return Err(AnalyzeError::UnknownColumn(colname));
        };

        let Expr::Function(func) = strip(&expr) else {
            return Err(AnalyzeError::BadCombineArg);
        };
        if !util::is_aggregate_fn(&func_name(func)) {
            return Err(AnalyzeError::BadCombineArg);
        }
        let agg = lookup(&func_name(func))
            .ok_or_else(|| AnalyzeError::UnknownAggregate(func_name(func)))?;

        if agg.is_combine() {
            // the upstream target is itself a combine over the next output
            // stream in the chain
            let (args, _) = func_arg_exprs(func);
            arg = args.first().cloned().ok_or(AnalyzeError::BadCombineArg)?;
            stream_name = worker_stream_of(&worker_query)?;
            continue;
        }
        return resolve_signature(catalog, &agg);
    }
    Err(AnalyzeError::Rewrite(
        "combine() chain through output streams is too deep".to_owned(),
    ))
}

/// Resolves every combine() the worker plan carries in place: the dummy
/// aggregate is replaced with the terminal aggregate of the output-stream
/// chain, and the call is marked as merging already-built states rather
/// than transitioning raw values. A combine() over anything but an output
/// stream fails here, at definition time.
pub fn resolve_worker_combines(worker: &mut WorkerPlan, catalog: &CatalogCache) -> Result<()> {
    let stream_name = worker.stream.clone();
    for target in worker.targets.iter_mut() {
        let WorkerTarget::Agg { agg, .. } = target else {
            continue;
        };
        if !agg.agg.is_combine() {
            continue;
        }
        let arg = agg.args.first().ok_or(AnalyzeError::BadCombineArg)?;
        agg.agg = resolve_osrel_combine(catalog, &stream_name, arg)?;
        agg.combines_state = true;
    }
    Ok(())
}

/// Follows a combine() argument through the view's overlay into the matrel
/// column it reads, then finds the worker aggregate producing that column
/// and resolves the combine aggregate for it. A worker target that is
/// itself a combine recurses through the output-stream delta column.
pub fn resolve_combine(
    cv: &ContQueryRow,
    arg: &Expr,
    catalog: &CatalogCache,
) -> Result<ResolvedCombine> {
    let colname = match strip(arg) {
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) => util::figure_colname(arg),
        _ => return Err(AnalyzeError::BadCombineArg),
    };

    // overlay target -> unfinalized matrel column
    let matrel_col = overlay_source_column(cv, &colname)?.unwrap_or(colname);

    // worker target producing that matrel attribute
    let worker_query = parse_query(&cv.worker_sql)?;
    let Some((matrel_attr, expr)) = worker_target_expr(&worker_query, &matrel_col)? else {
        return Err(AnalyzeError::BadCombineArg);
    };
    let worker_agg = match strip(&expr) {
        Expr::Function(func) if util::is_aggregate_fn(&func_name(func)) => {
            lookup(&func_name(func))
        }
        _ => None,
    };
    let agg = worker_agg.ok_or(AnalyzeError::BadCombineArg)?;

    // a combine target stores the terminal aggregate's states, so the
    // chain walk yields the aggregate that merges them
    let resolved = if agg.is_combine() {
        let Expr::Function(func) = strip(&expr) else {
            return Err(AnalyzeError::BadCombineArg);
        };
        let (args, _) = func_arg_exprs(func);
        let inner_arg = args.first().ok_or(AnalyzeError::BadCombineArg)?;
        let stream = worker_stream_of(&worker_query)?;
        resolve_osrel_combine(catalog, &stream, inner_arg)?
    } else {
        resolve_signature(catalog, &agg)?
    };

    Ok(ResolvedCombine {
        matrel_attr,
        agg: resolved,
    })
}

/// Maps an overlay column name back to the matrel column it reads;
/// None when the overlay target is not a simple (possibly combined) column
/// reference.
fn overlay_source_column(cv: &ContQueryRow, colname: &str) -> Result<Option<String>> {
    let overlay_query = parse_query(&cv.overlay_sql)?;
    let overlay_select = query_select(&overlay_query)?;
    for item in &overlay_select.projection {
        let (name, expr) = match item {
            SelectItem::ExprWithAlias { expr, alias } => (alias.value.clone(), expr),
            SelectItem::UnnamedExpr(expr) => (util::figure_colname(expr), expr),
            _ => continue,
        };
        if !name.eq_ignore_ascii_case(colname) {
            continue;
        }
        let source = match strip(expr) {
            Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
                Some(util::figure_colname(expr))
            }
            Expr::Function(func) if func_name(func) == util::MATREL_COMBINE => {
                let (args, _) = func_arg_exprs(func);
                args.first().map(util::figure_colname)
            }
            _ => None,
        };
        return Ok(source);
    }
    Ok(None)
}
