use crate::analyze::{ContAnalysis, ProcType};
use crate::error::{AnalyzeError, Result};
use crate::expr::eval_const;
use crate::util::{
    self, DATE_ROUND, INTERNAL_COLNAME_PREFIX, MATREL_COMBINE, collect_agg_funcs,
    figure_colname, func_is_distinct, func_name, has_clock_timestamp, ident_sql, parse_expr,
    query_select,
};
use freshet_common::time::{USECS_PER_SEC, format_interval};
use freshet_common::value::Value;
use sqlparser::ast::{
    Distinct, Expr, Function, FunctionArg, FunctionArgExpr, FunctionArguments, Ident, ObjectName,
};

/// The streaming variants of aggregates that either aren't combinable as-is
/// or aren't feasible over unbounded input.
const STREAMING_VARIANTS: &[(&str, &str, bool)] = &[
    ("array_agg", "combinable_array_agg", false),
    ("array_agg", "set_agg", true),
    ("count", "hll_count_distinct", true),
    ("json_agg", "combinable_json_agg", false),
    ("json_object_agg", "combinable_json_object_agg", false),
    ("jsonb_agg", "combinable_jsonb_agg", false),
    ("jsonb_object_agg", "combinable_jsonb_object_agg", false),
    ("string_agg", "combinable_string_agg", false),
    ("rank", "combinable_rank", false),
    ("dense_rank", "combinable_dense_rank", false),
    ("percent_rank", "combinable_percent_rank", false),
    ("percentile_cont", "combinable_percentile_cont", false),
    ("cume_dist", "combinable_cume_dist", false),
];

fn get_streaming_agg(name: &str, distinct: bool) -> Option<&'static str> {
    STREAMING_VARIANTS
        .iter()
        .find(|(base, _, distinct_only)| {
            base.eq_ignore_ascii_case(name) && *distinct_only == distinct
        })
        .map(|(_, variant, _)| *variant)
}

/// One target-list entry under rewrite.
#[derive(Debug, Clone, PartialEq)]
pub struct ResTarget {
    pub name: String,
    pub val: Expr,
}

impl ResTarget {
    fn new(val: Expr, name: String) -> Self {
        Self { name, val }
    }
}

/// A generated SELECT, rendered back to SQL text for planning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectSpec {
    pub distinct_on: Vec<Expr>,
    pub targets: Vec<ResTarget>,
    pub from: String,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
}

impl SelectSpec {
    pub fn to_sql(&self) -> String {
        let mut sql = String::from("SELECT ");
        if !self.distinct_on.is_empty() {
            let on: Vec<String> = self.distinct_on.iter().map(|e| e.to_string()).collect();
            sql.push_str(&format!("DISTINCT ON ({}) ", on.join(", ")));
        }
        let targets: Vec<String> = self
            .targets
            .iter()
            .map(|t| format!("{} AS {}", t.val, ident_sql(&t.name)))
            .collect();
        sql.push_str(&targets.join(", "));
        sql.push_str(&format!(" FROM {}", self.from));
        if let Some(where_clause) = &self.where_clause {
            sql.push_str(&format!(" WHERE {where_clause}"));
        }
        if !self.group_by.is_empty() {
            let group: Vec<String> = self.group_by.iter().map(|e| e.to_string()).collect();
            sql.push_str(&format!(" GROUP BY {}", group.join(", ")));
        }
        if let Some(limit) = &self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = &self.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        sql
    }
}

/// Worker-or-combiner query plus the overlay view derived alongside it.
#[derive(Debug, Clone)]
pub struct TransformResult {
    pub proc: SelectSpec,
    pub view: SelectSpec,
    /// Matrel column carrying the (possibly truncated) window timestamp.
    pub sw_time_col: Option<String>,
    pub view_combines: bool,
}

struct RewriteContext {
    colnames: Vec<String>,
    colno: u32,
    hoisted_name: Option<String>,
    view_combines: bool,
}

impl RewriteContext {
    fn note_colname(&mut self, name: &str) {
        if !self
            .colnames
            .iter()
            .any(|c| c.eq_ignore_ascii_case(name))
        {
            self.colnames.push(name.to_owned());
        }
    }

    /// A fresh `_N` column name, preferring the hoisted source column name
    /// when it is still free.
    fn unique_colname(&mut self) -> String {
        if let Some(hoisted) = self.hoisted_name.clone()
            && !self
                .colnames
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&hoisted))
        {
            self.colnames.push(hoisted.clone());
            return hoisted;
        }
        loop {
            let candidate = format!("{INTERNAL_COLNAME_PREFIX}{}", self.colno);
            self.colno += 1;
            if !self
                .colnames
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&candidate))
            {
                self.colnames.push(candidate.clone());
                return candidate;
            }
        }
    }
}

fn make_cref(name: &str) -> Expr {
    let bare = name
        .chars()
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if bare {
        Expr::Identifier(Ident::new(name))
    } else {
        Expr::Identifier(Ident::with_quote('"', name))
    }
}

fn cref_of(rt: &ResTarget) -> Expr {
    make_cref(&rt.name)
}

/// Equality modulo type casts and parentheses, so `x` finds a projected
/// `x::int` instead of hoisting a second copy.
fn no_tc_equal(a: &Expr, b: &Expr) -> bool {
    fn strip_casts(expr: &Expr) -> &Expr {
        match expr {
            Expr::Nested(inner) => strip_casts(inner),
            Expr::Cast { expr: inner, .. } => strip_casts(inner),
            other => other,
        }
    }
    a == b || strip_casts(a) == strip_casts(b)
}

/// Returns a column reference to the target-list entry holding `node`,
/// hoisting it under a fresh name when it isn't projected yet.
fn hoist_node(target_list: &mut Vec<ResTarget>, node: &Expr, ctx: &mut RewriteContext) -> Expr {
    if let Some(rt) = target_list.iter().find(|rt| no_tc_equal(&rt.val, node)) {
        return cref_of(rt);
    }
    let name = ctx.unique_colname();
    target_list.push(ResTarget::new(node.clone(), name.clone()));
    make_cref(&name)
}

/// combine(col), the overlay/combiner merge call.
fn apply_combine(name: &str) -> Result<Expr> {
    parse_expr(&format!("{MATREL_COMBINE}({})", ident_sql(name)))
}

/// What the overlay shows for a worker aggregate: a plain column reference,
/// or a combine() over it when the view merges multiple matrel rows on read.
fn agg_node_for_view_overlay(colname: &str, ctx: &RewriteContext) -> Result<Expr> {
    if ctx.view_combines {
        apply_combine(colname)
    } else {
        Ok(make_cref(colname))
    }
}

fn is_constant_expr(expr: &Expr) -> bool {
    util::collect_funcs(expr).is_empty() && util::collect_cols(expr).is_empty()
}

/// Rewrites the target list to select from matrel columns, wrapping
/// aggregate columns in combine(). Constant expressions are re-evaluated
/// rather than referenced, since they are never grouped.
fn select_from_matrel(target_list: &[ResTarget]) -> Result<Vec<ResTarget>> {
    let mut result = Vec::with_capacity(target_list.len());
    for rt in target_list {
        let val = if is_constant_expr(&rt.val) {
            rt.val.clone()
        } else {
            cref_of(rt)
        };
        let mut matrel_res = ResTarget::new(val, rt.name.clone());
        if !collect_agg_funcs(&rt.val).is_empty()
            && matches!(strip(&rt.val), Expr::Function(_))
        {
            matrel_res.val = apply_combine(&rt.name)?;
        }
        result.push(matrel_res);
    }
    Ok(result)
}

fn strip(expr: &Expr) -> &Expr {
    match expr {
        Expr::Nested(inner) => strip(inner),
        other => other,
    }
}

/// Replaces aggregates with their streaming variants and flattens
/// WITHIN GROUP order expressions into trailing positional arguments.
fn rewrite_streaming_aggs(targets: &mut [ResTarget]) -> Result<()> {
    for rt in targets.iter_mut() {
        let mut failed: Option<AnalyzeError> = None;
        util::mutate_exprs(&mut rt.val, &mut |e| {
            if let Expr::Function(func) = e
                && util::is_aggregate_fn(&func_name(func))
            {
                if let Some(variant) = get_streaming_agg(&func_name(func), func_is_distinct(func))
                {
                    func.name = ObjectName(vec![Ident::new(variant)]);
                    if let FunctionArguments::List(list) = &mut func.args {
                        list.duplicate_treatment = None;
                    }
                }
                if !func.within_group.is_empty()
                    && let Err(e) = rewrite_within_group_agg(func)
                {
                    failed = Some(e);
                }
            }
        });
        if let Some(err) = failed {
            return Err(err);
        }
    }
    Ok(())
}

/// The streaming ordered-set variants take their sort keys as plain trailing
/// arguments; the input set is never sorted.
fn rewrite_within_group_agg(func: &mut Function) -> Result<()> {
    let order = std::mem::take(&mut func.within_group);
    match &mut func.args {
        FunctionArguments::List(list) => {
            for sort in order {
                if matches!(sort.expr, Expr::Tuple(_)) {
                    return Err(AnalyzeError::Rewrite(
                        "argument type record is unsupported".to_owned(),
                    ));
                }
                list.args
                    .push(FunctionArg::Unnamed(FunctionArgExpr::Expr(sort.expr)));
            }
            Ok(())
        }
        _ => Err(AnalyzeError::Rewrite(
            "WITHIN GROUP aggregate has no argument list".to_owned(),
        )),
    }
}

/// Hoistable columns are top-level column references and columns inside
/// expressions, but never columns inside function calls; those are only
/// needed by the worker.
fn collect_hoistable_cols(expr: &Expr, cols: &mut Vec<Expr>, casts: &mut Vec<Expr>) {
    match expr {
        Expr::Function(_) => {}
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) => cols.push(expr.clone()),
        Expr::Cast { expr: inner, .. } => {
            if matches!(
                inner.as_ref(),
                Expr::Identifier(_) | Expr::CompoundIdentifier(_)
            ) {
                casts.push(expr.clone());
            }
            collect_hoistable_cols(inner, cols, casts);
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_hoistable_cols(left, cols, casts);
            collect_hoistable_cols(right, cols, casts);
        }
        Expr::UnaryOp { expr: inner, .. } | Expr::Nested(inner) => {
            collect_hoistable_cols(inner, cols, casts);
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(op) = operand {
                collect_hoistable_cols(op, cols, casts);
            }
            for c in conditions {
                collect_hoistable_cols(c, cols, casts);
            }
            for r in results {
                collect_hoistable_cols(r, cols, casts);
            }
            if let Some(e) = else_result {
                collect_hoistable_cols(e, cols, casts);
            }
        }
        _ => {}
    }
}

/// `max(1 second, window * step_factor / 100)` rendered as a date_round call
/// on the window column.
fn truncation_from_interval(time: &Expr, window_us: i64, step_factor: f64) -> Result<Expr> {
    let mut step = (window_us as f64 * step_factor / 100.0).round() as i64;
    if step < USECS_PER_SEC {
        step = USECS_PER_SEC;
    }
    parse_expr(&format!(
        "{DATE_ROUND}({time}, interval '{}')",
        format_interval(step)
    ))
}

struct SlidingWindowParts {
    time: Expr,
    window_us: i64,
}

fn sliding_window_parts(sw_expr: &Expr) -> Result<SlidingWindowParts> {
    let Expr::BinaryOp { left, right, .. } = sw_expr else {
        return Err(AnalyzeError::Rewrite(
            "sliding-window predicate is not a comparison".to_owned(),
        ));
    };
    let (time, ct_side) = if has_clock_timestamp(left) {
        (right.as_ref().clone(), left.as_ref())
    } else {
        (left.as_ref().clone(), right.as_ref())
    };
    let Expr::BinaryOp {
        right: interval, ..
    } = strip(ct_side)
    else {
        return Err(AnalyzeError::Rewrite(
            "sliding-window predicate has no interval".to_owned(),
        ));
    };
    let window_us = match eval_const(interval) {
        Ok(Value::Interval(us)) if us > 0 => us,
        _ => {
            return Err(AnalyzeError::Rewrite(
                "sliding-window interval is not constant".to_owned(),
            ));
        }
    };
    Ok(SlidingWindowParts { time, window_us })
}

/// Replaces the window timestamp with its truncation in the projection and
/// grouping, hoists it, and makes sure it is grouped.
fn hoist_time_node(
    targets: &mut Vec<ResTarget>,
    group: &mut Vec<Expr>,
    time: &Expr,
    truncated: &Expr,
    proc_type: ProcType,
    ctx: &mut RewriteContext,
) -> Expr {
    for rt in targets.iter_mut() {
        if rt.val == *time {
            rt.val = truncated.clone();
        }
    }
    for node in group.iter_mut() {
        if node == time {
            *node = truncated.clone();
        }
    }

    let cref = hoist_node(targets, truncated, ctx);

    if !group.iter().any(|n| n == truncated || *n == cref) {
        match proc_type {
            ProcType::Combiner => group.push(cref.clone()),
            ProcType::Worker => group.push(truncated.clone()),
        }
    }
    cref
}

/// Produces the worker-or-combiner query and the overlay view from a
/// validated CV body. Ported behavior: named targets, explicit distincts,
/// sliding-window truncation, streaming-variant substitution, hoisting,
/// matrel wiring.
pub fn transform_select_for_cont_process(
    analysis: &ContAnalysis,
    matrel: &str,
    sw_step_factor: f64,
    proc_type: ProcType,
) -> Result<TransformResult> {
    let select = query_select(&analysis.query)?;

    // working copies
    let mut targets: Vec<ResTarget> = Vec::new();
    for item in &select.projection {
        match item {
            sqlparser::ast::SelectItem::UnnamedExpr(expr) => {
                targets.push(ResTarget::new(expr.clone(), figure_colname(expr)));
            }
            sqlparser::ast::SelectItem::ExprWithAlias { expr, alias } => {
                targets.push(ResTarget::new(expr.clone(), alias.value.clone()));
            }
            _ => {
                return Err(AnalyzeError::Rewrite(
                    "wildcard target survived analysis".to_owned(),
                ));
            }
        }
    }
    let mut group = util::group_exprs(select);
    let where_clause = select.selection.clone();
    let from_text = select
        .from
        .iter()
        .map(|twj| twj.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    let mut ctx = RewriteContext {
        colnames: Vec::new(),
        colno: 0,
        hoisted_name: None,
        view_combines: false,
    };
    for rt in &targets {
        ctx.note_colname(&rt.name);
    }
    for rt in &targets {
        for col in util::collect_cols(&rt.val) {
            ctx.note_colname(&figure_colname(&col));
        }
    }

    let tl_len = targets.len();
    let grp_len = group.len();
    let mut view = SelectSpec {
        from: ident_sql(matrel),
        ..SelectSpec::default()
    };

    // make the distinctClause explicit before anything else changes the
    // target list
    let mut distinct_on: Vec<Expr> = Vec::new();
    match &select.distinct {
        Some(Distinct::Distinct) => {
            let vals: Vec<Expr> = targets.iter().map(|rt| rt.val.clone()).collect();
            for val in vals {
                let cref = hoist_node(&mut targets, &val, &mut ctx);
                distinct_on.push(cref);
            }
        }
        Some(Distinct::On(exprs)) => {
            for e in exprs {
                let cref = hoist_node(&mut targets, e, &mut ctx);
                distinct_on.push(cref);
            }
        }
        None => {}
    }

    ctx.view_combines = analysis.is_sw && (analysis.has_aggs || !group.is_empty());

    let mut sw_time_col = None;
    if analysis.is_sw {
        let sw_expr = analysis
            .sw_expr
            .clone()
            .ok_or_else(|| AnalyzeError::Rewrite("missing sliding-window predicate".to_owned()))?;
        let parts = sliding_window_parts(&sw_expr)?;

        let time_cols = util::collect_cols(&parts.time);
        ctx.hoisted_name = time_cols.first().map(figure_colname);

        let cref = if ctx.view_combines {
            let truncated = truncation_from_interval(&parts.time, parts.window_us, sw_step_factor)?;
            hoist_time_node(
                &mut targets,
                &mut group,
                &parts.time,
                &truncated,
                proc_type,
                &mut ctx,
            )
        } else {
            hoist_node(&mut targets, &parts.time, &mut ctx)
        };
        ctx.hoisted_name = None;

        // the overlay re-applies the original window predicate against the
        // hoisted matrel column
        let mut view_where = sw_expr.clone();
        util::replace_expr(&mut view_where, &parts.time, &cref);
        view.where_clause = Some(view_where);
        if let Expr::Identifier(ident) = &cref {
            sw_time_col = Some(ident.value.clone());
        }
    }

    rewrite_streaming_aggs(&mut targets)?;

    // hoist the grouping expressions that aren't projected; the entry the
    // sliding-window projection appended past grp_len is already hoisted
    // and grouped, and it must stay out of the overlay's GROUP BY so the
    // view merges across window buckets
    let mut new_group = Vec::with_capacity(group.len());
    for node in &group[..grp_len].to_vec() {
        let cref = hoist_node(&mut targets, node, &mut ctx);
        if ctx.view_combines {
            view.group_by.push(cref.clone());
        }
        match proc_type {
            ProcType::Combiner => new_group.push(cref),
            ProcType::Worker => new_group.push(node.clone()),
        }
    }
    new_group.extend(group[grp_len..].iter().cloned());
    group = new_group;

    // hoist distinct expressions the same way
    let mut distinct_on_hoisted = Vec::with_capacity(distinct_on.len());
    for node in &distinct_on {
        distinct_on_hoisted.push(hoist_node(&mut targets, node, &mut ctx));
    }

    let mut tmp_list: Vec<ResTarget> = targets[tl_len..].to_vec();
    let mut has_aggs = false;

    for rt in targets[..tl_len].to_vec() {
        let aggs = collect_agg_funcs(&rt.val);

        if aggs.is_empty() {
            // combiners read from the worker's output columns, which are
            // the same as the matrel's
            view.targets
                .push(ResTarget::new(cref_of(&rt), rt.name.clone()));
            tmp_list.push(rt);
            continue;
        }

        has_aggs = true;

        // a bare top-level aggregate needs no expression rewriting
        if matches!(strip(&rt.val), Expr::Function(f) if util::is_aggregate_fn(&func_name(f))) {
            let node = agg_node_for_view_overlay(&rt.name, &ctx)?;
            view.targets.push(ResTarget::new(node, rt.name.clone()));
            tmp_list.push(rt);
            continue;
        }

        // an expression over aggregates: hoist the columns and aggregates
        // out, then let the overlay compute the expression over the matrel
        let mut res_val = rt.val.clone();

        let mut cols = Vec::new();
        let mut casts = Vec::new();
        collect_hoistable_cols(&rt.val, &mut cols, &mut casts);

        for col in &cols {
            let node = casts
                .iter()
                .find(|tc| matches!(tc, Expr::Cast { expr, .. } if expr.as_ref() == col))
                .filter(|tc| tmp_list.iter().any(|rt| rt.val == **tc))
                .cloned()
                .unwrap_or_else(|| col.clone());
            let cref = hoist_node(&mut tmp_list, &node, &mut ctx);
            util::replace_expr(&mut res_val, &node, &cref);
        }

        for agg in &aggs {
            let agg_expr = Expr::Function(agg.clone());
            let cref = hoist_node(&mut tmp_list, &agg_expr, &mut ctx);
            let colname = match &cref {
                Expr::Identifier(ident) => ident.value.clone(),
                _ => continue,
            };
            let replacement = agg_node_for_view_overlay(&colname, &ctx)?;
            util::replace_expr(&mut res_val, &agg_expr, &replacement);
        }

        view.targets.push(ResTarget::new(res_val, rt.name.clone()));
    }

    let mut proc = SelectSpec {
        from: from_text,
        where_clause,
        limit: None,
        offset: None,
        ..SelectSpec::default()
    };

    if proc_type == ProcType::Combiner {
        tmp_list = select_from_matrel(&tmp_list)?;
        proc.from = ident_sql(matrel);
    }
    proc.targets = tmp_list;
    proc.group_by = group;

    // SELECT DISTINCT becomes grouping so results can be maintained
    // incrementally across batches
    if !distinct_on_hoisted.is_empty() && !has_aggs {
        proc.group_by = proc.targets.iter().map(cref_of).collect();
        view.distinct_on = distinct_on_hoisted;
    } else {
        proc.distinct_on = distinct_on_hoisted;
    }

    // limits apply on read, not while maintaining state
    view.limit = analysis.query.limit.clone();
    view.offset = analysis.query.offset.as_ref().map(|o| o.value.clone());

    if proc_type == ProcType::Combiner {
        // the worker already did the WHERE filtering
        proc.where_clause = None;
        for rt in proc.targets.iter_mut() {
            util::mutate_exprs(&mut rt.val, &mut |e| {
                if let Expr::Function(func) = e {
                    func.filter = None;
                }
            });
        }
    }

    Ok(TransformResult {
        proc,
        view,
        sw_time_col,
        view_combines: ctx.view_combines,
    })
}
