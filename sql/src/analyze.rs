use crate::error::{AnalyzeError, Result};
use crate::expr::eval_const;
use crate::util::{
    self, CLOCK_TIMESTAMP, collect_agg_funcs, figure_colname, func_is_distinct, func_name,
    has_clock_timestamp, parse_query, query_select,
};
use freshet_common::tuple::{ARRIVAL_TIMESTAMP, TupleDesc};
use freshet_common::value::{DataType, Value};
use sqlparser::ast::{
    BinaryOperator, Expr, Join, JoinConstraint, JoinOperator, Query, Select, SelectItem, SetExpr,
    TableFactor, TableWithJoins,
};
use tracing::warn;

/// Which derived query an analysis pass is preparing for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcType {
    Worker,
    Combiner,
}

/// What the relation namespace looks like to the analyzer.
pub trait SchemaProvider {
    fn is_stream(&self, name: &str) -> bool;
    fn relation_exists(&self, name: &str) -> bool;
    fn stream_desc(&self, name: &str) -> Option<TupleDesc>;
    /// Whether `table` has an index on `column`; drives the unindexed-join
    /// notice only.
    fn has_index(&self, table: &str, column: &str) -> bool;
}

/// Everything later phases need to know about a validated CV body.
#[derive(Debug, Clone)]
pub struct ContAnalysis {
    pub query: Query,
    /// The stream read by this CV, unqualified.
    pub stream: String,
    /// Joined ordinary relations.
    pub rels: Vec<String>,
    pub is_sw: bool,
    /// The full sliding-window predicate, when present.
    pub sw_expr: Option<Expr>,
    /// The timestamp column the window predicate constrains.
    pub sw_column: Option<String>,
    /// Window width in microseconds.
    pub sw_interval_us: Option<i64>,
    pub has_aggs: bool,
}

/// Validates a raw SELECT as a legal continuous view body; the rules run in
/// the same order the analysis errors are documented in.
pub fn validate_cont_query(sql: &str, provider: &dyn SchemaProvider) -> Result<ContAnalysis> {
    let query = parse_query(sql)?;
    validate_query(&query, provider, true)?;

    let select = query_select(&query)?;
    let (streams, rels) = collect_rels_and_streams(&select.from, provider)?;
    let stream = streams.into_iter().next().expect("validated stream");
    let has_aggs = select
        .projection
        .iter()
        .any(|item| !collect_agg_funcs(item_expr(item)).is_empty());

    let mut analysis = ContAnalysis {
        stream: stream.clone(),
        rels,
        is_sw: false,
        sw_expr: None,
        sw_column: None,
        sw_interval_us: None,
        has_aggs,
        query,
    };

    let select = query_select(&analysis.query)?;
    if let Some(selection) = &select.selection
        && let Some(pred) = find_clock_timestamp_expr(selection)?
    {
        let desc = provider.stream_desc(&stream);
        let (column, interval_us) = validate_clock_timestamp_expr(&pred, desc.as_ref())?;
        if select.distinct.is_some() {
            return Err(AnalyzeError::SlidingWindowDistinct);
        }
        analysis.is_sw = true;
        analysis.sw_expr = Some(pred);
        analysis.sw_column = Some(column);
        analysis.sw_interval_us = Some(interval_us);
    }

    warn_unindexed_join(query_select(&analysis.query)?, provider);
    Ok(analysis)
}

fn item_expr(item: &SelectItem) -> &Expr {
    static NULL_EXPR: std::sync::LazyLock<Expr> =
        std::sync::LazyLock::new(|| Expr::Value(sqlparser::ast::Value::Null));
    match item {
        SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr,
        _ => &NULL_EXPR,
    }
}

fn validate_query(query: &Query, provider: &dyn SchemaProvider, top_level: bool) -> Result<()> {
    if query.with.is_some() {
        return Err(AnalyzeError::CteNotSupported);
    }
    if query.order_by.is_some() {
        return Err(AnalyzeError::OrderByNotSupported);
    }
    if !query.locks.is_empty() {
        return Err(AnalyzeError::ForUpdateNotSupported);
    }

    let select = query_select(query)?;
    validate_target_list(select)?;

    if select.having.is_some() {
        return Err(AnalyzeError::HavingNotSupported);
    }
    if !select.named_window.is_empty() || collect_windows(select) {
        return Err(AnalyzeError::WindowNotSupported);
    }

    // recurse for a sub-SELECT in FROM
    if top_level
        && select.from.len() == 1
        && select.from[0].joins.is_empty()
        && let TableFactor::Derived { subquery, .. } = &select.from[0].relation
    {
        validate_subselect(subquery, "subqueries in continuous views")?;
        return validate_query(subquery, provider, true);
    }

    let (streams, _rels) = collect_rels_and_streams(&select.from, provider)?;
    if streams.is_empty() {
        return Err(AnalyzeError::NoStream);
    }
    if streams.len() > 1 {
        return Err(AnalyzeError::StreamStreamJoin(streams[1].clone()));
    }

    // no wildcards: the schema of a stream isn't fixed at parse time
    for item in &select.projection {
        match item {
            SelectItem::Wildcard(_) => {
                return Err(AnalyzeError::WildcardTarget("*".to_owned()));
            }
            SelectItem::QualifiedWildcard(name, _) => {
                return Err(AnalyzeError::WildcardTarget(format!("{name}.*")));
            }
            _ => {}
        }
    }

    // DISTINCT inside an aggregate maps to an approximate or set variant,
    // which only count and array_agg have
    for item in &select.projection {
        for func in collect_agg_funcs(item_expr(item)) {
            let name = func_name(&func);
            if func_is_distinct(&func) && name != "count" && name != "array_agg" {
                return Err(AnalyzeError::DistinctAggNotSupported(name));
            }
        }
    }

    Ok(())
}

fn validate_target_list(select: &Select) -> Result<()> {
    for item in &select.projection {
        if let SelectItem::ExprWithAlias { expr, alias } = item
            && alias.value.eq_ignore_ascii_case(ARRIVAL_TIMESTAMP)
        {
            // we don't allow aliasing other columns as arrival_timestamp
            let is_self = matches!(
                expr,
                Expr::Identifier(ident) if ident.value.eq_ignore_ascii_case(ARRIVAL_TIMESTAMP)
            );
            if !is_self {
                return Err(AnalyzeError::ReservedColumn);
            }
        }
    }
    Ok(())
}

fn collect_windows(select: &Select) -> bool {
    let mut found = false;
    for item in &select.projection {
        util::for_each_expr(item_expr(item), &mut |e| {
            if let Expr::Function(func) = e
                && func.over.is_some()
            {
                found = true;
            }
        });
    }
    found
}

fn validate_subselect(query: &Query, object: &str) -> Result<()> {
    let clause = |c: &str| AnalyzeError::BadSubselect {
        object: object.to_owned(),
        clause: c.to_owned(),
    };
    if query.with.is_some() {
        return Err(clause("CTEs"));
    }
    if query.order_by.is_some() {
        return Err(clause("ORDER BY clauses"));
    }
    if query.limit.is_some() || query.offset.is_some() {
        return Err(clause("LIMIT clauses"));
    }
    if !query.locks.is_empty() {
        return Err(clause("FOR UPDATE clauses"));
    }
    let select = query_select(query)?;
    if select.having.is_some() {
        return Err(clause("HAVING clauses"));
    }
    if !util::group_exprs(select).is_empty() {
        return Err(clause("GROUP BY clauses"));
    }
    if select.distinct.is_some() {
        return Err(clause("DISTINCT clauses"));
    }
    for item in &select.projection {
        let expr = item_expr(item);
        if !collect_agg_funcs(expr).is_empty() {
            return Err(clause("aggregates"));
        }
        let mut windowed = false;
        util::for_each_expr(expr, &mut |e| {
            if let Expr::Function(func) = e
                && func.over.is_some()
            {
                windowed = true;
            }
        });
        if windowed {
            return Err(clause("window functions"));
        }
    }
    Ok(())
}

/// Splits FROM relations into streams and ordinary tables, recursing through
/// joins and derived tables.
pub fn collect_rels_and_streams(
    from: &[TableWithJoins],
    provider: &dyn SchemaProvider,
) -> Result<(Vec<String>, Vec<String>)> {
    let mut streams = Vec::new();
    let mut rels = Vec::new();
    for twj in from {
        classify_factor(&twj.relation, provider, &mut streams, &mut rels)?;
        for join in &twj.joins {
            classify_factor(&join.relation, provider, &mut streams, &mut rels)?;
        }
    }
    Ok((streams, rels))
}

fn classify_factor(
    factor: &TableFactor,
    provider: &dyn SchemaProvider,
    streams: &mut Vec<String>,
    rels: &mut Vec<String>,
) -> Result<()> {
    match factor {
        TableFactor::Table { name, .. } => {
            let unqualified = name
                .0
                .last()
                .map(|i| i.value.to_ascii_lowercase())
                .unwrap_or_default();
            if provider.is_stream(&unqualified) {
                streams.push(unqualified);
            } else if provider.relation_exists(&unqualified) {
                rels.push(unqualified);
            } else {
                return Err(AnalyzeError::UnknownRelation(unqualified));
            }
        }
        TableFactor::Derived { subquery, .. } => {
            if let SetExpr::Select(inner) = subquery.body.as_ref() {
                let (s, r) = collect_rels_and_streams(&inner.from, provider)?;
                streams.extend(s);
                rels.extend(r);
            }
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            let (s, r) = collect_rels_and_streams(std::slice::from_ref(table_with_joins), provider)?;
            streams.extend(s);
            rels.extend(r);
        }
        _ => {}
    }
    Ok(())
}

/// Locates the clock_timestamp() predicate in a WHERE tree, enforcing that
/// it appears at most once and only as a top-level conjunct.
pub fn find_clock_timestamp_expr(expr: &Expr) -> Result<Option<Expr>> {
    match expr {
        Expr::Nested(inner) => find_clock_timestamp_expr(inner),
        Expr::BinaryOp { op, left, right } => match op {
            BinaryOperator::And => {
                let l = find_clock_timestamp_expr(left)?;
                let r = find_clock_timestamp_expr(right)?;
                match (l, r) {
                    (Some(_), Some(_)) => Err(AnalyzeError::ClockTimestampCount),
                    (Some(found), None) | (None, Some(found)) => Ok(Some(found)),
                    (None, None) => Ok(None),
                }
            }
            BinaryOperator::Or => {
                if has_clock_timestamp(expr) {
                    Err(AnalyzeError::ClockTimestampPlacement)
                } else {
                    Ok(None)
                }
            }
            _ => {
                if has_clock_timestamp(left) || has_clock_timestamp(right) {
                    Ok(Some(expr.clone()))
                } else {
                    Ok(None)
                }
            }
        },
        Expr::UnaryOp { expr: inner, .. } => {
            if has_clock_timestamp(inner) {
                Err(AnalyzeError::ClockTimestampPlacement)
            } else {
                Ok(None)
            }
        }
        other => {
            if has_clock_timestamp(other) {
                Ok(Some(other.clone()))
            } else {
                Ok(None)
            }
        }
    }
}

/// Checks the located predicate has the canonical shape
/// `<timestamp column> (> | >=) clock_timestamp() - <interval>` or its
/// mirror, and returns the constrained column plus the window width.
pub fn validate_clock_timestamp_expr(
    pred: &Expr,
    stream_desc: Option<&TupleDesc>,
) -> Result<(String, i64)> {
    let bad = |hint: &str| AnalyzeError::BadSlidingWindowExpr {
        hint: if hint.is_empty() {
            String::new()
        } else {
            format!(". {hint}")
        },
    };

    let Expr::BinaryOp { op, left, right } = pred else {
        return Err(bad(""));
    };

    let (col_expr, ct_expr) = if has_clock_timestamp(right) {
        if !matches!(op, BinaryOperator::Gt | BinaryOperator::GtEq) {
            return Err(bad("Try switching the comparison operator to \"<\"."));
        }
        (left.as_ref(), right.as_ref())
    } else {
        if !matches!(op, BinaryOperator::Lt | BinaryOperator::LtEq) {
            return Err(bad("Try switching the comparison operator to \">\"."));
        }
        (right.as_ref(), left.as_ref())
    };

    // clock_timestamp() - <interval literal>
    let Expr::BinaryOp {
        op: BinaryOperator::Minus,
        left: ct_left,
        right: interval,
    } = strip_nested(ct_expr)
    else {
        return Err(bad(""));
    };
    let is_ct_call = matches!(
        strip_nested(ct_left),
        Expr::Function(func) if func_name(func) == CLOCK_TIMESTAMP
    );
    if !is_ct_call {
        return Err(bad(""));
    }
    let interval_us = match eval_const(interval) {
        Ok(Value::Interval(us)) if us > 0 => us,
        _ => return Err(bad("")),
    };

    let column = validate_window_timestamp_expr(col_expr, stream_desc).ok_or_else(|| bad(""))?;
    Ok((column, interval_us))
}

fn strip_nested(expr: &Expr) -> &Expr {
    match expr {
        Expr::Nested(inner) => strip_nested(inner),
        other => other,
    }
}

/// The window column must be datetime-typed: `arrival_timestamp`, a declared
/// timestamp column, or an explicit cast to a timestamp type.
fn validate_window_timestamp_expr(expr: &Expr, stream_desc: Option<&TupleDesc>) -> Option<String> {
    match strip_nested(expr) {
        Expr::Identifier(ident) => {
            let name = ident.value.to_ascii_lowercase();
            if name == ARRIVAL_TIMESTAMP {
                return Some(name);
            }
            match stream_desc {
                Some(desc) => {
                    let idx = desc.attr(&name)?;
                    (desc.columns[idx].data_type == DataType::Timestamp).then_some(name)
                }
                None => Some(name),
            }
        }
        Expr::CompoundIdentifier(parts) => {
            let name = parts.last()?.value.to_ascii_lowercase();
            if name == ARRIVAL_TIMESTAMP {
                return Some(name);
            }
            match stream_desc {
                Some(desc) => {
                    let idx = desc.attr(&name)?;
                    (desc.columns[idx].data_type == DataType::Timestamp).then_some(name)
                }
                None => Some(name),
            }
        }
        Expr::Cast {
            expr, data_type, ..
        } => {
            if crate::expr::cast_target(data_type) == Some(DataType::Timestamp) {
                validate_window_timestamp_expr(expr, None)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Warns about stream-table joins with no index on the joined relation
/// column; the join still runs, it just re-scans.
fn warn_unindexed_join(select: &Select, provider: &dyn SchemaProvider) {
    for twj in &select.from {
        for join in &twj.joins {
            let TableFactor::Table { name, .. } = &join.relation else {
                continue;
            };
            let table = name
                .0
                .last()
                .map(|i| i.value.to_ascii_lowercase())
                .unwrap_or_default();
            if provider.is_stream(&table) || !provider.relation_exists(&table) {
                continue;
            }
            if let Some(constraint) = join_constraint(join) {
                for col in util::collect_cols(&constraint) {
                    let colname = figure_colname(&col).to_ascii_lowercase();
                    if !provider.has_index(&table, &colname) {
                        warn!(
                            "consider creating an index on {table}.{colname} for improved stream-table join performance"
                        );
                    }
                }
            }
        }
    }
}

fn join_constraint(join: &Join) -> Option<Expr> {
    match &join.join_operator {
        JoinOperator::Inner(JoinConstraint::On(expr))
        | JoinOperator::LeftOuter(JoinConstraint::On(expr))
        | JoinOperator::RightOuter(JoinConstraint::On(expr))
        | JoinOperator::FullOuter(JoinConstraint::On(expr)) => Some(expr.clone()),
        _ => None,
    }
}
