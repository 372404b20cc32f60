use crate::error::{AnalyzeError, Result};
use sqlparser::ast::{
    Expr, Function, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr, Query, Select,
    SelectItem, SetExpr, Statement,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

pub const CLOCK_TIMESTAMP: &str = "clock_timestamp";
pub const DATE_ROUND: &str = "date_round";
pub const MATREL_COMBINE: &str = "combine";
pub const INTERNAL_COLNAME_PREFIX: &str = "_";

/// Aggregates recognized in a continuous view body, pre-substitution names
/// included.
const AGG_NAMES: &[&str] = &[
    "count",
    "sum",
    "avg",
    "min",
    "max",
    "array_agg",
    "string_agg",
    "json_agg",
    "json_object_agg",
    "jsonb_agg",
    "jsonb_object_agg",
    "rank",
    "dense_rank",
    "percent_rank",
    "cume_dist",
    "percentile_cont",
    "combine",
    "combinable_array_agg",
    "set_agg",
    "hll_count_distinct",
    "combinable_string_agg",
    "combinable_json_agg",
    "combinable_jsonb_agg",
    "combinable_json_object_agg",
    "combinable_jsonb_object_agg",
    "combinable_rank",
    "combinable_dense_rank",
    "combinable_percent_rank",
    "combinable_cume_dist",
    "combinable_percentile_cont",
];

pub fn is_aggregate_fn(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    AGG_NAMES.contains(&lowered.as_str())
}

/// Parses one SELECT statement.
pub fn parse_query(sql: &str) -> Result<Query> {
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| AnalyzeError::Parse(e.to_string()))?;
    if statements.len() != 1 {
        return Err(AnalyzeError::Parse(format!(
            "expected a single statement, got {}",
            statements.len()
        )));
    }
    match statements.into_iter().next() {
        Some(Statement::Query(query)) => Ok(*query),
        _ => Err(AnalyzeError::NotASelect),
    }
}

/// The SELECT body of a query, rejecting set operations and VALUES lists.
pub fn query_select(query: &Query) -> Result<&Select> {
    match query.body.as_ref() {
        SetExpr::Select(select) => Ok(select),
        _ => Err(AnalyzeError::NotASelect),
    }
}

pub fn query_select_mut(query: &mut Query) -> Result<&mut Select> {
    match query.body.as_mut() {
        SetExpr::Select(select) => Ok(select),
        _ => Err(AnalyzeError::NotASelect),
    }
}

/// Parses a standalone expression by wrapping it in a SELECT.
pub fn parse_expr(text: &str) -> Result<Expr> {
    let query = parse_query(&format!("SELECT {text}"))?;
    let select = query_select(&query)?;
    match select.projection.first() {
        Some(SelectItem::UnnamedExpr(expr)) => Ok(expr.clone()),
        _ => Err(AnalyzeError::Parse(format!(
            "could not parse expression {text:?}"
        ))),
    }
}

/// Lowercased unqualified function name.
pub fn func_name(func: &Function) -> String {
    func.name
        .0
        .last()
        .map(|ident| ident.value.to_ascii_lowercase())
        .unwrap_or_default()
}

/// The implicit column name of a target expression, FigureColname style.
pub fn figure_colname(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => ident.value.clone(),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|ident| ident.value.clone())
            .unwrap_or_else(|| "?column?".to_owned()),
        Expr::Cast { expr, .. } => figure_colname(expr),
        Expr::Nested(inner) => figure_colname(inner),
        Expr::Function(func) => func_name(func),
        Expr::Case { .. } => "case".to_owned(),
        _ => "?column?".to_owned(),
    }
}

/// Renders a column name for generated SQL, quoting when necessary.
pub fn ident_sql(name: &str) -> String {
    let bare = !name.is_empty()
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_lowercase() || c == '_')
            .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if bare {
        name.to_owned()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Pre-order walk over an expression tree. Subqueries are not entered.
pub fn for_each_expr(expr: &Expr, f: &mut impl FnMut(&Expr)) {
    f(expr);
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            for_each_expr(left, f);
            for_each_expr(right, f);
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Cast { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::IsTrue(expr)
        | Expr::IsNotTrue(expr)
        | Expr::IsFalse(expr)
        | Expr::IsNotFalse(expr) => for_each_expr(expr, f),
        Expr::Between {
            expr, low, high, ..
        } => {
            for_each_expr(expr, f);
            for_each_expr(low, f);
            for_each_expr(high, f);
        }
        Expr::InList { expr, list, .. } => {
            for_each_expr(expr, f);
            for item in list {
                for_each_expr(item, f);
            }
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(op) = operand {
                for_each_expr(op, f);
            }
            for c in conditions {
                for_each_expr(c, f);
            }
            for r in results {
                for_each_expr(r, f);
            }
            if let Some(e) = else_result {
                for_each_expr(e, f);
            }
        }
        Expr::Tuple(items) => {
            for item in items {
                for_each_expr(item, f);
            }
        }
        Expr::CompositeAccess { expr, .. } => for_each_expr(expr, f),
        Expr::Function(func) => {
            if let FunctionArguments::List(list) = &func.args {
                for arg in &list.args {
                    if let FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
                    | FunctionArg::Named {
                        arg: FunctionArgExpr::Expr(e),
                        ..
                    } = arg
                    {
                        for_each_expr(e, f);
                    }
                }
            }
            for order in &func.within_group {
                for_each_expr(&order.expr, f);
            }
            if let Some(filter) = &func.filter {
                for_each_expr(filter, f);
            }
        }
        _ => {}
    }
}

/// In-place mutation walk, applied bottom-up so replacements don't recurse
/// into themselves.
pub fn mutate_exprs(expr: &mut Expr, f: &mut impl FnMut(&mut Expr)) {
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            mutate_exprs(left, f);
            mutate_exprs(right, f);
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Cast { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::IsTrue(expr)
        | Expr::IsNotTrue(expr)
        | Expr::IsFalse(expr)
        | Expr::IsNotFalse(expr) => mutate_exprs(expr, f),
        Expr::Between {
            expr, low, high, ..
        } => {
            mutate_exprs(expr, f);
            mutate_exprs(low, f);
            mutate_exprs(high, f);
        }
        Expr::InList { expr, list, .. } => {
            mutate_exprs(expr, f);
            for item in list {
                mutate_exprs(item, f);
            }
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(op) = operand {
                mutate_exprs(op, f);
            }
            for c in conditions {
                mutate_exprs(c, f);
            }
            for r in results {
                mutate_exprs(r, f);
            }
            if let Some(e) = else_result {
                mutate_exprs(e, f);
            }
        }
        Expr::Tuple(items) => {
            for item in items {
                mutate_exprs(item, f);
            }
        }
        Expr::CompositeAccess { expr, .. } => mutate_exprs(expr, f),
        Expr::Function(func) => {
            if let FunctionArguments::List(list) = &mut func.args {
                for arg in &mut list.args {
                    if let FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
                    | FunctionArg::Named {
                        arg: FunctionArgExpr::Expr(e),
                        ..
                    } = arg
                    {
                        mutate_exprs(e, f);
                    }
                }
            }
            for order in &mut func.within_group {
                mutate_exprs(&mut order.expr, f);
            }
            if let Some(filter) = &mut func.filter {
                mutate_exprs(filter, f);
            }
        }
        _ => {}
    }
    f(expr);
}

/// Replaces every occurrence of `old` with `new` in the tree.
pub fn replace_expr(root: &mut Expr, old: &Expr, new: &Expr) {
    mutate_exprs(root, &mut |e| {
        if e == old {
            *e = new.clone();
        }
    });
}

/// Collects every column reference in the tree.
pub fn collect_cols(expr: &Expr) -> Vec<Expr> {
    let mut cols = Vec::new();
    for_each_expr(expr, &mut |e| {
        if matches!(e, Expr::Identifier(_) | Expr::CompoundIdentifier(_)) {
            cols.push(e.clone());
        }
    });
    cols
}

/// Collects every function call in the tree.
pub fn collect_funcs(expr: &Expr) -> Vec<Function> {
    let mut funcs = Vec::new();
    for_each_expr(expr, &mut |e| {
        if let Expr::Function(func) = e {
            funcs.push(func.clone());
        }
    });
    funcs
}

/// Collects aggregate calls in the tree.
pub fn collect_agg_funcs(expr: &Expr) -> Vec<Function> {
    collect_funcs(expr)
        .into_iter()
        .filter(|f| is_aggregate_fn(&func_name(f)))
        .collect()
}

pub fn has_clock_timestamp(expr: &Expr) -> bool {
    let mut found = false;
    for_each_expr(expr, &mut |e| {
        if let Expr::Function(func) = e
            && func_name(func) == CLOCK_TIMESTAMP
        {
            found = true;
        }
    });
    found
}

/// Group-by expressions of a SELECT, empty for GROUP BY ALL.
pub fn group_exprs(select: &Select) -> Vec<Expr> {
    match &select.group_by {
        GroupByExpr::Expressions(exprs, _) => exprs.clone(),
        GroupByExpr::All(_) => Vec::new(),
    }
}

/// Positional arguments of a function call, named and qualified-wildcard
/// arguments excluded. `count(*)` yields an empty list with `star` true.
pub fn func_arg_exprs(func: &Function) -> (Vec<Expr>, bool) {
    let mut exprs = Vec::new();
    let mut star = false;
    if let FunctionArguments::List(list) = &func.args {
        for arg in &list.args {
            match arg {
                FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => exprs.push(e.clone()),
                FunctionArg::Unnamed(FunctionArgExpr::Wildcard)
                | FunctionArg::Unnamed(FunctionArgExpr::QualifiedWildcard(_)) => star = true,
                FunctionArg::Named {
                    arg: FunctionArgExpr::Expr(e),
                    ..
                } => exprs.push(e.clone()),
                _ => {}
            }
        }
    }
    (exprs, star)
}

/// Whether the function call carries DISTINCT.
pub fn func_is_distinct(func: &Function) -> bool {
    matches!(
        &func.args,
        FunctionArguments::List(list)
            if matches!(list.duplicate_treatment, Some(sqlparser::ast::DuplicateTreatment::Distinct))
    )
}
