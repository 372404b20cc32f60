/// Name of the materialization relation backing a continuous view.
pub fn matrel_name(cv: &str) -> String {
    format!("{cv}_mrel")
}

/// Name of the per-view `(old, new)` delta stream.
pub fn osrel_name(cv: &str) -> String {
    format!("{cv}_osrel")
}

/// Name of the view's sequence relation.
pub fn seqrel_name(cv: &str) -> String {
    format!("{cv}_seq")
}

/// Name of the matrel's primary key index.
pub fn pk_index_name(cv: &str) -> String {
    format!("{cv}_mrel_pkey")
}

/// Name of the hashed group-lookup index.
pub fn lookup_index_name(cv: &str) -> String {
    format!("{cv}_mrel_expr_idx")
}

/// True when `name` looks like a matrel name; used for hint text only, the
/// authoritative check is the catalog lookup.
pub fn looks_like_matrel(name: &str) -> bool {
    name.ends_with("_mrel")
}
