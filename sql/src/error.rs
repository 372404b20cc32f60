use thiserror::Error;

/// Analysis and rewrite failures, surfaced to the DDL-issuing client.
#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("syntax error: {0}")]
    Parse(String),
    #[error("continuous views can only be defined using SELECT queries")]
    NotASelect,
    #[error("continuous queries don't support CTEs")]
    CteNotSupported,
    #[error("continuous queries don't support HAVING clauses")]
    HavingNotSupported,
    #[error("continuous queries don't support WINDOW functions")]
    WindowNotSupported,
    #[error("continuous queries don't support ORDER BY")]
    OrderByNotSupported,
    #[error("continuous queries don't support FOR UPDATE clauses")]
    ForUpdateNotSupported,
    #[error("continuous queries must include a stream in the FROM clause")]
    NoStream,
    #[error(
        "continuous queries don't support stream-stream JOINs. If \"{0}\" is supposed to be a relation, create it first with CREATE TABLE."
    )]
    StreamStreamJoin(String),
    #[error("can't select \"{0}\" in continuous queries. Explicitly state the columns you want to SELECT.")]
    WildcardTarget(String),
    #[error("continuous queries don't support DISTINCT expressions for \"{0}\" aggregate")]
    DistinctAggNotSupported(String),
    #[error("clock_timestamp() may only appear once in a WHERE clause")]
    ClockTimestampCount,
    #[error("clock_timestamp() may only appear as a top-level conjunction predicate")]
    ClockTimestampPlacement,
    #[error(
        "sliding window expressions must look like <timestamp column> > clock_timestamp() - <interval>{hint}"
    )]
    BadSlidingWindowExpr { hint: String },
    #[error("sliding window continuous queries don't allow a DISTINCT clause")]
    SlidingWindowDistinct,
    #[error("{object} cannot contain {clause}")]
    BadSubselect { object: String, clause: String },
    #[error("arrival_timestamp is a reserved column name")]
    ReservedColumn,
    #[error("relation \"{0}\" does not exist")]
    UnknownRelation(String),
    #[error("column \"{0}\" does not exist")]
    UnknownColumn(String),
    #[error("aggregate \"{0}\" does not exist")]
    UnknownAggregate(String),
    #[error("\"step_factor\" must be a valid integer in the range 1..50. For example, ... WITH (step_factor = 25) ...")]
    BadStepFactor,
    #[error("can only specify \"step_factor\" for sliding window queries")]
    StepFactorWithoutWindow,
    #[error("invalid value for option \"{option}\": {detail}")]
    BadOption { option: String, detail: String },
    #[error("streams can only be read from a continuous view's FROM clause")]
    StreamOutsideCont,
    #[error("combine() argument must be a continuous view aggregate column")]
    BadCombineArg,
    #[error("duplicate column name \"{0}\" in continuous view target list")]
    DuplicateColumn(String),
    #[error("internal rewrite error: {0}")]
    Rewrite(String),
}

pub type Result<T> = std::result::Result<T, AnalyzeError>;
