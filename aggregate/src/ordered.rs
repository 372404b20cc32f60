use crate::registry::{Aggregate, AggregateError, Result};
use crate::state::{AggState, HypotheticalState, PercentileState};
use freshet_common::value::{DataType, Value};
use std::cmp::Ordering;

/// Lexicographic comparison of a sort key against the hypothetical row.
fn row_cmp(row: &[Value], hypothetical: &[Value]) -> Option<Ordering> {
    for (a, b) in row.iter().zip(hypothetical.iter()) {
        match a.sql_cmp(b)? {
            Ordering::Equal => continue,
            ord => return Some(ord),
        }
    }
    Some(Ordering::Equal)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypotheticalKind {
    Rank,
    DenseRank,
    PercentRank,
    CumeDist,
}

impl HypotheticalKind {
    fn agg_name(self) -> &'static str {
        match self {
            HypotheticalKind::Rank => "combinable_rank",
            HypotheticalKind::DenseRank => "combinable_dense_rank",
            HypotheticalKind::PercentRank => "combinable_percent_rank",
            HypotheticalKind::CumeDist => "combinable_cume_dist",
        }
    }
}

/// Streaming hypothetical-set aggregate. The standard variants sort their
/// input set; these instead maintain counters against the hypothetical row,
/// which merge cleanly. After WITHIN GROUP flattening the argument list is
/// the hypothetical constants followed by the sort-key expressions, in equal
/// numbers.
pub struct HypotheticalSet {
    kind: HypotheticalKind,
}

impl HypotheticalSet {
    pub fn new(kind: HypotheticalKind) -> Self {
        Self { kind }
    }
}

impl Aggregate for HypotheticalSet {
    fn name(&self) -> &'static str {
        self.kind.agg_name()
    }

    fn state_type(&self) -> DataType {
        DataType::Internal
    }

    fn init(&self) -> AggState {
        AggState::Hypothetical(HypotheticalState::default())
    }

    fn transition(&self, state: &mut AggState, args: &[Value]) -> Result<()> {
        let AggState::Hypothetical(h) = state else {
            return Err(AggregateError::StateMismatch(self.name()));
        };
        if args.is_empty() || args.len() % 2 != 0 {
            return Err(AggregateError::BadArgs {
                agg: self.name(),
                detail: format!(
                    "expected matching hypothetical and sort arguments, got {}",
                    args.len()
                ),
            });
        }
        let half = args.len() / 2;
        if h.hypothetical.is_empty() {
            h.hypothetical = args[..half].to_vec();
        }
        let row = &args[half..];
        h.total += 1;
        match row_cmp(row, &h.hypothetical) {
            Some(Ordering::Less) => {
                h.less += 1;
                h.less_eq += 1;
                if !h
                    .distinct_less
                    .iter()
                    .any(|held| row_cmp(held, row) == Some(Ordering::Equal))
                {
                    h.distinct_less.push(row.to_vec());
                }
            }
            Some(Ordering::Equal) => h.less_eq += 1,
            _ => {}
        }
        Ok(())
    }

    fn combine(&self, state: &mut AggState, other: &AggState) -> Result<()> {
        match (state, other) {
            (AggState::Hypothetical(mine), AggState::Hypothetical(theirs)) => {
                if mine.hypothetical.is_empty() {
                    mine.hypothetical.clone_from(&theirs.hypothetical);
                }
                mine.less += theirs.less;
                mine.less_eq += theirs.less_eq;
                mine.total += theirs.total;
                for row in &theirs.distinct_less {
                    if !mine
                        .distinct_less
                        .iter()
                        .any(|held| row_cmp(held, row) == Some(Ordering::Equal))
                    {
                        mine.distinct_less.push(row.clone());
                    }
                }
                Ok(())
            }
            _ => Err(AggregateError::StateMismatch(self.name())),
        }
    }

    fn finalize(&self, state: &AggState) -> Result<Value> {
        let AggState::Hypothetical(h) = state else {
            return Err(AggregateError::StateMismatch(self.name()));
        };
        Ok(match self.kind {
            HypotheticalKind::Rank => Value::Int(h.less + 1),
            HypotheticalKind::DenseRank => Value::Int(h.distinct_less.len() as i64 + 1),
            HypotheticalKind::PercentRank => {
                if h.total == 0 {
                    Value::Float(0.0)
                } else {
                    Value::Float(h.less as f64 / h.total as f64)
                }
            }
            HypotheticalKind::CumeDist => {
                Value::Float((h.less_eq + 1) as f64 / (h.total + 1) as f64)
            }
        })
    }
}

/// `combinable_percentile_cont(fraction, x)`: the exact mergeable rendition;
/// the state carries the observed values and interpolates at finalize.
pub struct PercentileCont;

impl Aggregate for PercentileCont {
    fn name(&self) -> &'static str {
        "combinable_percentile_cont"
    }

    fn state_type(&self) -> DataType {
        DataType::Internal
    }

    fn init(&self) -> AggState {
        AggState::Percentile(PercentileState::default())
    }

    fn transition(&self, state: &mut AggState, args: &[Value]) -> Result<()> {
        let AggState::Percentile(p) = state else {
            return Err(AggregateError::StateMismatch(self.name()));
        };
        match args.first() {
            Some(v) => {
                if let Some(f) = v.as_float() {
                    p.fraction = f.clamp(0.0, 1.0);
                }
            }
            None => {
                return Err(AggregateError::BadArgs {
                    agg: self.name(),
                    detail: "missing percentile fraction".to_owned(),
                });
            }
        }
        if let Some(v) = args.get(1)
            && let Some(f) = v.as_float()
        {
            p.values.push(f);
        }
        Ok(())
    }

    fn combine(&self, state: &mut AggState, other: &AggState) -> Result<()> {
        match (state, other) {
            (AggState::Percentile(mine), AggState::Percentile(theirs)) => {
                if mine.values.is_empty() {
                    mine.fraction = theirs.fraction;
                }
                mine.values.extend_from_slice(&theirs.values);
                Ok(())
            }
            _ => Err(AggregateError::StateMismatch(self.name())),
        }
    }

    fn finalize(&self, state: &AggState) -> Result<Value> {
        let AggState::Percentile(p) = state else {
            return Err(AggregateError::StateMismatch(self.name()));
        };
        if p.values.is_empty() {
            return Ok(Value::Null);
        }
        let mut sorted = p.values.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        let pos = p.fraction * (sorted.len() - 1) as f64;
        let lower = pos.floor() as usize;
        let upper = pos.ceil() as usize;
        let value = if lower == upper {
            sorted[lower]
        } else {
            let weight = pos - lower as f64;
            sorted[lower] * (1.0 - weight) + sorted[upper] * weight
        };
        Ok(Value::Float(value))
    }
}
