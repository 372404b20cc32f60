use crate::error::{AnalyzeError, Result};
use crate::util::{parse_expr, parse_query, query_select_mut};
use freshet_catalog::types::ContAction;
use freshet_common::time::parse_interval;
use freshet_common::tuple::ARRIVAL_TIMESTAMP;
use sqlparser::ast::Expr;

/// Recognized WITH options of CREATE CONTINUOUS VIEW / TRANSFORM. Unknown
/// keys are forwarded to matrel storage untouched.
#[derive(Debug, Clone, Default)]
pub struct ViewOptions {
    pub sw: Option<String>,
    pub sw_column: Option<String>,
    pub step_factor: Option<u8>,
    pub action: Option<String>,
    pub outputfunc: Option<String>,
    pub ttl: Option<String>,
    pub ttl_column: Option<String>,
    pub storage: Vec<(String, String)>,
}

impl ViewOptions {
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self> {
        let mut options = ViewOptions::default();
        for (key, value) in pairs {
            match key.to_ascii_lowercase().as_str() {
                "sw" => options.sw = Some(value.clone()),
                "sw_column" => options.sw_column = Some(value.clone()),
                "step_factor" => options.step_factor = Some(parse_step_factor(value)?),
                "action" => options.action = Some(value.to_ascii_lowercase()),
                "outputfunc" => options.outputfunc = Some(value.clone()),
                "ttl" => options.ttl = Some(value.clone()),
                "ttl_column" => options.ttl_column = Some(value.clone()),
                _ => options.storage.push((key.clone(), value.clone())),
            }
        }
        Ok(options)
    }

    pub fn action(&self) -> Result<ContAction> {
        match self.action.as_deref() {
            None | Some("materialize") => Ok(ContAction::Materialize),
            Some("transform") => Ok(ContAction::Transform),
            Some("dumped") => Ok(ContAction::Dumped),
            Some(other) => Err(AnalyzeError::BadOption {
                option: "action".to_owned(),
                detail: format!("unknown action {other:?}"),
            }),
        }
    }

    /// TTL width in microseconds, when requested.
    pub fn ttl_us(&self) -> Result<Option<i64>> {
        match &self.ttl {
            None => Ok(None),
            Some(text) => parse_interval(text)
                .map(Some)
                .map_err(|e| AnalyzeError::BadOption {
                    option: "ttl".to_owned(),
                    detail: e.to_string(),
                }),
        }
    }
}

/// step_factor accepts integer percents in 1..=50 only.
fn parse_step_factor(raw: &str) -> Result<u8> {
    let trimmed = raw.trim();
    let value: i64 = trimmed.parse().map_err(|_| AnalyzeError::BadStepFactor)?;
    if !(1..=50).contains(&value) {
        return Err(AnalyzeError::BadStepFactor);
    }
    Ok(value as u8)
}

/// Rewrites the CV body to carry the sliding-window predicate the `sw`
/// option describes:
/// `WHERE <col> > clock_timestamp() - interval '<sw>'`, AND-conjoined with
/// any existing predicate.
pub fn apply_sliding_window(sql: &str, sw: &str, sw_column: Option<&str>) -> Result<String> {
    parse_interval(sw).map_err(|e| AnalyzeError::BadOption {
        option: "sw".to_owned(),
        detail: e.to_string(),
    })?;

    // we default to arrival_timestamp since every stream has it
    let column = sw_column.unwrap_or(ARRIVAL_TIMESTAMP);
    let predicate: Expr =
        parse_expr(&format!("{column} > clock_timestamp() - interval '{sw}'"))?;

    let mut query = parse_query(sql)?;
    let select = query_select_mut(&mut query)?;
    select.selection = match select.selection.take() {
        Some(existing) => Some(parse_expr(&format!("({existing}) AND ({predicate})"))?),
        None => Some(predicate),
    };
    Ok(query.to_string())
}

/// Options sanity that needs the analysis outcome: step_factor means
/// nothing without a window.
pub fn check_window_options(options: &ViewOptions, is_sw: bool) -> Result<()> {
    if options.step_factor.is_some() && !is_sw && options.sw.is_none() {
        return Err(AnalyzeError::StepFactorWithoutWindow);
    }
    Ok(())
}
