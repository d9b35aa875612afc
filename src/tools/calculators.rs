//! Pure financial calculators

use super::{parse_args, Tool, ToolError, ToolOutcome};
use serde::Deserialize;
use serde_json::{json, Value};

/// Rows in the year-by-year table
const MAX_BREAKDOWN_YEARS: u32 = 10;

#[derive(Debug, Deserialize)]
struct CompoundGrowthArgs {
    principal: f64,
    annual_rate: f64,
    years: u32,
    #[serde(default)]
    monthly_contribution: f64,
}

pub struct CompoundGrowthTool;

#[async_trait::async_trait]
impl Tool for CompoundGrowthTool {
    fn name(&self) -> &'static str {
        "calculate_compound_growth"
    }

    fn description(&self) -> &'static str {
        "Project compound growth of an investment with optional monthly contributions, \
         including a year-by-year breakdown."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "principal": {"type": "number", "description": "Initial investment in dollars"},
                "annual_rate": {"type": "number", "description": "Expected annual return as a decimal, e.g. 0.07"},
                "years": {"type": "integer", "description": "Number of years to grow"},
                "monthly_contribution": {"type": "number", "description": "Monthly contribution in dollars"}
            },
            "required": ["principal", "annual_rate", "years"]
        })
    }

    async fn execute(&self, arguments: &Value) -> ToolOutcome {
        let args: CompoundGrowthArgs = parse_args(arguments)?;

        if args.principal < 0.0 || args.monthly_contribution < 0.0 {
            return Err(ToolError::InvalidArguments(
                "amounts must not be negative".to_string(),
            ));
        }
        if !(-0.99..=1.0).contains(&args.annual_rate) {
            return Err(ToolError::InvalidArguments(format!(
                "annual_rate {} is outside -0.99..=1.0 (pass 0.07 for 7%)",
                args.annual_rate
            )));
        }
        if args.years == 0 || args.years > 100 {
            return Err(ToolError::InvalidArguments("years must be between 1 and 100".to_string()));
        }

        Ok(compound_growth(
            args.principal,
            args.annual_rate,
            args.years,
            args.monthly_contribution,
        ))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn compound_growth(principal: f64, annual_rate: f64, years: u32, monthly_contribution: f64) -> Value {
    let fv_principal = principal * (1.0 + annual_rate).powi(years as i32);

    let months = years * 12;
    let monthly_rate = annual_rate / 12.0;
    let fv_contributions = if monthly_contribution <= 0.0 {
        0.0
    } else if monthly_rate == 0.0 {
        monthly_contribution * months as f64
    } else {
        monthly_contribution * (((1.0 + monthly_rate).powi(months as i32) - 1.0) / monthly_rate)
    };

    let future_value = fv_principal + fv_contributions;
    let contributed = principal + monthly_contribution * months as f64;
    let growth = future_value - contributed;
    let growth_percentage = if contributed > 0.0 {
        round2(growth / contributed * 100.0)
    } else {
        0.0
    };

    json!({
        "initial_investment": principal,
        "monthly_contribution": monthly_contribution,
        "annual_rate_percent": round2(annual_rate * 100.0),
        "years": years,
        "total_contributed": round2(contributed),
        "future_value": round2(future_value),
        "total_growth": round2(growth),
        "growth_percentage": growth_percentage,
        "year_by_year": yearly_breakdown(principal, annual_rate, years, monthly_contribution),
    })
}

/// Month-by-month compounding, reported once per year.
fn yearly_breakdown(principal: f64, annual_rate: f64, years: u32, monthly_contribution: f64) -> Vec<Value> {
    let monthly_rate = annual_rate / 12.0;
    let mut balance = principal;

    (1..=years.min(MAX_BREAKDOWN_YEARS))
        .map(|year| {
            for _ in 0..12 {
                balance = balance * (1.0 + monthly_rate) + monthly_contribution;
            }
            json!({ "year": year, "balance": round2(balance) })
        })
        .collect()
}
