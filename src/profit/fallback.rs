use crate::config::FeeConfig;
use crate::models::{ProfitResult, ProfitSource};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProfitError {
    #[error("invalid profit input: {0}")]
    InvalidInput(String),
}

/// Local profit formula.
///
/// `source_price` and `shipping_cost` are in the local currency, `sell_price`
/// in the marketplace currency. Money is rounded to whole local units and
/// margins to integer percent. The rebate variant adds back the consumption
/// tax embedded in the source price, which is refunded on export.
pub fn compute(
    source_price: f64,
    sell_price: f64,
    shipping_cost: f64,
    fees: &FeeConfig,
) -> Result<ProfitResult, ProfitError> {
    check_fees(fees)?;
    check_amount("source_price", source_price)?;
    check_amount("shipping_cost", shipping_cost)?;
    if !sell_price.is_finite() || sell_price <= 0.0 {
        return Err(ProfitError::InvalidInput(format!(
            "sell_price must be positive, got {sell_price}"
        )));
    }

    let revenue = sell_price * fees.fx_rate;
    let fee = revenue * fees.fee_percent + fees.fee_fixed * fees.fx_rate;
    let profit = revenue - source_price - fee - shipping_cost;
    let rebate = source_price * fees.consumption_tax_rate / (1.0 + fees.consumption_tax_rate);
    let profit_with_rebate = profit + rebate;

    Ok(ProfitResult {
        profit_amount: profit.round() as i64,
        profit_margin_pct: percent(profit, revenue),
        profit_amount_with_rebate: profit_with_rebate.round() as i64,
        profit_margin_pct_with_rebate: percent(profit_with_rebate, revenue),
        carrier: None,
        shipping_method: None,
        source: ProfitSource::Fallback,
    })
}

fn percent(amount: f64, revenue: f64) -> i32 {
    (amount / revenue * 100.0).round() as i32
}

fn check_amount(name: &str, value: f64) -> Result<(), ProfitError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ProfitError::InvalidInput(format!(
            "{name} must be a non-negative number, got {value}"
        )));
    }
    Ok(())
}

fn check_fees(fees: &FeeConfig) -> Result<(), ProfitError> {
    if !fees.fx_rate.is_finite() || fees.fx_rate <= 0.0 {
        return Err(ProfitError::InvalidInput(format!(
            "fx_rate must be positive, got {}",
            fees.fx_rate
        )));
    }
    if !(0.0..1.0).contains(&fees.fee_percent) {
        return Err(ProfitError::InvalidInput(format!(
            "fee_percent must be within [0, 1), got {}",
            fees.fee_percent
        )));
    }
    check_amount("fee_fixed", fees.fee_fixed)?;
    if !fees.consumption_tax_rate.is_finite() || fees.consumption_tax_rate < 0.0 {
        return Err(ProfitError::InvalidInput(format!(
            "consumption_tax_rate must be non-negative, got {}",
            fees.consumption_tax_rate
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_fees_produce_expected_profit() {
        let result = compute(5000.0, 50.0, 800.0, &FeeConfig::default()).expect("compute");
        assert_eq!(result.profit_amount, 755);
        assert_eq!(result.profit_margin_pct, 10);
        assert_eq!(result.profit_amount_with_rebate, 1210);
        assert_eq!(result.profit_margin_pct_with_rebate, 16);
        assert_eq!(result.source, ProfitSource::Fallback);
        assert!(result.is_profitable());
    }

    #[test]
    fn identical_inputs_give_identical_results() {
        let fees = FeeConfig::default();
        let first = compute(1234.0, 19.99, 650.0, &fees).expect("first");
        let second = compute(1234.0, 19.99, 650.0, &fees).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn loss_is_reported_as_negative_profit() {
        let result = compute(20000.0, 50.0, 800.0, &FeeConfig::default()).expect("compute");
        assert!(result.profit_amount < 0);
        assert!(result.profit_margin_pct < 0);
        assert!(!result.is_profitable());
    }

    #[test]
    fn zero_sell_price_is_rejected() {
        let err = compute(5000.0, 0.0, 800.0, &FeeConfig::default()).expect_err("zero sell");
        assert!(matches!(err, ProfitError::InvalidInput(_)));
    }

    #[test]
    fn negative_and_non_finite_inputs_are_rejected() {
        let fees = FeeConfig::default();
        assert!(compute(-1.0, 50.0, 800.0, &fees).is_err());
        assert!(compute(5000.0, f64::NAN, 800.0, &fees).is_err());
        assert!(compute(5000.0, 50.0, f64::INFINITY, &fees).is_err());
    }

    #[test]
    fn invalid_fee_config_is_rejected() {
        let bad_fx = FeeConfig {
            fx_rate: 0.0,
            ..FeeConfig::default()
        };
        assert!(compute(5000.0, 50.0, 800.0, &bad_fx).is_err());
        let bad_percent = FeeConfig {
            fee_percent: 1.0,
            ..FeeConfig::default()
        };
        assert!(compute(5000.0, 50.0, 800.0, &bad_percent).is_err());
    }
}
