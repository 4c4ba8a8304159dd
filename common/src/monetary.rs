//! Decimal validation helpers.

use rust_decimal::Decimal;

use crate::error::{Result, TradingError};

/// Require a strictly positive decimal, naming the field on failure.
pub fn ensure_positive(value: Decimal, field: &str) -> Result<Decimal> {
    if value <= Decimal::ZERO {
        return Err(TradingError::invalid_field(
            format!("{} must be greater than zero, got {}", field, value),
            field,
        ));
    }
    Ok(value)
}

/// `lhs * rhs`, or `InvalidArgument` on `field` if the product overflows.
pub fn checked_mul(lhs: Decimal, rhs: Decimal, field: &str) -> Result<Decimal> {
    lhs.checked_mul(rhs)
        .ok_or_else(|| TradingError::invalid_field(format!("{} too large", field), field))
}

/// `lhs + rhs`, or `InvalidArgument` on `field` if the sum overflows.
pub fn checked_add(lhs: Decimal, rhs: Decimal, field: &str) -> Result<Decimal> {
    lhs.checked_add(rhs)
        .ok_or_else(|| TradingError::invalid_field(format!("{} too large", field), field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_ensure_positive() {
        assert_eq!(ensure_positive(dec!(0.01), "amount").unwrap(), dec!(0.01));

        let err = ensure_positive(Decimal::ZERO, "amount").unwrap_err();
        assert!(matches!(
            err,
            TradingError::InvalidArgument { field: Some(ref f), .. } if f == "amount"
        ));
        assert!(ensure_positive(dec!(-5), "quantity").is_err());
    }

    #[test]
    fn test_checked_arithmetic() {
        assert_eq!(checked_mul(dec!(100), dec!(1.25), "amount").unwrap(), dec!(125));
        assert_eq!(checked_add(dec!(7900), dec!(-100), "balance").unwrap(), dec!(7800));

        let err = checked_mul(Decimal::MAX, dec!(2), "amount").unwrap_err();
        assert!(matches!(
            err,
            TradingError::InvalidArgument { field: Some(ref f), .. } if f == "amount"
        ));
        assert!(checked_add(Decimal::MAX, Decimal::ONE, "quantity").is_err());
    }
}
