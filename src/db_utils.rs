use rust_decimal::Decimal;
use std::str::FromStr;

use crate::error::PersistenceError;

/// Parses a decimal stored as TEXT, naming the column on failure.
pub(crate) fn decimal_from_db(
    column: &'static str,
    value: &str,
) -> Result<Decimal, PersistenceError> {
    Decimal::from_str(value).map_err(|_| PersistenceError::InvalidDecimal {
        column,
        value: value.to_string(),
    })
}

pub(crate) fn optional_decimal_from_db(
    column: &'static str,
    value: Option<&str>,
) -> Result<Option<Decimal>, PersistenceError> {
    value.map(|value| decimal_from_db(column, value)).transpose()
}

/// Canonical text form: no trailing zeros, so equal amounts compare equal in SQL.
pub(crate) fn decimal_to_db(value: Decimal) -> String {
    value.normalize().to_string()
}
