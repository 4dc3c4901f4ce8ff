//! Free-form currency text to decimal price.

use std::str::FromStr;

use rust_decimal::Decimal;
use thiserror::Error;

const SEPARATORS: &[char] = &[',', '.'];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PriceError {
    #[error("no digits in price text {0:?}")]
    NoDigits(String),
    #[error("price text {0:?} is not a representable decimal")]
    Unparseable(String),
    #[error("price {value} is at or below the floor of {floor}")]
    BelowFloor { value: Decimal, floor: Decimal },
}

/// Parses prices and rejects anything at or below a configurable floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceParser {
    floor: Decimal,
}

impl PriceParser {
    pub fn new(floor: Decimal) -> Self {
        Self { floor }
    }

    pub fn floor(&self) -> Decimal {
        self.floor
    }

    pub fn parse(&self, text: &str) -> Result<Decimal, PriceError> {
        let value = parse_amount(text)?;
        if value <= self.floor {
            return Err(PriceError::BelowFloor {
                value,
                floor: self.floor,
            });
        }
        Ok(value)
    }
}

pub fn parse_price(text: &str, floor: Decimal) -> Option<Decimal> {
    PriceParser::new(floor).parse(text).ok()
}

/// The first digit run in `text` as a decimal, with no floor applied.
///
/// A separator is decimal only when it is the last one in the run and
/// exactly two digits follow it; every other separator is thousands grouping.
pub fn parse_amount(text: &str) -> Result<Decimal, PriceError> {
    let run = first_digit_run(text).ok_or_else(|| PriceError::NoDigits(text.to_string()))?;
    let digits = resolve_separators(run);
    Decimal::from_str(&digits).map_err(|_| PriceError::Unparseable(text.to_string()))
}

fn first_digit_run(text: &str) -> Option<&str> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let rest = &text[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || SEPARATORS.contains(&c)))
        .unwrap_or(rest.len());
    Some(rest[..end].trim_end_matches(SEPARATORS))
}

fn resolve_separators(run: &str) -> String {
    let only_digits = |s: &str| s.chars().filter(char::is_ascii_digit).collect::<String>();
    match run.rfind(SEPARATORS) {
        Some(idx) if run.len() - idx - 1 == 2 => {
            format!("{}.{}", only_digits(&run[..idx]), &run[idx + 1..])
        }
        _ => only_digits(run),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_symbol_prefixed_grouped_price() {
        assert_eq!(parse_price("€1,299.00", dec!(50)), Some(dec!(1299.00)));
        assert_eq!(parse_price("€ 999", dec!(50)), Some(dec!(999)));
        assert_eq!(parse_price("1.299,00 €", dec!(50)), Some(dec!(1299.00)));
        assert_eq!(parse_price("Price: 1 049.99", dec!(0)), Some(dec!(1)));
    }

    #[test]
    fn three_trailing_digits_mean_thousands() {
        assert_eq!(parse_price("1.234", dec!(50)), Some(dec!(1234)));
        assert_eq!(parse_price("€1,050", dec!(50)), Some(dec!(1050)));
        assert_eq!(parse_price("12.5", dec!(50)), Some(dec!(125)));
    }

    #[test]
    fn first_run_wins() {
        assert_eq!(parse_price("Was €1,199 now €999", dec!(50)), Some(dec!(1199)));
        assert_eq!(parse_price("999.", dec!(50)), Some(dec!(999)));
    }

    #[test]
    fn rejects_missing_digits() {
        assert_eq!(parse_price("abc", dec!(50)), None);
        assert_eq!(parse_price("", dec!(50)), None);
        assert_eq!(
            PriceParser::new(dec!(50)).parse("call us"),
            Err(PriceError::NoDigits("call us".into()))
        );
    }

    #[test]
    fn floor_is_exclusive() {
        assert_eq!(parse_price("€45", dec!(50)), None);
        assert_eq!(parse_price("€50", dec!(50)), None);
        assert_eq!(parse_price("€50.01", dec!(50)), Some(dec!(50.01)));
        assert_eq!(parse_price("€45", dec!(10)), Some(dec!(45)));
        assert!(matches!(
            PriceParser::new(dec!(50)).parse("€45"),
            Err(PriceError::BelowFloor { .. })
        ));
    }

    #[test]
    fn oversized_runs_are_unparseable() {
        let text = "9".repeat(40);
        assert!(matches!(parse_amount(&text), Err(PriceError::Unparseable(_))));
    }
}
