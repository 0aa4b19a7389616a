use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Longest product code the venue accepts, e.g. `CASCAR-ALLOY`.
const MAX_CODE_LEN: usize = 32;

/// A tradable product code such as `GUACA` or `PALTA-OIL`.
///
/// Codes are uppercase ASCII letters, digits and `-`. On the wire a product
/// is a plain JSON string; parsing rejects anything else.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Product(String);

impl Product {
    /// Returns the product code, e.g `"GUACA"`.
    pub fn code(&self) -> &str {
        &self.0
    }

    /// The catalogue the venue seeds tickers for when no config overrides it.
    pub fn default_catalogue() -> Vec<Product> {
        DEFAULT_CATALOGUE
            .iter()
            .map(|c| Product((*c).to_string()))
            .collect()
    }
}

const DEFAULT_CATALOGUE: &[&str] = &[
    "GUACA",
    "SEBO",
    "PALTA-OIL",
    "FOSFO",
    "NUCREM",
    "CASCAR-ALLOY",
    "GTRON",
    "H-GUACA",
    "PITA",
];

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Product {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && s.len() <= MAX_CODE_LEN
            && s
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-');
        if valid {
            Ok(Product(s.to_string()))
        } else {
            Err(format!("invalid product: `{}`", s))
        }
    }
}

impl TryFrom<String> for Product {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Product> for String {
    fn from(p: Product) -> Self {
        p.0
    }
}
