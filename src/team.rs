use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    product::Product,
    production::{Recipe, Role},
};

/// Durable record of a participant. The ledger is rebuilt from these on startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub name: String,
    pub token: String,
    pub species: String,
    pub initial_balance: Decimal,
    pub balance: Decimal,
    #[serde(default)]
    pub inventory: BTreeMap<String, u64>,
    #[serde(default)]
    pub authorized_products: Vec<Product>,
    #[serde(default)]
    pub recipes: BTreeMap<String, Recipe>,
    #[serde(default)]
    pub role: Role,
}

impl Team {
    /// A fresh team whose balance starts at `initial_balance`.
    pub fn new(
        name: impl Into<String>,
        token: impl Into<String>,
        species: impl Into<String>,
        initial_balance: Decimal,
    ) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
            species: species.into(),
            initial_balance,
            balance: initial_balance,
            inventory: BTreeMap::new(),
            authorized_products: Vec::new(),
            recipes: BTreeMap::new(),
            role: Role::default(),
        }
    }
}

/// Shape of the file read by `exchange_engine seed`.
#[derive(Debug, Clone, Deserialize)]
pub struct TeamsFile {
    pub teams: Vec<Team>,
}
