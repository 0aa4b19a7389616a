use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{EngineError, EngineResult};

const DEFAULT_BASE_ENERGY: f64 = 3.0;
const DEFAULT_LEVEL_ENERGY: f64 = 2.0;

/// Static production parameters of a team's species.
///
/// Yield is computed over a tree of `branches` children per node, `max_depth` levels deep,
/// where each level's energy decays by `decay`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub branches: u32,
    pub max_depth: u32,
    pub decay: f64,
    #[serde(default)]
    pub budget: f64,
    #[serde(default)]
    pub base_energy: f64,
    #[serde(default)]
    pub level_energy: f64,
}

impl Role {
    /// Teams seeded before energy was configurable carry zeros; they get the stock values.
    pub fn with_energy_defaults(mut self) -> Self {
        if self.base_energy == 0.0 {
            self.base_energy = DEFAULT_BASE_ENERGY;
        }
        if self.level_energy == 0.0 {
            self.level_energy = DEFAULT_LEVEL_ENERGY;
        }
        self
    }
}

impl Default for Role {
    fn default() -> Self {
        Self {
            branches: 2,
            max_depth: 4,
            decay: 0.75,
            budget: 25.0,
            base_energy: DEFAULT_BASE_ENERGY,
            level_energy: DEFAULT_LEVEL_ENERGY,
        }
    }
}

/// Units produced by a role across all levels.
///
/// ```text
/// energy(l) = base_energy + level_energy * l
/// factor(l) = decay^l * branches^l
/// units(l)  = round(energy(l) * factor(l))
/// total     = sum of units(l) for l in 0..=max_depth
/// ```
///
/// Rounding is half away from zero.
pub fn calculate_units(role: &Role) -> u64 {
    (0..=role.max_depth)
        .map(|level| {
            let l = f64::from(level);
            let energy = role.base_energy + role.level_energy * l;
            let factor = role.decay.powi(level as i32) * f64::from(role.branches).powi(level as i32);
            (energy * factor).round().max(0.0) as u64
        })
        .sum()
}

/// `round(units * bonus)`, half away from zero.
pub fn apply_premium_bonus(units: u64, bonus: f64) -> u64 {
    (units as f64 * bonus).round().max(0.0) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecipeKind {
    Basic,
    Premium,
}

/// How a team makes one product.
///
/// BASIC recipes consume nothing and have a bonus of 1.0. PREMIUM recipes consume
/// `ingredients` per unit produced and multiply the output by `premium_bonus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    #[serde(rename = "type")]
    pub kind: RecipeKind,
    #[serde(default)]
    pub ingredients: BTreeMap<String, u64>,
    pub premium_bonus: f64,
}

impl Recipe {
    pub fn basic() -> Self {
        Self {
            kind: RecipeKind::Basic,
            ingredients: BTreeMap::new(),
            premium_bonus: 1.0,
        }
    }

    pub fn premium(ingredients: BTreeMap<String, u64>, premium_bonus: f64) -> Self {
        Self {
            kind: RecipeKind::Premium,
            ingredients,
            premium_bonus,
        }
    }

    /// What producing `quantity` units with this recipe costs and yields.
    pub fn plan(&self, quantity: u64) -> EngineResult<ProductionPlan> {
        if quantity == 0 {
            return Err(EngineError::InvalidQuantity(
                "quantity must be positive".into(),
            ));
        }
        match self.kind {
            RecipeKind::Basic => Ok(ProductionPlan {
                consumed: BTreeMap::new(),
                produced: quantity,
            }),
            RecipeKind::Premium => {
                let mut consumed = BTreeMap::new();
                for (ingredient, per_unit) in &self.ingredients {
                    let total = per_unit.checked_mul(quantity).ok_or_else(|| {
                        EngineError::InvalidQuantity("quantity too large".into())
                    })?;
                    consumed.insert(ingredient.clone(), total);
                }
                Ok(ProductionPlan {
                    consumed,
                    produced: apply_premium_bonus(quantity, self.premium_bonus),
                })
            }
        }
    }
}

/// Inventory changes for one production run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductionPlan {
    /// ingredient → units removed
    pub consumed: BTreeMap<String, u64>,
    /// units of the product credited
    pub produced: u64,
}
