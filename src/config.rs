use crate::error::{MarketError, Result};
use crate::{
    access::{AccessControl, Role},
    escrow::FeeSchedule,
    model::{Address, Amount, OfferLimits},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Longest accepted validation window: one hundred years.
pub const MAX_VALIDATION_DEADLINE_SECS: u64 = 100 * 365 * 24 * 3600;

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub market: MarketConfig,
    pub fees: FeeConfig,
    pub rewards: RewardConfig,
    pub roles: RolesConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct MarketConfig {
    pub max_quantity: u64,
    /// Smallest-unit price cap; TOML integers are signed 64-bit.
    pub max_price: u64,
    pub max_energy_type_len: usize,
    pub validation_deadline_secs: u64,
    /// Account that holds escrowed payments on the value ledger.
    pub escrow_account: String,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct FeeConfig {
    pub producer_parts: u32,
    pub oracle_parts: u32,
    pub pool_parts: u32,
    pub platform_pool: String,
    /// Receives the unassigned parts and every rounding remainder.
    pub remainder_beneficiary: String,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct RewardConfig {
    pub production_reward_per_unit: u64,
    pub purchase_reward: u64,
    pub sale_reward: u64,
    pub daily_production_cap: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
pub struct RolesConfig {
    #[serde(default)]
    pub admins: Vec<String>,
    #[serde(default)]
    pub pausers: Vec<String>,
    #[serde(default)]
    pub oracles: Vec<String>,
    #[serde(default)]
    pub producers: Vec<String>,
    #[serde(default)]
    pub consumers: Vec<String>,
}

/// Opening balances for the in-memory value ledger, in smallest units.
/// Amounts are decimal strings since they may exceed a TOML integer.
#[derive(Debug, Deserialize, Clone, Serialize, Default)]
pub struct LedgerConfig {
    #[serde(default)]
    pub initial_balances: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        let limits = OfferLimits::default();
        Self {
            max_quantity: limits.max_quantity,
            max_price: limits.max_price as u64,
            max_energy_type_len: limits.max_energy_type_len,
            validation_deadline_secs: 24 * 3600,
            escrow_account: "escrow".to_string(),
        }
    }
}

impl Default for FeeConfig {
    fn default() -> Self {
        let schedule = FeeSchedule::default();
        Self {
            producer_parts: schedule.producer_parts,
            oracle_parts: schedule.oracle_parts,
            pool_parts: schedule.pool_parts,
            platform_pool: "platform-pool".to_string(),
            remainder_beneficiary: "treasury".to_string(),
        }
    }
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            production_reward_per_unit: 1,
            purchase_reward: 10,
            sale_reward: 10,
            daily_production_cap: 10_000_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Some("pretty".to_string()),
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| MarketError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AppConfig = toml::from_str(&config_str)
            .map_err(|e| MarketError::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(deadline) = std::env::var("ESCROW_DEADLINE_SECS") {
            self.market.validation_deadline_secs = deadline
                .parse()
                .map_err(|e| MarketError::Config(format!("Invalid ESCROW_DEADLINE_SECS: {}", e)))?;
        }

        if let Ok(pool) = std::env::var("ESCROW_PLATFORM_POOL") {
            self.fees.platform_pool = pool;
        }

        if let Ok(beneficiary) = std::env::var("ESCROW_REMAINDER_BENEFICIARY") {
            self.fees.remainder_beneficiary = beneficiary;
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.logging.level = log_level;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(MarketError::Config("Server port cannot be 0".to_string()));
        }

        if self.market.max_quantity == 0 || self.market.max_price == 0 || self.market.max_energy_type_len == 0 {
            return Err(MarketError::Config("Offer limits must be greater than 0".to_string()));
        }

        if self.market.validation_deadline_secs == 0 {
            return Err(MarketError::Config("Validation deadline must be greater than 0".to_string()));
        }

        if self.market.validation_deadline_secs > MAX_VALIDATION_DEADLINE_SECS {
            return Err(MarketError::Config(format!(
                "Validation deadline cannot exceed {} seconds",
                MAX_VALIDATION_DEADLINE_SECS
            )));
        }

        self.fee_schedule().validate()?;

        for (name, value) in [
            ("market.escrow_account", &self.market.escrow_account),
            ("fees.platform_pool", &self.fees.platform_pool),
            ("fees.remainder_beneficiary", &self.fees.remainder_beneficiary),
        ] {
            if value.trim().is_empty() {
                return Err(MarketError::Config(format!("{} cannot be empty", name)));
            }
        }

        self.initial_balances()?;

        Ok(())
    }

    pub fn fee_schedule(&self) -> FeeSchedule {
        FeeSchedule {
            producer_parts: self.fees.producer_parts,
            oracle_parts: self.fees.oracle_parts,
            pool_parts: self.fees.pool_parts,
        }
    }

    pub fn offer_limits(&self) -> OfferLimits {
        OfferLimits {
            max_quantity: self.market.max_quantity,
            max_price: Amount::from(self.market.max_price),
            max_energy_type_len: self.market.max_energy_type_len,
        }
    }

    /// Initial role membership from the `[roles]` table.
    pub fn access_control(&self) -> Result<AccessControl> {
        let mut access = AccessControl::new();
        for (role, accounts) in [
            (Role::Admin, &self.roles.admins),
            (Role::Pauser, &self.roles.pausers),
            (Role::Oracle, &self.roles.oracles),
            (Role::Producer, &self.roles.producers),
            (Role::Consumer, &self.roles.consumers),
        ] {
            for account in accounts {
                access.grant(role, Address::parse(account)?);
            }
        }
        Ok(access)
    }

    /// Opening balances from the `[ledger.initial_balances]` table.
    pub fn initial_balances(&self) -> Result<Vec<(Address, Amount)>> {
        self.ledger
            .initial_balances
            .iter()
            .map(|(account, amount)| {
                let amount = amount.trim().parse::<Amount>().map_err(|e| {
                    MarketError::Config(format!("Invalid initial balance for {}: {}", account, e))
                })?;
                Ok((Address::parse(account)?, amount))
            })
            .collect()
    }

    pub fn get_server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| MarketError::Config(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| MarketError::Config(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}
