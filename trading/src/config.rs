//! Trading service configuration.

use std::str::FromStr;

use rust_decimal::Decimal;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL URL. `None` selects the in-memory store.
    pub url: Option<String>,
    /// Maximum pooled connections.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// Ledger defaults applied when accounts and instruments are created.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Balance granted to every new account.
    pub starting_balance: Decimal,
    /// Posted price for instruments issued without one.
    pub default_price: Decimal,
    /// Supply for instruments issued without one.
    pub default_supply: Decimal,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            starting_balance: Decimal::new(800000, 2),
            default_price: Decimal::ONE,
            default_supply: Decimal::from(1_000_000u32),
        }
    }
}

/// Main trading configuration.
#[derive(Debug, Clone)]
pub struct TradingConfig {
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Ledger defaults.
    pub ledger: LedgerConfig,
    /// Log level.
    pub log_level: String,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            ledger: LedgerConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl TradingConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                config.database.url = Some(url);
            }
        }

        if let Ok(max) = std::env::var("DB_MAX_CONNECTIONS") {
            if let Ok(max) = max.parse() {
                config.database.max_connections = max;
            }
        }

        if let Some(balance) = env_decimal("YOLO_STARTING_BALANCE") {
            config.ledger.starting_balance = balance;
        }

        if let Some(price) = env_decimal("YOLO_DEFAULT_PRICE") {
            config.ledger.default_price = price;
        }

        if let Some(supply) = env_decimal("YOLO_DEFAULT_SUPPLY") {
            config.ledger.default_supply = supply;
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.database.max_connections == 0 {
            return Err("Max connections cannot be 0".to_string());
        }

        if matches!(&self.database.url, Some(url) if url.trim().is_empty()) {
            return Err("Database URL cannot be empty".to_string());
        }

        if self.ledger.starting_balance < Decimal::ZERO {
            return Err("Starting balance cannot be negative".to_string());
        }

        if self.ledger.default_price <= Decimal::ZERO {
            return Err("Default price must be positive".to_string());
        }

        if self.ledger.default_supply <= Decimal::ZERO {
            return Err("Default supply must be positive".to_string());
        }

        Ok(())
    }
}

fn env_decimal(key: &str) -> Option<Decimal> {
    std::env::var(key)
        .ok()
        .and_then(|raw| Decimal::from_str(raw.trim()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config() {
        let config = TradingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ledger.starting_balance, dec!(8000.00));
        assert_eq!(config.ledger.default_price, dec!(1));
        assert_eq!(config.ledger.default_supply, dec!(1000000));
        assert!(config.database.url.is_none());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = TradingConfig::default();
        config.ledger.default_price = Decimal::ZERO;
        assert!(config.validate().is_err());

        let mut config = TradingConfig::default();
        config.database.max_connections = 0;
        assert!(config.validate().is_err());

        let mut config = TradingConfig::default();
        config.database.url = Some("  ".to_string());
        assert!(config.validate().is_err());
    }
}
