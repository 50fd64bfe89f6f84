use std::env;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusType {
    Nats,
    InMemory,
}

impl BusType {
    pub fn from_env() -> Self {
        match env::var("BUS_TYPE")
            .unwrap_or_else(|_| "inmemory".to_string())
            .to_lowercase()
            .as_str()
        {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            _ => {
                tracing::warn!("Unknown BUS_TYPE, defaulting to inmemory");
                BusType::InMemory
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreType {
    Postgres,
    Memory,
}

impl StoreType {
    pub fn from_env() -> Self {
        match env::var("STORE_TYPE")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "postgres" => StoreType::Postgres,
            "memory" => StoreType::Memory,
            _ => {
                tracing::warn!("Unknown STORE_TYPE, defaulting to memory");
                StoreType::Memory
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: BusType,
    pub nats_url: Option<String>,
    pub store_type: StoreType,
    pub database_url: Option<String>,
    pub consumer_batch_size: usize,
    pub visibility_timeout: Duration,
    pub max_deliveries: u32,
    pub outbox_sweep_interval: Duration,
    pub outbox_grace_period: Duration,
    /// How long processed-event records are kept for deduplication
    pub processed_retention: Duration,
    pub processed_purge_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let bus_type = BusType::from_env();
        let nats_url = match bus_type {
            BusType::Nats => Some(
                env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            ),
            BusType::InMemory => None,
        };

        let store_type = StoreType::from_env();
        let database_url = match store_type {
            StoreType::Postgres => Some(
                env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?,
            ),
            StoreType::Memory => None,
        };

        Ok(Self {
            bus_type,
            nats_url,
            store_type,
            database_url,
            consumer_batch_size: parse_var("CONSUMER_BATCH_SIZE", 10)?,
            visibility_timeout: Duration::from_secs(parse_var("VISIBILITY_TIMEOUT_SECS", 300)?),
            max_deliveries: parse_var("MAX_DELIVERIES", 5)?,
            outbox_sweep_interval: Duration::from_millis(parse_var("OUTBOX_SWEEP_INTERVAL_MS", 1000)?),
            outbox_grace_period: Duration::from_millis(parse_var("OUTBOX_GRACE_PERIOD_MS", 500)?),
            processed_retention: Duration::from_secs(
                parse_var::<u64>("PROCESSED_RETENTION_HOURS", 24 * 7)? * 60 * 60,
            ),
            processed_purge_interval: Duration::from_secs(parse_var("PROCESSED_PURGE_INTERVAL_SECS", 3600)?),
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| format!("{name} has an invalid value: {raw}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_defaults_and_rejects_garbage() {
        assert_eq!(parse_var::<u32>("ORDER_TEST_UNSET_VARIABLE", 7), Ok(7));

        env::set_var("ORDER_TEST_BAD_NUMBER", "many");
        assert!(parse_var::<u32>("ORDER_TEST_BAD_NUMBER", 7).is_err());
        env::remove_var("ORDER_TEST_BAD_NUMBER");
    }
}
