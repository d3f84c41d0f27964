use anyhow::{Context, Result};
use std::env;

/// Process configuration, read once at startup.
///
/// The hash seed is the operationally sensitive one: every stored fingerprint
/// was computed under it, so changing it requires a restart and orphans all
/// prior fingerprints (a migration concern, not a runtime error).
#[derive(Debug, Clone)]
pub struct Config {
    /// Seed for the fingerprint hash. Required, no default.
    pub hash_seed: u64,
    pub db_path: String,
    pub bind_addr: String,
    pub tally_ttl_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let hash_seed = env::var("WISH_HASH_SEED")
            .context("WISH_HASH_SEED is not set")?
            .parse::<u64>()
            .context("WISH_HASH_SEED is not a valid u64")?;

        let db_path = env::var("WISH_DB_PATH").unwrap_or_else(|_| "wishes.db".to_string());
        let bind_addr = env::var("WISH_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        let tally_ttl_secs = match env::var("WISH_TALLY_TTL_SECS") {
            Ok(raw) => raw
                .parse::<u64>()
                .context("WISH_TALLY_TTL_SECS is not a valid u64")?,
            Err(_) => 3600,
        };

        Ok(Config {
            hash_seed,
            db_path,
            bind_addr,
            tally_ttl_secs,
        })
    }
}
