// Wish Ledger - Core Library
// Records per-player gacha pull histories against banners, deduplicates
// submissions by content fingerprint, and serves cached per-banner tallies.

pub mod config;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod ledger;
pub mod tally;

// Re-export commonly used types
pub use config::Config;
pub use db::{
    create_banner, find_wish_by_fingerprint, find_wish_by_fingerprint_for_banner, get_banner,
    is_fingerprint_conflict, pulls_for_wish, replace_wish, setup_database, Banner, NewPull,
    NewWish, PullRecord, WishEntry,
};
pub use error::WishError;
pub use fingerprint::FingerprintGenerator;
pub use ledger::{LedgerWriter, SubmitOutcome, WishSubmission};
pub use tally::{
    calculate_wish_tally, ItemStat, SqliteTallySource, TallyCache, TallySource, WishTally,
    TALLY_TTL,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
