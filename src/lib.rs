// Error taxonomy
pub mod error;

// Environment-driven configuration
pub mod config;

// Sync cursors and entity types
pub mod cursor;

// Encrypted credential store
pub mod credentials;

// Cron window registry
pub mod cron;

// Resource claim ledger
pub mod claims;

// Crawl job store and state machine
pub mod jobs;

// Entity sink (upsert target)
pub mod sink;

// Rate-limited remote API client
pub mod remote;

// Crawl dispatcher
pub mod dispatch;

// Job execution and workers
pub mod executor;

// Background cleanup
pub mod janitor;

// HTTP API
pub mod api;
