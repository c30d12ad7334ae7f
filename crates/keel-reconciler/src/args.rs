use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    Memory,
    Etcd,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    #[arg(long, env = "KEEL_RECONCILER_ADDR", default_value = "0.0.0.0:18100")]
    pub listen_addr: String,

    #[arg(long, env = "KEEL_STORE", value_enum, default_value = "etcd")]
    pub store: StoreBackend,

    #[arg(long, env = "ETCD_ENDPOINT", default_value = "http://127.0.0.1:2379")]
    pub etcd_endpoint: String,

    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "KEEL_DB_MAX_CONNECTIONS", default_value_t = 10)]
    pub db_max_connections: u32,

    /// JSON policy file: image table, profiles, whitelist, framework defaults.
    #[arg(long, env = "KEEL_POLICY_CONFIG")]
    pub policy_config: Option<PathBuf>,

    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "OTEL_EXPORTER_OTLP_TOKEN")]
    pub otlp_token: Option<String>,

    /// Disable the background health prober.
    #[arg(long, env = "KEEL_DISABLE_PROBER", default_value_t = false)]
    pub disable_prober: bool,
}
