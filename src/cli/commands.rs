//! CLI command definitions

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mercure")]
#[command(about = "Mercure hub: real-time updates over server-sent events", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the hub
    Serve(ServeArgs),

    /// Create a signed token carrying Mercure claims
    ///
    /// Examples:
    ///   mercure token --publish '*' --secret '!ChangeThisMercureHubJWTSecretKey!'
    ///   mercure token --subscribe 'https://example.com/books/{id}' --ttl 3600
    Token(TokenArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Address to bind to
    #[arg(short, long, env = "MERCURE_ADDR", default_value = "0.0.0.0:3000")]
    pub addr: String,

    /// Transport DSN: local://local, bolt://updates.db?size=1000, redis://localhost:6379
    #[arg(long, env = "MERCURE_TRANSPORT_URL", default_value = "local://local")]
    pub transport: String,

    /// Key used for both publisher and subscriber tokens
    #[arg(long, env = "MERCURE_JWT_KEY")]
    pub jwt_key: Option<String>,

    #[arg(long, env = "MERCURE_JWT_ALGORITHM", default_value = "HS256")]
    pub jwt_algorithm: String,

    #[arg(long, env = "MERCURE_PUBLISHER_JWT_KEY")]
    pub publisher_jwt_key: Option<String>,

    #[arg(long, env = "MERCURE_PUBLISHER_JWT_ALGORITHM")]
    pub publisher_jwt_algorithm: Option<String>,

    /// JWKS URL for publisher tokens, instead of a key
    #[arg(long, env = "MERCURE_PUBLISHER_JWKS_URL")]
    pub publisher_jwks_url: Option<String>,

    #[arg(long, env = "MERCURE_SUBSCRIBER_JWT_KEY")]
    pub subscriber_jwt_key: Option<String>,

    #[arg(long, env = "MERCURE_SUBSCRIBER_JWT_ALGORITHM")]
    pub subscriber_jwt_algorithm: Option<String>,

    /// JWKS URL for subscriber tokens, instead of a key
    #[arg(long, env = "MERCURE_SUBSCRIBER_JWKS_URL")]
    pub subscriber_jwks_url: Option<String>,

    /// Allow subscribers without a token
    #[arg(long, env = "MERCURE_ANONYMOUS")]
    pub anonymous: bool,

    /// Expose the subscriptions API and dispatch subscription events
    #[arg(long, env = "MERCURE_SUBSCRIPTIONS")]
    pub subscriptions: bool,

    /// Origins allowed to publish with cookie authorization
    #[arg(long, env = "MERCURE_PUBLISH_ORIGINS", value_delimiter = ' ')]
    pub publish_origins: Vec<String>,

    #[arg(long, env = "MERCURE_CORS_ORIGINS", value_delimiter = ' ')]
    pub cors_origins: Vec<String>,

    #[arg(long, env = "MERCURE_COOKIE_NAME", default_value = mercure::auth::DEFAULT_COOKIE_NAME)]
    pub cookie_name: String,

    /// Maximum connection lifetime in seconds, 0 to disable
    #[arg(long, env = "MERCURE_WRITE_TIMEOUT", default_value_t = 600)]
    pub write_timeout: u64,

    /// Maximum duration of one write in seconds, 0 to disable
    #[arg(long, env = "MERCURE_DISPATCH_TIMEOUT", default_value_t = 5)]
    pub dispatch_timeout: u64,

    /// Heartbeat interval in seconds, 0 to disable
    #[arg(long, env = "MERCURE_HEARTBEAT", default_value_t = 40)]
    pub heartbeat: u64,

    /// Outbound buffer of each subscriber
    #[arg(long, env = "MERCURE_SUBSCRIBER_BUFFER", default_value_t = mercure::subscriber::DEFAULT_OUT_BUFFER)]
    pub subscriber_buffer: usize,

    #[arg(long, env = "MERCURE_CACHE_MAX_ENTRIES_PER_SHARD", default_value_t = mercure::topics::DEFAULT_MAX_ENTRIES_PER_SHARD)]
    pub cache_max_entries_per_shard: usize,

    #[arg(long, env = "MERCURE_CACHE_SHARD_COUNT", default_value_t = mercure::topics::DEFAULT_SHARD_COUNT)]
    pub cache_shard_count: usize,

    /// Accept deprecated behaviors of protocol version 7
    #[arg(long, env = "MERCURE_PROTOCOL_VERSION_COMPATIBILITY")]
    pub protocol_version_compatibility: Option<u8>,
}

#[derive(Args)]
pub struct TokenArgs {
    /// Topic selectors the token may publish to (can be repeated)
    #[arg(long)]
    pub publish: Vec<String>,

    /// Topic selectors the token may receive private updates for (can be repeated)
    #[arg(long)]
    pub subscribe: Vec<String>,

    /// JSON payload exposed in the subscriptions API
    #[arg(long)]
    pub payload: Option<String>,

    /// Lifetime in seconds; the token never expires when omitted
    #[arg(long)]
    pub ttl: Option<u64>,

    /// Shared secret
    #[arg(long, env = "MERCURE_JWT_KEY")]
    pub secret: String,

    #[arg(long, default_value = "HS256")]
    pub algorithm: String,
}
