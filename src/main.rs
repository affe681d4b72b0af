//! jwt-auth - operator CLI for the authentication backend
//! Mission: Manage principals and inspect tokens against the configured stores
//!
//! Usage:
//!   jwt-auth create-user --username alice --password '...' --role admin
//!   jwt-auth login --username alice --password '...'
//!   jwt-auth verify --token <access token>

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use jwt_auth::auth::{
    models::{NewPrincipal, PrincipalResponse, Role, TokenResponse, TokenVerdict},
    AuthGateway, Clock, CredentialStore, InMemorySessionCache, PasswordHasher, RedisSessionCache,
    SessionCache, SqliteCredentialStore, SqliteSessionCache, SystemClock, TokenService, TokenType,
};
use jwt_auth::config::{AuthConfig, SessionBackend};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "jwt-auth")]
#[command(
    about = "Issue, verify and revoke JWTs backed by the configured credential and session stores"
)]
struct Cli {
    /// Optional TOML config file; environment variables override it
    #[arg(short, long, env = "JWT_AUTH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a principal
    CreateUser {
        #[arg(short, long)]
        username: String,

        #[arg(short, long, env = "JWT_AUTH_PASSWORD")]
        password: String,

        #[arg(short, long)]
        email: Option<String>,

        /// Repeatable; defaults to `user`
        #[arg(short, long = "role", value_parser = parse_role)]
        roles: Vec<Role>,
    },

    /// Password grant; prints the token response as JSON
    Login {
        #[arg(short, long)]
        username: String,

        #[arg(short, long, env = "JWT_AUTH_PASSWORD")]
        password: String,
    },

    /// Exchange a refresh token for a new pair
    Refresh {
        #[arg(short, long)]
        token: String,
    },

    /// Check an access token and print the principal it carries
    Verify {
        #[arg(short, long)]
        token: String,
    },

    /// Revoke an access token and optionally its refresh token
    Logout {
        #[arg(short, long)]
        access_token: String,

        #[arg(short, long)]
        refresh_token: Option<String>,
    },

    /// Drop expired session records
    Purge,

    /// List registered principals
    ListUsers,
}

fn parse_role(s: &str) -> std::result::Result<Role, String> {
    Role::parse(s).ok_or_else(|| format!("unknown role '{s}' (expected user, manager or admin)"))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jwt_auth=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_env() {
    // 1) Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // 2) Crate-root .env when invoked from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}

async fn build_session_cache(
    config: &AuthConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn SessionCache>> {
    let cache: Arc<dyn SessionCache> = match config.storage.session_backend {
        SessionBackend::Memory => {
            warn!("⚠️  In-memory session cache: sessions do not outlive this process");
            Arc::new(InMemorySessionCache::new(clock))
        }
        SessionBackend::Sqlite => Arc::new(
            SqliteSessionCache::new(&config.storage.session_db_path, clock)
                .context("failed to open SQLite session cache")?,
        ),
        SessionBackend::Redis => {
            let url = config
                .storage
                .redis_url
                .as_deref()
                .context("REDIS_URL is required for the redis session backend")?;
            Arc::new(
                RedisSessionCache::connect(url, clock)
                    .await
                    .context("failed to connect to Redis session cache")?,
            )
        }
    };
    Ok(cache)
}

async fn build_gateway(config: &AuthConfig) -> Result<AuthGateway> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let keys = config.signing_keys().context("invalid signing configuration")?;
    let sessions = build_session_cache(config, clock.clone()).await?;
    let credentials: Arc<dyn CredentialStore> = Arc::new(
        SqliteCredentialStore::new(&config.storage.auth_db_path)
            .context("failed to open credential store")?,
    );

    let tokens = Arc::new(TokenService::new(
        keys,
        config.token_settings(),
        sessions,
        clock,
    ));
    let gateway = AuthGateway::new(
        credentials,
        tokens,
        PasswordHasher::new(config.security.bcrypt_cost),
    )
    .await?;

    if let Some((username, password)) = config.bootstrap_admin() {
        gateway
            .ensure_admin(username, password)
            .await
            .context("failed to bootstrap admin")?;
    }

    Ok(gateway)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let config = AuthConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let gateway = build_gateway(&config).await?;

    match cli.command {
        Commands::CreateUser {
            username,
            password,
            email,
            roles,
        } => {
            let principal = gateway
                .register(NewPrincipal {
                    username,
                    password,
                    email,
                    roles: roles.into_iter().collect::<BTreeSet<_>>(),
                })
                .await?;
            print_json(&PrincipalResponse::from_principal(&principal))?;
        }
        Commands::Login { username, password } => {
            let pair = gateway.login(&username, &password).await?;
            print_json(&TokenResponse::from_pair(&pair, gateway.now()))?;
        }
        Commands::Refresh { token } => {
            let pair = gateway.refresh(&token).await?;
            print_json(&TokenResponse::from_pair(&pair, gateway.now()))?;
        }
        Commands::Verify { token } => {
            match gateway.tokens().inspect(&token, TokenType::Access).await? {
                TokenVerdict::Valid(principal) => {
                    print_json(&PrincipalResponse::from_authenticated(&principal))?;
                }
                verdict => bail!("token rejected: {verdict:?}"),
            }
        }
        Commands::Logout {
            access_token,
            refresh_token,
        } => {
            gateway
                .logout(&access_token, refresh_token.as_deref())
                .await?;
            info!("Tokens revoked");
        }
        Commands::Purge => {
            let purged = gateway.tokens().purge_expired().await?;
            info!("🧹 Purged {} expired session records", purged);
        }
        Commands::ListUsers => {
            let principals = gateway.list_principals().await?;
            let response: Vec<PrincipalResponse> =
                principals.iter().map(PrincipalResponse::from_principal).collect();
            print_json(&response)?;
        }
    }

    Ok(())
}
