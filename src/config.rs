use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr, time::Duration};

use crate::services::chunker::MAX_PART_SIZE;

/// Where objects are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Threads of a Discord guild.
    Discord,
    /// A local SQLite database with the same layout.
    Sqlite,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub backend: Backend,
    pub discord_token: Option<String>,
    pub guild_id: Option<String>,
    pub database_url: String,
    pub part_size: usize,
    pub max_upload_bytes: usize,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("backend", &self.backend)
            .field("discord_token", &self.discord_token.as_ref().map(|_| "<redacted>"))
            .field("guild_id", &self.guild_id)
            .field("database_url", &self.database_url)
            .field("part_size", &self.part_size)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Object store on top of chat threads")]
pub struct Args {
    /// Host to bind to (overrides THREAD_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Storage backend (overrides THREAD_STORE_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Database URL for the sqlite backend (overrides THREAD_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Largest part written, in bytes (overrides THREAD_STORE_PART_SIZE)
    #[arg(long)]
    pub part_size: Option<usize>,

    /// Largest accepted upload, in MiB (overrides THREAD_STORE_MAX_UPLOAD_MB)
    #[arg(long)]
    pub max_upload_mb: Option<usize>,

    /// Timeout of one platform API call (overrides THREAD_STORE_REQUEST_TIMEOUT_SECS)
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {name} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {name}")),
    }
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<(Self, bool)> {
        // --- Environment fallback ---
        let env_host = env::var("THREAD_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("PORT", 3000u16)?;
        let env_backend = match env_opt("THREAD_STORE_BACKEND") {
            Some(value) => Backend::from_str(&value, true)
                .map_err(|err| anyhow::anyhow!("parsing THREAD_STORE_BACKEND: {err}"))?,
            None => Backend::Discord,
        };
        let env_db = env::var("THREAD_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/thread_store.db".into());
        let env_part_size = env_parse("THREAD_STORE_PART_SIZE", MAX_PART_SIZE)?;
        let env_max_upload_mb = env_parse("THREAD_STORE_MAX_UPLOAD_MB", 500usize)?;
        let env_timeout = env_parse("THREAD_STORE_REQUEST_TIMEOUT_SECS", 30u64)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            backend: args.backend.unwrap_or(env_backend),
            discord_token: env_opt("DISCORD_TOKEN"),
            guild_id: env_opt("GUILD_ID"),
            database_url: args.database_url.unwrap_or(env_db),
            part_size: args.part_size.unwrap_or(env_part_size),
            max_upload_bytes: args.max_upload_mb.unwrap_or(env_max_upload_mb) * 1024 * 1024,
            request_timeout: Duration::from_secs(
                args.request_timeout_secs.unwrap_or(env_timeout),
            ),
        };
        cfg.validate()?;

        Ok((cfg, args.migrate))
    }

    /// Reject configurations the server could only discover to be broken on
    /// the first request.
    pub fn validate(&self) -> Result<()> {
        if self.part_size == 0 || self.part_size > MAX_PART_SIZE {
            bail!(
                "part size must be between 1 and {MAX_PART_SIZE} bytes, got {}",
                self.part_size
            );
        }
        if self.backend == Backend::Discord {
            if self.discord_token.is_none() {
                bail!("DISCORD_TOKEN is required for the discord backend");
            }
            if self.guild_id.is_none() {
                bail!("GUILD_ID is required for the discord backend");
            }
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(backend: Backend) -> AppConfig {
        AppConfig {
            host: "127.0.0.1".into(),
            port: 3000,
            backend,
            discord_token: None,
            guild_id: None,
            database_url: "sqlite::memory:".into(),
            part_size: MAX_PART_SIZE,
            max_upload_bytes: 1024,
            request_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn discord_backend_needs_credentials() {
        let mut cfg = config(Backend::Discord);
        assert!(cfg.validate().is_err());

        cfg.discord_token = Some("token".into());
        assert!(cfg.validate().is_err());

        cfg.guild_id = Some("123".into());
        assert!(cfg.validate().is_ok());
        assert!(format!("{cfg:?}").contains("<redacted>"));
    }

    #[test]
    fn sqlite_backend_needs_no_credentials() {
        assert!(config(Backend::Sqlite).validate().is_ok());
    }

    #[test]
    fn part_size_is_bounded() {
        let mut cfg = config(Backend::Sqlite);
        cfg.part_size = 0;
        assert!(cfg.validate().is_err());
        cfg.part_size = MAX_PART_SIZE + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cli_flags_parse() {
        let args = Args::parse_from([
            "thread-store",
            "--backend",
            "sqlite",
            "--port",
            "8080",
            "--migrate",
        ]);
        assert_eq!(args.backend, Some(Backend::Sqlite));
        assert_eq!(args.port, Some(8080));
        assert!(args.migrate);
    }
}
