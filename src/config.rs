use crate::services::{
    backup_service::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_TRANSFERS, EngineSettings},
    catalog::{MAX_CHUNK_SIZE, WriteMode},
    retry::RetryPolicy,
};
use anyhow::{Context, Result, bail, ensure};
use clap::{Parser, Subcommand};
use std::{env, fmt, path::PathBuf, str::FromStr};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub mirror_root: PathBuf,
    pub regions_file: PathBuf,
    pub anchor_region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub chunk_size: usize,
    pub max_transfers: usize,
    pub transfer_attempts: u32,
    pub upsert: bool,
}

/// What the binary should do.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Apply the database schema and exit
    Migrate,
    /// Back up one registered bucket in the foreground
    Backup { bucket_id: i64 },
    /// Discover every remote bucket and back each one up
    BackupAll,
    /// Serve the HTTP control surface (default)
    Serve,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Incremental mirror of S3-compatible buckets")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Host to bind to (overrides BUCKET_MIRROR_HOST)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to bind to (overrides BUCKET_MIRROR_PORT)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Database URL (overrides BUCKET_MIRROR_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Directory mirrored objects are written under (overrides BUCKET_MIRROR_ROOT)
    #[arg(long, global = true)]
    pub mirror_root: Option<PathBuf>,

    /// Region -> endpoint table (overrides BUCKET_MIRROR_REGIONS_FILE)
    #[arg(long, global = true)]
    pub regions_file: Option<PathBuf>,

    /// Region used for location lookups and empty location constraints
    #[arg(long, global = true)]
    pub anchor_region: Option<String>,

    #[arg(long, global = true)]
    pub access_key: Option<String>,

    #[arg(long, global = true)]
    pub secret_key: Option<String>,

    /// Records per bulk database write
    #[arg(long, global = true)]
    pub chunk_size: Option<usize>,

    /// Downloads in flight per bucket run
    #[arg(long, global = true)]
    pub max_transfers: Option<usize>,

    /// Attempts per object before it is counted as failed
    #[arg(long, global = true)]
    pub transfer_attempts: Option<u32>,

    /// Overwrite existing file records instead of keeping the first one
    #[arg(long, global = true)]
    pub upsert: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        let args = Args::parse();
        let command = args.command.clone().unwrap_or(Command::Serve);
        let cfg = Self::merge(args, |name| env::var(name).ok())?;
        Ok((cfg, command))
    }

    /// Merge CLI values over environment values (read through `lookup`)
    /// over defaults, then validate.
    pub fn merge(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_or = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.into());

        let port = match args.port {
            Some(port) => port,
            None => parse_env(&lookup, "BUCKET_MIRROR_PORT", 3000)?,
        };
        let chunk_size = match args.chunk_size {
            Some(v) => v,
            None => parse_env(&lookup, "BUCKET_MIRROR_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
        };
        let max_transfers = match args.max_transfers {
            Some(v) => v,
            None => parse_env(&lookup, "BUCKET_MIRROR_MAX_TRANSFERS", DEFAULT_MAX_TRANSFERS)?,
        };
        let transfer_attempts = match args.transfer_attempts {
            Some(v) => v,
            None => parse_env(
                &lookup,
                "BUCKET_MIRROR_TRANSFER_ATTEMPTS",
                RetryPolicy::default().attempts,
            )?,
        };
        let upsert = args.upsert || parse_flag(&lookup, "BUCKET_MIRROR_UPSERT")?;

        let cfg = Self {
            host: args
                .host
                .unwrap_or_else(|| env_or("BUCKET_MIRROR_HOST", "0.0.0.0")),
            port,
            database_url: args.database_url.unwrap_or_else(|| {
                env_or(
                    "BUCKET_MIRROR_DATABASE_URL",
                    "sqlite://./data/meta/bucket_mirror.db",
                )
            }),
            mirror_root: args
                .mirror_root
                .unwrap_or_else(|| env_or("BUCKET_MIRROR_ROOT", "./data/mirror").into()),
            regions_file: args.regions_file.unwrap_or_else(|| {
                env_or("BUCKET_MIRROR_REGIONS_FILE", "./config/regions.toml").into()
            }),
            anchor_region: args
                .anchor_region
                .unwrap_or_else(|| env_or("BUCKET_MIRROR_ANCHOR_REGION", "us-east-1")),
            access_key: args.access_key.or_else(|| lookup("BUCKET_MIRROR_ACCESS_KEY")),
            secret_key: args.secret_key.or_else(|| lookup("BUCKET_MIRROR_SECRET_KEY")),
            chunk_size,
            max_transfers,
            transfer_attempts,
            upsert,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.chunk_size > 0, "chunk size must be at least 1");
        ensure!(
            self.chunk_size <= MAX_CHUNK_SIZE,
            "chunk size {} exceeds the bulk-write limit of {}",
            self.chunk_size,
            MAX_CHUNK_SIZE
        );
        ensure!(self.max_transfers > 0, "max transfers must be at least 1");
        ensure!(self.transfer_attempts > 0, "transfer attempts must be at least 1");
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Access and secret key, required for anything that talks to the provider.
    pub fn credentials(&self) -> Result<(&str, &str)> {
        match (self.access_key.as_deref(), self.secret_key.as_deref()) {
            (Some(access), Some(secret)) if !access.is_empty() && !secret.is_empty() => {
                Ok((access, secret))
            }
            _ => bail!(
                "provider credentials missing: set BUCKET_MIRROR_ACCESS_KEY and BUCKET_MIRROR_SECRET_KEY"
            ),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let mut settings = EngineSettings::new(self.mirror_root.clone());
        settings.chunk_size = self.chunk_size;
        settings.max_transfers = self.max_transfers;
        settings.write_mode = if self.upsert {
            WriteMode::Upsert
        } else {
            WriteMode::InsertOrIgnore
        };
        settings.retry = RetryPolicy {
            attempts: self.transfer_attempts,
            ..RetryPolicy::default()
        };
        settings
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("mirror_root", &self.mirror_root)
            .field("regions_file", &self.regions_file)
            .field("anchor_region", &self.anchor_region)
            .field("access_key", &self.access_key.as_ref().map(|_| "<set>"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("chunk_size", &self.chunk_size)
            .field("max_transfers", &self.max_transfers)
            .field("transfer_attempts", &self.transfer_attempts)
            .field("upsert", &self.upsert)
            .finish()
    }
}

fn parse_env<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(default),
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<bool> {
    match lookup(name).as_deref().map(str::trim) {
        None | Some("") => Ok(false),
        Some(v) if matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => bail!("parsing {} value `{}`: expected a boolean", name, v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn merge(argv: &[&str], env: &[(&str, &str)]) -> Result<(AppConfig, Command)> {
        let args = Args::try_parse_from(std::iter::once("bucket-mirror").chain(argv.iter().copied()))?;
        let command = args.command.clone().unwrap_or(Command::Serve);
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let cfg = AppConfig::merge(args, |name| env.get(name).cloned())?;
        Ok((cfg, command))
    }

    #[test]
    fn defaults_apply_without_flags_or_env() {
        let (cfg, command) = merge(&[], &[]).unwrap();
        assert_eq!(command, Command::Serve);
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
        assert_eq!(cfg.anchor_region, "us-east-1");
        assert_eq!(cfg.chunk_size, 500);
        assert_eq!(cfg.max_transfers, 10);
        assert_eq!(cfg.transfer_attempts, 3);
        assert!(!cfg.upsert);
        assert_eq!(cfg.engine_settings().write_mode, WriteMode::InsertOrIgnore);
        assert!(cfg.credentials().is_err());
    }

    #[test]
    fn flags_override_environment() {
        let (cfg, command) = merge(
            &["backup", "7", "--chunk-size", "50", "--upsert"],
            &[
                ("BUCKET_MIRROR_CHUNK_SIZE", "200"),
                ("BUCKET_MIRROR_MAX_TRANSFERS", "4"),
                ("BUCKET_MIRROR_ACCESS_KEY", "AK"),
                ("BUCKET_MIRROR_SECRET_KEY", "SK"),
            ],
        )
        .unwrap();

        assert_eq!(command, Command::Backup { bucket_id: 7 });
        assert_eq!(cfg.chunk_size, 50);
        assert_eq!(cfg.max_transfers, 4);
        assert_eq!(cfg.credentials().unwrap(), ("AK", "SK"));
        assert_eq!(cfg.engine_settings().write_mode, WriteMode::Upsert);
        assert!(!format!("{cfg:?}").contains("SK"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(merge(&[], &[("BUCKET_MIRROR_PORT", "eighty")]).is_err());
        assert!(merge(&["--max-transfers", "0"], &[]).is_err());
        assert!(merge(&[], &[("BUCKET_MIRROR_CHUNK_SIZE", "0")]).is_err());
        assert!(merge(&[], &[("BUCKET_MIRROR_CHUNK_SIZE", "100000")]).is_err());
        assert!(merge(&[], &[("BUCKET_MIRROR_UPSERT", "maybe")]).is_err());
        assert!(merge(&[], &[("BUCKET_MIRROR_UPSERT", "true")]).unwrap().0.upsert);
    }
}
