//! `coffer`: command-line front end for a local Coffer vault.
//!
//! Every invocation opens the vault in-process at `--root`, performs one
//! operation and closes it again. Values (secrets, tokens, hashes, names)
//! are printed bare on stdout so they can be piped; diagnostics go to
//! stderr.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod config;

use std::io::{IsTerminal as _, Read as _};
use std::path::{Component, Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use coffer_core::crypto;
use coffer_core::{FileAuditBackend, TokenRequest, VaultService};
use tracing_subscriber::EnvFilter;

use crate::config::{CliConfig, LogFormat};

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";

/// Coffer: a local, encrypted, policy-guarded secrets vault.
#[derive(Parser)]
#[command(
    name = "coffer",
    version,
    about = "Coffer CLI: manage a local vault, its secrets and its tokens",
    long_about = None,
    after_help = "Environment variables:\n  \
         COFFER_ROOT        Vault root directory (default: ./vault)\n  \
         COFFER_TOKEN       Caller token\n  \
         COFFER_PASSWORD    Password for `login` and `hash-password`\n  \
         COFFER_ROOT_PASSWORD  Initial root password for `init`\n  \
         COFFER_LOG_LEVEL   Log filter when RUST_LOG is unset (default: info)\n  \
         COFFER_LOG_FORMAT  text or json\n  \
         COFFER_AUDIT_FILE  Append an audit trail to this file\n\n\
         Examples:\n  \
         coffer init --root ./vault --root-password 'change-me'\n  \
         export COFFER_TOKEN=$(coffer login root)\n  \
         echo -n s3cret | coffer write secret/app1/db\n  \
         coffer token create --scope secret/app1 --uses 2 --opaque"
)]
struct Cli {
    /// Vault root directory.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Caller token.
    #[arg(long, global = true)]
    token: Option<String>,

    /// Log filter when `RUST_LOG` is unset.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format.
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    /// Append an audit trail to this file.
    #[arg(long, global = true)]
    audit_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the vault skeleton and keys if missing, then encrypt plaintext files.
    Init {
        /// Set the root principal's password. Only accepted while it has none.
        #[arg(long, env = "COFFER_ROOT_PASSWORD", hide_env_values = true)]
        root_password: Option<String>,
    },
    /// Print an Argon2id hash for the `pass` claim of a principal record.
    HashPassword {
        /// Password to hash; read from stdin when omitted.
        #[arg(long, env = "COFFER_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Authenticate a principal and print a renewable token.
    Login {
        /// Principal id, e.g. `root`.
        principal: String,
        /// Password; read from stdin when omitted.
        #[arg(long, env = "COFFER_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Print a secret.
    Read {
        /// Secret path, e.g. `secret/app1/db`.
        path: String,
    },
    /// Store a secret.
    Write {
        /// Secret path.
        path: String,
        /// Secret value; read from stdin when omitted.
        value: Option<String>,
    },
    /// Delete a secret.
    Rm {
        /// Secret path.
        path: String,
    },
    /// List the names directly under a path.
    Ls {
        /// Directory path; the vault root when omitted.
        #[arg(default_value = "")]
        path: String,
    },
    /// Token operations.
    Token {
        #[command(subcommand)]
        action: TokenCommands,
    },
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Issue a token acting as the caller's principal.
    Create {
        /// Restrict the token to a path prefix. Repeatable.
        #[arg(long = "scope")]
        scope: Vec<String>,
        /// Number of times the token may be used.
        #[arg(long)]
        uses: Option<i64>,
        /// Lifetime in minutes.
        #[arg(long, default_value = "60", allow_negative_numbers = true)]
        ttl: i64,
        /// Issue an opaque token instead of a signed one.
        #[arg(long)]
        opaque: bool,
        /// Allow the token to be renewed.
        #[arg(long)]
        renewable: bool,
    },
    /// Revoke a token; the caller's own token when omitted.
    Revoke {
        /// Token to revoke.
        target: Option<String>,
    },
    /// Renew a token; the caller's own token when omitted.
    Renew {
        /// Token to renew.
        target: Option<String>,
    },
}

impl CliConfig {
    fn with_overrides(mut self, cli: &Cli) -> Self {
        if let Some(root) = &cli.root {
            self.root.clone_from(root);
        }
        if cli.token.is_some() {
            self.token.clone_from(&cli.token);
        }
        if let Some(level) = &cli.log_level {
            self.log_level.clone_from(level);
        }
        if let Some(format) = cli.log_format {
            self.log_format = format;
        }
        if cli.audit_file.is_some() {
            self.audit_file.clone_from(&cli.audit_file);
        }
        self
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = CliConfig::from_env().with_overrides(&cli);
    init_tracing(&config);

    match run(&config, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let color = std::io::stderr().is_terminal();
            eprintln!("{} {e:#}", paint(color, &format!("{RED}{BOLD}"), "error:"));
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(config: &CliConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn run(config: &CliConfig, command: Commands) -> Result<()> {
    if let Commands::HashPassword { password } = command {
        return cmd_hash_password(password);
    }

    let vault = open_vault(config).await?;
    let result = execute(&vault, config, command).await;
    vault.close();
    result
}

async fn execute(vault: &VaultService, config: &CliConfig, command: Commands) -> Result<()> {
    match command {
        Commands::Init { root_password } => {
            if let Some(password) = root_password {
                vault
                    .provision_root_password(&password)
                    .await
                    .context("failed to set the root password")?;
                success("Root password set");
            }
            success(&format!("Vault ready at {}", config.root.display()));
        }
        Commands::HashPassword { password } => cmd_hash_password(password)?,
        Commands::Login {
            principal,
            password,
        } => cmd_login(vault, &principal, password).await?,
        Commands::Read { path } => {
            let secret = vault.read_from_vault(token(config)?, &path).await?;
            println!("{secret}");
        }
        Commands::Write { path, value } => {
            let value = match value {
                Some(value) => value,
                None => read_stdin("secret value")?,
            };
            vault.write_to_vault(token(config)?, &path, &value).await?;
            success(&format!("Secret written to {path}"));
        }
        Commands::Rm { path } => {
            vault.remove_from_vault(token(config)?, &path).await?;
            success(&format!("Secret {path} deleted"));
        }
        Commands::Ls { path } => {
            for name in vault.list_from_vault(token(config)?, &path).await? {
                println!("{name}");
            }
        }
        Commands::Token { action } => cmd_token(vault, config, action).await?,
    }
    Ok(())
}

async fn open_vault(config: &CliConfig) -> Result<VaultService> {
    if let Some(path) = &config.audit_file {
        ensure_outside_root(&config.root, path)?;
    }

    let vault = VaultService::new().context("failed to create the vault service")?;
    let guard = vault.begin_initialize()?;
    vault
        .configure(&config.root)
        .await
        .with_context(|| format!("failed to open vault at {}", config.root.display()))?;
    guard.finish();

    if let Some(path) = &config.audit_file {
        let backend = FileAuditBackend::open(path)
            .await
            .with_context(|| format!("failed to open audit log {}", path.display()))?;
        vault.audit().add_backend(Arc::new(backend)).await;
    }
    Ok(vault)
}

/// Every plaintext file under the vault root is encrypted in place at
/// startup, so an audit log there would be swallowed.
fn ensure_outside_root(root: &Path, audit: &Path) -> Result<()> {
    let root = lexical_absolute(root)?;
    let audit = lexical_absolute(audit)?;
    if audit.starts_with(&root) {
        bail!(
            "audit log {} must not be inside the vault root {}",
            audit.display(),
            root.display()
        );
    }
    Ok(())
}

fn lexical_absolute(path: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(path)
        .with_context(|| format!("failed to resolve {}", path.display()))?;
    let mut resolved = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            other => resolved.push(other),
        }
    }
    Ok(resolved)
}

fn cmd_hash_password(password: Option<String>) -> Result<()> {
    let password = match password {
        Some(password) => password,
        None => read_stdin("password")?,
    };
    let hash = crypto::hash_password(&password).context("failed to hash password")?;
    println!("{hash}");
    Ok(())
}

async fn cmd_login(vault: &VaultService, principal: &str, password: Option<String>) -> Result<()> {
    let password = match password {
        Some(password) => password,
        None => read_stdin("password")?,
    };
    let token = vault.authenticate(principal, &password).await?;
    println!("{token}");
    Ok(())
}

async fn cmd_token(vault: &VaultService, config: &CliConfig, action: TokenCommands) -> Result<()> {
    let caller = token(config)?;
    match action {
        TokenCommands::Create {
            scope,
            uses,
            ttl,
            opaque,
            renewable,
        } => {
            let request = TokenRequest {
                scope: (!scope.is_empty()).then_some(scope),
                uses,
                ttl_minutes: ttl,
                opaque,
                renewable,
            };
            let token = vault.create_vault_token(caller, request).await?;
            println!("{token}");
        }
        TokenCommands::Revoke { target } => {
            match target.as_deref() {
                Some(target) => vault.revoke_vault_token(caller, target).await?,
                None => vault.revoke_self(caller).await?,
            }
            success("Token revoked");
        }
        TokenCommands::Renew { target } => {
            let renewed = match target.as_deref() {
                Some(target) => vault.renew_vault_token(caller, target).await?,
                None => vault.renew_self(caller).await?,
            };
            println!("{renewed}");
        }
    }
    Ok(())
}

fn token(config: &CliConfig) -> Result<&str> {
    config
        .token
        .as_deref()
        .context("no token given: pass --token or set COFFER_TOKEN")
}

fn read_stdin(what: &str) -> Result<String> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .with_context(|| format!("failed to read {what} from stdin"))?;
    Ok(buf.trim_end_matches(['\r', '\n']).to_owned())
}

fn success(msg: &str) {
    let color = std::io::stdout().is_terminal();
    println!("{} {msg}", paint(color, &format!("{GREEN}{BOLD}"), "✓"));
}

fn paint(color: bool, style: &str, text: &str) -> String {
    if color {
        format!("{style}{text}{RESET}")
    } else {
        text.to_owned()
    }
}
