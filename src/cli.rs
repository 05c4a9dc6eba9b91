//! Command-line surface: the "external collaborator" front-end named
//! by spec.md §6's verb table. Each subcommand is a thin call into
//! [`TransactionManager`]/[`PackageMetadata`]; none of the transaction
//! or rollback logic lives here.
//!
//! `clap`'s derive API wires up the subcommands here, since a real CLI
//! front-end for a tool like this is the idiomatic way to do it; the
//! confirm-prompt and progress-spinner idioms are grounded on
//! `interactive.rs` and `updater.rs`.

use clap::{Parser, Subcommand};
use dialoguer::{theme::ColorfulTheme, Confirm};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;

use crate::config::TxConfig;
use crate::error_handling::TxError;
use crate::manager::TransactionManager;
use crate::manifest::{PackageMetadata, ScriptSpec};
use crate::privilege;
use crate::registry::HandlerRegistry;
use crate::secure_executor::{ExecutionConfig, SecureExecutor};
use crate::types::TransactionStatus;

#[derive(Parser, Debug)]
#[command(name = "debtx", about = "Transactional package installer for Debian-family hosts")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Skip the interactive confirmation prompt before `install` runs.
    #[arg(long, global = true)]
    pub yes: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate, begin, execute and commit (or roll back) a package manifest.
    Install {
        file: PathBuf,
        /// Validate and check requirements, then stop before any step runs.
        #[arg(long)]
        dry_run: bool,
        /// Accept steps whose `rollback` strategy is `none`.
        #[arg(long)]
        allow_irreversible: bool,
    },
    /// Re-attempt rollback of a non-terminal or failed transaction.
    Rollback { id: i64 },
    /// List recorded transactions, most recent first.
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one transaction and its steps.
    Status { id: i64 },
    /// Delete terminal transactions (and their steps/snapshots) older than N days.
    Cleanup {
        #[arg(long = "older-than")]
        older_than: u32,
    },
    /// Parse and shape-validate a manifest without running it.
    Validate { file: PathBuf },
    /// Write a minimal two-step manifest skeleton to `path`.
    CreateTemplate {
        name: String,
        version: String,
        #[arg(default_value = "package.yaml")]
        path: PathBuf,
    },
}

/// Runs the parsed command to completion, returning the process exit
/// code the way spec.md §6's verb table specifies (0 on success, the
/// error's own `exit_code()` otherwise).
pub async fn run(cli: Cli, config: TxConfig) -> i32 {
    match dispatch(cli, config).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {}", e);
            e.exit_code()
        }
    }
}

async fn dispatch(cli: Cli, config: TxConfig) -> Result<(), TxError> {
    match cli.command {
        Command::Install {
            file,
            dry_run,
            allow_irreversible,
        } => install(&file, dry_run, allow_irreversible, cli.yes, config).await,
        Command::Rollback { id } => rollback(id, config).await,
        Command::List { limit, status } => list(limit, status, config).await,
        Command::Status { id } => status(id, config).await,
        Command::Cleanup { older_than } => cleanup(older_than, config).await,
        Command::Validate { file } => validate(&file, &config),
        Command::CreateTemplate { name, version, path } => create_template(&name, &version, &path),
    }
}

async fn install(
    file: &std::path::Path,
    dry_run: bool,
    allow_irreversible: bool,
    skip_confirm: bool,
    config: TxConfig,
) -> Result<(), TxError> {
    privilege::require_root("install")?;

    let metadata = PackageMetadata::from_file(file)?;
    metadata.validate_shape()?;
    TransactionManager::check_requirements(&metadata.requirements)?;

    let registry = HandlerRegistry::with_builtin_handlers(&config);
    TransactionManager::validate_all_steps(&registry, &metadata, allow_irreversible)?;

    if dry_run {
        println!("{}: manifest is valid, requirements met (dry run)", metadata.package.name);
        return Ok(());
    }

    if !skip_confirm && config.general.confirm_installs {
        let proceed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "Install {} v{} ({} steps)?",
                metadata.package.name,
                metadata.package.version,
                metadata.install_steps.len()
            ))
            .default(false)
            .interact()
            .unwrap_or(false);
        if !proceed {
            println!("aborted");
            return Ok(());
        }
    }

    // pre_install runs outside the transactional envelope: a failure
    // here aborts before any transaction row exists, so there is
    // nothing to roll back.
    run_script_specs(&metadata.pre_install, &config).await?;

    let mut manager = TransactionManager::new(config.clone()).await?;
    manager.begin(&metadata.package.name, &metadata).await?;

    let pb = if config.ui.show_progress {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("installing {}...", metadata.package.name));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Some(pb)
    } else {
        None
    };

    let outcome = manager.execute(&metadata, allow_irreversible).await;
    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }
    outcome?;

    manager.commit().await?;
    println!("{} installed", metadata.package.name);

    // post_install is advisory: it runs after the transaction is
    // already committed, so a failure here is logged, not propagated
    // as a command failure or rollback trigger.
    if let Err(e) = run_script_specs(&metadata.post_install, &config).await {
        tracing::error!(error = %e, "post_install script failed; installed package is unaffected");
        eprintln!("warning: post_install failed: {}", e);
    }

    Ok(())
}

/// Runs a list of `pre_install`/`post_install` scripts in order,
/// stopping at the first failure. These execute outside the
/// transactional envelope (design note, open question b) and have no
/// snapshot or compensation of their own.
async fn run_script_specs(scripts: &[ScriptSpec], config: &TxConfig) -> Result<(), TxError> {
    let executor = SecureExecutor::new();
    let exec_config = ExecutionConfig {
        timeout: std::time::Duration::from_secs(config.general.default_timeout_secs),
    };

    for script in scripts {
        let args: Vec<&str> = script.args.iter().map(String::as_str).collect();
        let result = executor.execute(&script.path, &args, exec_config.clone()).await?;
        if !result.success() {
            return Err(TxError::Apply {
                step_index: -1,
                tag: "script".to_string(),
                reason: format!("{} exited with status {}", script.path, result.exit_code),
            });
        }
    }
    Ok(())
}

async fn rollback(id: i64, config: TxConfig) -> Result<(), TxError> {
    privilege::require_root("rollback")?;
    let mut manager = TransactionManager::new(config).await?;
    manager.rollback(id).await?;
    println!("transaction {} rolled back", id);
    Ok(())
}

async fn list(limit: i64, status: Option<String>, config: TxConfig) -> Result<(), TxError> {
    let status = match status {
        Some(s) => Some(TransactionStatus::from_str(&s).ok_or_else(|| TxError::Validation {
            field: "status".to_string(),
            message: format!("unknown status: {}", s),
        })?),
        None => None,
    };

    let manager = TransactionManager::new(config).await?;
    let views = manager.list(limit, status).await?;
    for view in views {
        println!("{:>4}  {:<12}  {}", view.id, view.status, view.package_name);
    }
    Ok(())
}

async fn status(id: i64, config: TxConfig) -> Result<(), TxError> {
    let manager = TransactionManager::new(config).await?;
    let view = manager.status(id).await?;
    println!("transaction {}: {} ({})", view.id, view.package_name, view.status);
    for step in &view.steps {
        println!("  [{}] {:<20} {}", step.order_index, step.step_type, step.status);
    }
    Ok(())
}

async fn cleanup(older_than: u32, config: TxConfig) -> Result<(), TxError> {
    let manager = TransactionManager::new(config).await?;
    let deleted = manager.gc(older_than).await?;
    println!("deleted {} transactions older than {} days", deleted, older_than);
    Ok(())
}

fn validate(file: &std::path::Path, config: &TxConfig) -> Result<(), TxError> {
    let metadata = PackageMetadata::from_file(file)?;
    metadata.validate_shape()?;

    let registry = HandlerRegistry::with_builtin_handlers(config);
    TransactionManager::validate_all_steps(&registry, &metadata, false)?;

    println!("{}: valid", metadata.package.name);
    Ok(())
}

fn create_template(name: &str, version: &str, path: &std::path::Path) -> Result<(), TxError> {
    let template = PackageMetadata::template(name, version);
    let yaml = template.to_yaml()?;
    std::fs::write(path, yaml)?;
    println!("wrote template to {}", path.display());
    Ok(())
}
