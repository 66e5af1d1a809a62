use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;

use gridguard::evaluator::DecisionSource;
use gridguard::logging;
use gridguard::rules::{Action, PermissionRule, Resource, Role, Scope};
use gridguard::store::{AuditEvent, FileRuleStore, RuleFilter, RuleStore};
use gridguard::{Coordinate, GuardConfig, Identity, PermissionGuard, StoreConfig};

/// Inspect a gridguard rule store.
#[derive(Parser, Debug)]
#[command(name = "gridguard", about = "gridguard rule store inspector")]
struct Cli {
    /// Path to a JSON config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Rule store directory (overrides config and GRIDGUARD_STORE_DIR).
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List stored rules.
    List {
        base: String,
        /// Only rules at this scope (table, column, row, cell).
        #[arg(long)]
        scope: Option<Scope>,
        /// Only enabled rules.
        #[arg(long)]
        enabled: bool,
    },

    /// Evaluate one access check against the stored rules.
    Check {
        base: String,
        user: String,
        role: Role,
        action: Action,
        table: String,
        #[arg(long)]
        row: Option<String>,
        #[arg(long)]
        column: Option<String>,
        /// Additional role held at site level.
        #[arg(long)]
        site_role: Option<Role>,
    },

    /// Show lock history for a row or cell.
    History {
        base: String,
        table: String,
        row: String,
        #[arg(long)]
        column: Option<String>,
    },

    /// Show the most recent audit log entries.
    Audit {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::List { .. } => "list",
            Commands::Check { .. } => "check",
            Commands::History { .. } => "history",
            Commands::Audit { .. } => "audit",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => GuardConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => GuardConfig::default(),
    };
    let mut config = config.with_env_overrides()?;
    if let Some(dir) = cli.store {
        config = config.with_store(StoreConfig::File { dir });
    }

    let _log_guard = logging::init_logging(&config.logging)?;

    let StoreConfig::File { dir } = &config.store else {
        bail!("no store directory: pass --store DIR or set GRIDGUARD_STORE_DIR");
    };
    let store = Arc::new(FileRuleStore::open(dir.clone())?);
    tracing::info!("=== gridguard {} ===", cli.command.name());

    match cli.command {
        Commands::List {
            base,
            scope,
            enabled,
        } => list(store.as_ref(), &base, scope, enabled).await,
        Commands::Check {
            base,
            user,
            role,
            action,
            table,
            row,
            column,
            site_role,
        } => {
            let mut coordinate = Coordinate::table(table);
            if let Some(row) = row {
                coordinate = coordinate.with_row(row);
            }
            if let Some(column) = column {
                coordinate = coordinate.with_column(column);
            }
            let mut identity = Identity::new(user, role, base.as_str());
            if let Some(site_role) = site_role {
                identity = identity.with_site_role(site_role);
            }
            check(config.clone(), store.clone(), &identity, &coordinate, action).await
        }
        Commands::History {
            base,
            table,
            row,
            column,
        } => {
            let resource = match column {
                Some(column) => Resource::cell(table, row, column),
                None => Resource::row(table, row),
            };
            history(store.as_ref(), &base, resource).await
        }
        Commands::Audit { limit } => audit(store.as_ref(), limit),
    }
}

async fn list(
    store: &FileRuleStore,
    base: &str,
    scope: Option<Scope>,
    enabled: bool,
) -> Result<()> {
    let mut filter = RuleFilter::base(base);
    if let Some(scope) = scope {
        filter = filter.with_scope(scope);
    }
    if enabled {
        filter = filter.enabled_only();
    }

    let rules = store.list(&filter).await?;
    if rules.is_empty() {
        println!("{}", "No rules.".dimmed());
        return Ok(());
    }
    for rule in &rules {
        print_rule(rule);
    }
    println!("{}", format!("{} rule(s)", rules.len()).dimmed());
    Ok(())
}

fn print_rule(rule: &PermissionRule) {
    let state = if rule.enabled {
        "on ".green()
    } else {
        "off".red()
    };
    let actions = rule
        .actions
        .as_ref()
        .map(|a| format!(" [{}]", a))
        .unwrap_or_default();
    println!(
        "{} {} {} {} {}{}",
        state,
        rule.id.dimmed(),
        rule.actor.to_string().cyan(),
        rule.resource,
        rule.access_level.to_string().bold(),
        actions
    );
    if let Some(holder) = &rule.locked_by {
        println!("    {} {}", "locked by".yellow(), holder);
    }
    if let Some(name) = &rule.name {
        println!("    {}", name.dimmed());
    }
}

async fn check(
    config: GuardConfig,
    store: Arc<FileRuleStore>,
    identity: &Identity,
    coordinate: &Coordinate,
    action: Action,
) -> Result<()> {
    let guard = PermissionGuard::with_store(config, store);
    let evaluation = guard
        .evaluate(identity, &identity.base_id, coordinate, action)
        .await;

    let verdict = if evaluation.is_allowed() {
        evaluation.decision.to_string().green().bold()
    } else {
        evaluation.decision.to_string().red().bold()
    };
    println!(
        "{} {} {} on {}",
        verdict, identity.user_id, action, coordinate
    );

    let source = match &evaluation.source {
        DecisionSource::SuperAdmin => "super-admin".to_string(),
        DecisionSource::OwnerBypass => "owner bypass".to_string(),
        DecisionSource::Rule {
            rule_id,
            scope,
            actor,
        } => format!("{} rule {} for {}", scope, rule_id, actor),
        DecisionSource::RoleDefault => format!("role defaults for {}", identity.role),
        DecisionSource::LockVeto { holder } => format!("locked by {}", holder),
        DecisionSource::StoreFailure => "store unavailable".to_string(),
    };
    println!("  {} {}", "decided by".dimmed(), source);
    Ok(())
}

async fn history(store: &FileRuleStore, base: &str, resource: Resource) -> Result<()> {
    let rules = store.rules_for(base, &[resource.clone()]).await?;
    let mut entries: Vec<_> = rules.iter().flat_map(|r| r.history.iter()).collect();
    entries.sort_by_key(|e| e.at);

    if entries.is_empty() {
        println!("{} {}", "No lock history for".dimmed(), resource);
        return Ok(());
    }
    println!("{}", resource.to_string().bold());
    for entry in entries {
        let action = format!("{:?}", entry.action).to_lowercase();
        let action = if action == "lock" {
            action.yellow()
        } else {
            action.green()
        };
        println!(
            "  {} {:<6} {}",
            entry.at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            action,
            entry.by
        );
    }
    if let Some(holder) = rules.iter().find_map(|r| r.locked_by.as_deref()) {
        println!("  {} {}", "currently locked by".yellow().bold(), holder);
    }
    Ok(())
}

fn audit(store: &FileRuleStore, limit: usize) -> Result<()> {
    let events: Vec<AuditEvent> = store.audit_log()?;
    let skip = events.len().saturating_sub(limit);
    for event in events.iter().skip(skip) {
        println!(
            "{} {:<9} {} {} {}{}",
            event.at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            format!("{:?}", event.kind).to_lowercase().cyan(),
            event.rule_id.dimmed(),
            event.base,
            event.resource,
            event
                .by
                .as_deref()
                .map(|by| format!(" by {}", by))
                .unwrap_or_default()
        );
    }
    Ok(())
}
