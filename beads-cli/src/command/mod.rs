use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use log::info;

use beads::config::SyncConfig;
use beads::error::CResult;
use beads::flush::FlushScheduler;
use beads::model::{new_issue_id, Dependency, DependencyType, Issue, IssueType, Priority, Status};
use beads::storage::store::IssueUpdate;
use beads::sync::{SyncAction, SyncContext, SyncOutcome, SyncStatus};
use beads::vcs::git::GitTransport;
use beads::worktree::WorktreeController;

/// The various kinds of commands `beadscli` can execute.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Initialize a beads workspace in the working directory.
    Init {
        /// Prefix for generated issue ids, e.g. 'bd' in bd-1a2b3c.
        #[clap(long, default_value = "bd")]
        prefix: String,
    },

    /// Create a new issue.
    Create {
        title: String,
        #[clap(short, long, help = "Priority P0..P5")]
        priority: Option<String>,
        #[clap(short = 't', long = "type")]
        issue_type: Option<String>,
        #[clap(short, long)]
        description: Option<String>,
        #[clap(long)]
        assignee: Option<String>,
    },

    /// Update fields on an existing issue.
    Update {
        id: String,
        #[clap(long)]
        title: Option<String>,
        #[clap(long)]
        priority: Option<String>,
        #[clap(long)]
        status: Option<String>,
        #[clap(long = "type")]
        issue_type: Option<String>,
        #[clap(long)]
        assignee: Option<String>,
        #[clap(long)]
        notes: Option<String>,
    },

    /// Close an issue.
    Close {
        id: String,
        #[clap(long, default_value = "")]
        reason: String,
    },

    /// Delete an issue (tombstone plus deletion-manifest record).
    Delete {
        id: String,
        #[clap(long)]
        reason: Option<String>,
    },

    /// List issues.
    List {
        /// Include closed issues and tombstones.
        #[clap(long)]
        all: bool,
    },

    /// Show one issue in full.
    Show { id: String },

    /// Add or remove a dependency edge.
    Dep {
        id: String,
        depends_on: String,
        #[clap(long = "type", default_value = "blocks")]
        dep_type: String,
        #[clap(long)]
        remove: bool,
    },

    /// Add or remove a label.
    Label {
        id: String,
        label: String,
        #[clap(long)]
        remove: bool,
    },

    /// Comment on an issue.
    Comment { id: String, text: String },

    /// Synchronize the store with the ledger (and the VCS, by default).
    Sync {
        #[clap(long, conflicts_with_all = ["import_only", "from_main", "status"])]
        export_only: bool,
        #[clap(long, conflicts_with_all = ["from_main", "status"])]
        import_only: bool,
        #[clap(long, conflicts_with = "status")]
        from_main: bool,
        #[clap(long)]
        status: bool,
    },

    /// Report sync status.
    Status,

    /// Get or set a configuration key.
    Config {
        key: Option<String>,
        value: Option<String>,
    },

    /// Configure the dedicated sync branch and its worktree.
    SyncBranch {
        branch: String,
        /// Recreate the branch with no shared history.
        #[clap(long)]
        orphan: bool,
        /// Allow discarding unpushed commits when recreating.
        #[clap(long)]
        force: bool,
    },
}

/// Runs one command against the workspace discovered from `workdir`.
pub fn run_pack(
    command: Command,
    workdir: &Path,
    actor: &str,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    info!("running {:?}", command);

    if let Command::Init { prefix } = &command {
        let ctx = SyncContext::init(workdir, prefix, actor)?;
        println!("initialized beads workspace at {}", ctx.paths.root.display());
        return Ok(());
    }

    let mut ctx = SyncContext::open(workdir, actor)?;
    ctx.cancel = cancel;

    match command {
        Command::Init { .. } => unreachable!("handled above"),

        Command::Create { title, priority, issue_type, description, assignee } => {
            let now = ctx.now();
            let prefix = ctx.issue_prefix()?;
            let mut issue = Issue::new(new_issue_id(&prefix, &title, now), title, now);
            if let Some(p) = priority {
                issue.priority = Priority::from_str(&p)?;
            }
            if let Some(t) = issue_type {
                issue.issue_type = IssueType::from_str(&t)?;
            }
            issue.description = description;
            issue.assignee = assignee;
            let created = ctx.store.create(issue, actor, now)?;
            flush_urgent(&mut ctx);
            println!("{} {}", created.id.green(), created.title);
        }

        Command::Update { id, title, priority, status, issue_type, assignee, notes } => {
            let patch = IssueUpdate {
                title,
                notes,
                assignee,
                priority: priority.as_deref().map(Priority::from_str).transpose()?,
                status: status.as_deref().map(Status::from_str).transpose()?,
                issue_type: issue_type.as_deref().map(IssueType::from_str).transpose()?,
                ..Default::default()
            };
            let now = ctx.now();
            let updated = ctx.store.update(&id, &patch, actor, now)?;
            flush_urgent(&mut ctx);
            println!("{} updated", updated.id.green());
        }

        Command::Close { id, reason } => {
            let now = ctx.now();
            let closed = ctx.store.close(&id, &reason, actor, now)?;
            flush_urgent(&mut ctx);
            println!("{} closed", closed.id.green());
        }

        Command::Delete { id, reason } => {
            let record = ctx.delete_issue(&id, reason.as_deref())?;
            flush_urgent(&mut ctx);
            println!("{} deleted (tombstone retained)", record.id.yellow());
        }

        Command::List { all } => {
            for issue in ctx.store.get_all_issues(all)? {
                if !all && issue.status == Status::Closed {
                    continue;
                }
                println!(
                    "{}  {}  {}  {}",
                    issue.id.green(),
                    format!("{:<11}", issue.status.to_string()).cyan(),
                    issue.priority,
                    issue.title
                );
            }
        }

        Command::Show { id } => {
            let issue = ctx
                .store
                .get_issue(&id)?
                .ok_or_else(|| beads::error::Error::Value(format!("no such issue: {}", id)))?;
            print_issue(&issue);
        }

        Command::Dep { id, depends_on, dep_type, remove } => {
            let now = ctx.now();
            if remove {
                ctx.store.remove_dependency(&id, &depends_on, now)?;
                println!("{} no longer depends on {}", id.green(), depends_on);
            } else {
                let dep = Dependency {
                    depends_on_id: depends_on.clone(),
                    dep_type: DependencyType::from_str(&dep_type)?,
                };
                ctx.store.add_dependency(&id, dep, now)?;
                println!("{} depends on {} ({})", id.green(), depends_on, dep_type);
            }
            flush_urgent(&mut ctx);
        }

        Command::Label { id, label, remove } => {
            let now = ctx.now();
            if remove {
                ctx.store.remove_label(&id, &label, now)?;
            } else {
                ctx.store.add_label(&id, &label, now)?;
            }
            flush_urgent(&mut ctx);
            println!("{} labels: {}", id.green(), ctx.store.get_labels(&id)?.join(", "));
        }

        Command::Comment { id, text } => {
            let now = ctx.now();
            ctx.store.add_comment(&id, actor, &text, now)?;
            flush_urgent(&mut ctx);
            println!("commented on {}", id.green());
        }

        Command::Sync { export_only, import_only, from_main, status } => {
            let action = if status {
                SyncAction::Status
            } else if export_only {
                SyncAction::ExportOnly
            } else if import_only {
                SyncAction::ImportOnly
            } else if from_main {
                SyncAction::FromMain
            } else {
                SyncAction::PullFirst
            };
            let git = GitTransport::new(ctx.paths.root.clone());
            let vcs = match action {
                SyncAction::ExportOnly | SyncAction::ImportOnly | SyncAction::Status => None,
                _ => Some(&git as &dyn beads::vcs::VcsTransport),
            };
            match ctx.sync(action, vcs)? {
                SyncOutcome::Exported(report) => {
                    println!("exported {} issues ({})", report.exported, &report.hash[..12]);
                    for warning in report.orphan_warnings {
                        eprintln!("{}", warning.yellow());
                    }
                }
                SyncOutcome::Imported(report) => {
                    if report.noop {
                        println!("ledger unchanged, nothing to import");
                    } else {
                        println!(
                            "imported: {} created, {} updated, {} removed, {} tombstoned",
                            report.created, report.updated, report.removed, report.tombstoned
                        );
                    }
                }
                SyncOutcome::Pulled { import, export } => {
                    println!(
                        "synced: {} imported ({} sanitized, {} protected), {} exported",
                        import.created + import.updated,
                        import.sanitize_removed.len(),
                        import.sanitize_protected.len(),
                        export.exported
                    );
                }
                SyncOutcome::Status(status) => print_status(&status),
            }
        }

        Command::Status => {
            let status = ctx.status()?;
            print_status(&status);
        }

        Command::Config { key, value } => match (key, value) {
            (Some(key), Some(value)) => {
                SyncConfig::set(&mut ctx.store, &key, &value)?;
                println!("{} = {}", key, value);
            }
            (Some(key), None) => {
                let value = ctx.store.get_metadata(&key)?.unwrap_or_default();
                println!("{} = {}", key, value);
            }
            (None, _) => {
                for key in SyncConfig::known_keys() {
                    let value = ctx.store.get_metadata(key)?.unwrap_or_default();
                    println!("{} = {}", key, value);
                }
            }
        },

        Command::SyncBranch { branch, orphan, force } => {
            let git = GitTransport::new(ctx.paths.root.clone());
            let paths = ctx.paths.clone();
            let controller = WorktreeController::new(&git, &paths);
            let report = controller.configure(&mut ctx.store, &branch, orphan, force)?;
            println!(
                "sync branch {} ready at {}{}",
                report.branch.green(),
                report.worktree.display(),
                if report.local_only { " (local only, no origin remote)" } else { "" }
            );
        }
    }

    Ok(())
}

/// One urgent flush after a mutation, driven through the scheduler state
/// machine. A refused export (e.g. remote changes pending) downgrades to a
/// warning; the dirty bits stay set for the next sync.
fn flush_urgent(ctx: &mut SyncContext) {
    let run = |ctx: &mut SyncContext| -> CResult<bool> {
        let mut scheduler = FlushScheduler::new(ctx.config.flush_debounce);
        let now = Instant::now();
        for id in ctx.store.get_dirty_ids()? {
            scheduler.mark_dirty(&id, true, now);
        }
        ctx.flush_with(&mut scheduler, now)
    };
    if let Err(err) = run(ctx) {
        log::warn!("deferred flush: {} ({})", err, err.kind());
        if let Some(hint) = err.remediation() {
            eprintln!("{}", format!("warning: {}; {}", err, hint).yellow());
        }
    }
}

fn print_issue(issue: &Issue) {
    println!("{}  {}", issue.id.green().bold(), issue.title.bold());
    println!("  status: {}   priority: {}   type: {}", issue.status, issue.priority, issue.issue_type);
    if let Some(assignee) = &issue.assignee {
        println!("  assignee: {}", assignee);
    }
    if let Some(description) = &issue.description {
        println!("  {}", description);
    }
    if let Some(notes) = &issue.notes {
        println!("  notes: {}", notes);
    }
    for dep in &issue.dependencies {
        println!("  depends on {} ({})", dep.depends_on_id, dep.dep_type);
    }
    if !issue.labels.is_empty() {
        println!("  labels: {}", issue.labels.join(", "));
    }
    for comment in &issue.comments {
        println!("  [{}] {}: {}", comment.created_at, comment.author, comment.text);
    }
    if let Some(deleted_at) = &issue.deleted_at {
        println!("  {} at {}", "deleted".red(), deleted_at);
    }
}

fn print_status(status: &SyncStatus) {
    println!("mode:      {}", status.mode);
    println!("strategy:  {}", status.strategy);
    if let Some(branch) = &status.branch {
        println!("branch:    {}", branch);
    }
    if let Some(remote) = &status.remote {
        println!("remote:    {}", remote);
    }
    println!(
        "issues:    {} total ({} open, {} closed, {} tombstone)",
        status.stats.total, status.stats.open, status.stats.closed, status.stats.tombstone
    );
    if status.dirty.is_empty() {
        println!("dirty:     none");
    } else {
        println!("dirty:     {} ({})", status.dirty.len(), status.dirty.join(", "));
    }
    if let Some(last) = &status.last_import_time {
        println!("imported:  {}", last);
    }
    if status.ledger_differs {
        println!("{}", "ledger has changes not yet imported".yellow());
    }
    if !status.pending_conflicts.is_empty() {
        println!(
            "{}",
            format!("unresolved conflicts: {}", status.pending_conflicts.join(", ")).red()
        );
    }
}
