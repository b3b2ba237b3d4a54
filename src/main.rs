use clap::Parser;
use log::{error, info};
use std::path::PathBuf;

use migrate_core::orchestrator::stdin_is_interactive;
use migrate_core::{execute, InterruptLatch, Options, Outcome, Settings};

#[derive(Parser, Debug)]
#[command(
    name = "wp-migrate",
    about = "WordPress migration and backup-restore tool with automatic rollback"
)]
struct Args {
    #[arg(long, help = "Push the local site to this ssh host (user@host)")]
    dest: Option<String>,

    #[arg(long, help = "WordPress root on the destination host")]
    dest_path: Option<PathBuf>,

    #[arg(long, help = "Local WordPress root (defaults to the current directory)")]
    source_path: Option<PathBuf>,

    #[arg(long, help = "Backup archive or extracted backup directory to import")]
    archive: Option<PathBuf>,

    #[arg(long, help = "Force an archive format: duplicator, jetpack, solid-backups, backwpup")]
    archive_format: Option<String>,

    #[arg(long, help = "Restore the site from a snapshot taken by an earlier run")]
    rollback: bool,

    #[arg(long, help = "Snapshot stamp or file name to roll back to (default: newest)")]
    rollback_backup: Option<String>,

    #[arg(long, help = "Only snapshot the database and content, change nothing")]
    backup_only: bool,

    #[arg(long, help = "Dry run mode - report what would happen without changing anything")]
    dry_run: bool,

    #[arg(long, help = "Do not ask for confirmation")]
    yes: bool,

    #[arg(long, help = "Site URL to use on the destination")]
    dest_url: Option<String>,

    #[arg(long, help = "Extra search-replace pair as OLD=NEW (repeatable)")]
    search_replace: Vec<String>,

    #[arg(long, help = "Extra rsync options")]
    rsync_opts: Option<String>,

    #[arg(long, help = "Extra ssh options")]
    ssh_opts: Option<String>,

    #[arg(long, help = "Keep database snapshots uncompressed")]
    no_gzip: bool,

    #[arg(long, help = "Copy back destination plugins the import removed")]
    preserve_dest_plugins: bool,

    #[arg(long, help = "JSON profile with default values")]
    config: Option<PathBuf>,

    #[arg(long, short, help = "Verbose logging")]
    verbose: bool,
}

impl Args {
    fn into_options(self) -> Options {
        Options {
            dest: self.dest,
            dest_path: self.dest_path,
            source_path: self.source_path,
            archive: self.archive,
            archive_format: self.archive_format,
            rollback: self.rollback,
            rollback_backup: self.rollback_backup,
            backup_only: self.backup_only,
            dry_run: self.dry_run,
            yes: self.yes,
            dest_url: self.dest_url,
            search_replace: self.search_replace,
            rsync_opts: self.rsync_opts,
            ssh_opts: self.ssh_opts,
            no_gzip: self.no_gzip,
            preserve_dest_plugins: self.preserve_dest_plugins,
            config: self.config,
            interactive: stdin_is_interactive(),
        }
    }
}

fn main() {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    info!("=== wp-migrate started ===");

    let settings = match Settings::resolve(args.into_options(), |name| std::env::var(name).ok()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
    };

    match execute(&settings, InterruptLatch::process()) {
        Ok(Outcome::Declined) => info!("=== wp-migrate finished: nothing done ==="),
        Ok(outcome) => info!("=== wp-migrate finished: {:?} ===", outcome),
        Err(e) => {
            error!("{}", e);
            error!("=== wp-migrate failed ===");
            std::process::exit(e.exit_code());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use migrate_core::registry::AdapterRegistry;

    #[test]
    fn test_archive_format_help_names_every_format_id() {
        let command = Args::command();
        let help = command
            .get_arguments()
            .find(|a| a.get_id() == "archive_format")
            .and_then(|a| a.get_help())
            .map(|h| h.to_string())
            .unwrap();
        for id in AdapterRegistry::default().ids() {
            assert!(help.contains(&format!(" {id}")), "{id} missing from: {help}");
        }
    }
}
