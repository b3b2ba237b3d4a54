//! Shared helpers for the integration tests: a file-backed stand-in for the
//! CMS command-line tool and archive builders.

#![allow(dead_code)]

use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

use migrate_core::command::{CommandOutput, CommandRunner};
use migrate_core::config::{Mode, Settings};
use migrate_core::error::Result;
use migrate_core::guard::InterruptLatch;
use migrate_core::site::{Side, Site};
use migrate_core::table_prefix::{configured_prefix, rewrite_config, CONFIG_FILE};

/// Database file of a fake installation. `TABLE <name>` and
/// `OPTION <name>=<value>` lines.
pub const DB_FILE: &str = ".db.sql";
/// Present in a site root: `config set` reports success but writes nothing.
pub const BROKEN_CONFIG_SET: &str = ".config-set-broken";

/// Answers `wp` invocations from files under the `--path` root.
#[derive(Default)]
pub struct FakeWp {
    calls: Mutex<Vec<String>>,
    interrupt_after: Option<(String, InterruptLatch)>,
    fail_on: Option<String>,
}

impl FakeWp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger `latch` once a command starting with `command` has run.
    pub fn interrupt_after(mut self, command: &str, latch: InterruptLatch) -> Self {
        self.interrupt_after = Some((command.to_string(), latch));
        self
    }

    /// Exit non-zero for commands starting with `command`.
    pub fn fail_on(mut self, command: &str) -> Self {
        self.fail_on = Some(command.to_string());
        self
    }

    fn answer(&self, root: &Path, words: &[&str]) -> CommandOutput {
        let db = root.join(DB_FILE);
        let config = root.join(CONFIG_FILE);
        let read = |p: &Path| fs::read_to_string(p).unwrap_or_default();

        match words {
            ["core", "is-installed"] => {
                if config.exists() {
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(1, "")
                }
            }
            ["maintenance-mode", "activate"] => {
                fs::write(root.join(".maintenance"), "<?php").unwrap();
                CommandOutput::ok("")
            }
            ["maintenance-mode", "deactivate"] => {
                let _ = fs::remove_file(root.join(".maintenance"));
                CommandOutput::ok("")
            }
            ["db", "export", file] => {
                fs::write(file, read(&db)).unwrap();
                CommandOutput::ok("")
            }
            ["db", "import", file] => match fs::read_to_string(file) {
                Ok(text) => {
                    fs::write(&db, text).unwrap();
                    CommandOutput::ok("")
                }
                Err(e) => CommandOutput::failed(1, e.to_string()),
            },
            ["db", "reset"] => {
                fs::write(&db, "").unwrap();
                CommandOutput::ok("")
            }
            ["db", "tables"] => {
                let text = read(&db);
                let names: Vec<&str> = text.lines().filter_map(|l| l.strip_prefix("TABLE ")).collect();
                CommandOutput::ok(names.join("\n"))
            }
            ["db", "size"] => CommandOutput::ok(read(&db).len().to_string()),
            ["config", "get", "table_prefix"] => match configured_prefix(&read(&config)) {
                Some(prefix) => CommandOutput::ok(prefix),
                None => CommandOutput::failed(1, "no table_prefix"),
            },
            ["config", "set", "table_prefix", value] => {
                if root.join(BROKEN_CONFIG_SET).exists() {
                    return CommandOutput::ok("");
                }
                match rewrite_config(&read(&config), value) {
                    Some(text) => {
                        fs::write(&config, text).unwrap();
                        CommandOutput::ok("")
                    }
                    None => CommandOutput::failed(1, "no table_prefix"),
                }
            }
            ["option", "get", name] => {
                let text = read(&db);
                let prefix = configured_prefix(&read(&config)).unwrap_or_default();
                let table = format!("TABLE {prefix}options");
                if !text.lines().any(|l| l == table) {
                    return CommandOutput::failed(1, "table not found");
                }
                let wanted = format!("OPTION {name}=");
                match text.lines().find_map(|l| l.strip_prefix(wanted.as_str())) {
                    Some(value) => CommandOutput::ok(value),
                    None => CommandOutput::failed(1, format!("Could not get '{name}' option")),
                }
            }
            ["plugin", "list"] => CommandOutput::ok(dir_names(&root.join("wp-content/plugins"))),
            ["theme", "list"] => CommandOutput::ok(dir_names(&root.join("wp-content/themes"))),
            ["search-replace", old, new] => {
                let text = read(&db);
                fs::write(&db, text.replace(old, new)).unwrap();
                CommandOutput::ok("")
            }
            ["cache", "flush"] => CommandOutput::ok(""),
            other => CommandOutput::failed(1, format!("unsupported: {}", other.join(" "))),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

fn dir_names(dir: &Path) -> String {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names.join("\n")
}

impl CommandRunner for FakeWp {
    fn exec(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        if program != "wp" {
            return Ok(CommandOutput::failed(127, format!("{program}: not found")));
        }
        let root = args
            .iter()
            .find_map(|a| a.strip_prefix("--path="))
            .map(PathBuf::from)
            .unwrap_or_default();
        let words: Vec<&str> = args
            .iter()
            .map(String::as_str)
            .filter(|a| !a.starts_with("--"))
            .collect();
        let line = words.join(" ");
        self.calls.lock().push(line.clone());

        if let Some(prefix) = &self.fail_on {
            if line.starts_with(prefix.as_str()) {
                return Ok(CommandOutput::failed(1, format!("{line}: simulated failure")));
            }
        }
        let output = self.answer(&root, &words);
        if let Some((prefix, latch)) = &self.interrupt_after {
            if line.starts_with(prefix.as_str()) {
                latch.trigger();
            }
        }
        Ok(output)
    }

    fn exec_with_input(&self, program: &str, args: &[String], _input: &[u8]) -> Result<CommandOutput> {
        self.exec(program, args)
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

/// Read-only view of a shared [`FakeWp`] for assertions after the site owns it.
pub struct SharedFake(pub std::sync::Arc<FakeWp>);

impl CommandRunner for SharedFake {
    fn exec(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        self.0.exec(program, args)
    }

    fn exec_with_input(&self, program: &str, args: &[String], input: &[u8]) -> Result<CommandOutput> {
        self.0.exec_with_input(program, args, input)
    }

    fn describe(&self) -> String {
        self.0.describe()
    }
}

pub fn fake_site(root: &Path, fake: &std::sync::Arc<FakeWp>) -> Site {
    fake_site_on(Side::Destination, root, fake)
}

pub fn fake_site_on(side: Side, root: &Path, fake: &std::sync::Arc<FakeWp>) -> Site {
    Site::new(
        side,
        root.to_path_buf(),
        "wp".to_string(),
        Box::new(SharedFake(fake.clone())),
    )
}

pub const LIVE_DB: &str = "TABLE wp_options\nTABLE wp_posts\nTABLE wp_users\n\
OPTION home=https://live.example.com\nOPTION siteurl=https://live.example.com\n\
POST Hello from live\n";

pub const IMPORTED_DB: &str = "TABLE old_options\nTABLE old_posts\nTABLE old_users\n\
OPTION home=https://old.example.org\nOPTION siteurl=https://old.example.org/\n\
POST Link to https://old.example.org/about\n";

/// A live installation with prefix `wp_`, one plugin, one theme and an
/// object-cache drop-in.
pub fn write_live_site(root: &Path) {
    write_tree(
        root,
        &[
            (CONFIG_FILE, "<?php\n$table_prefix = 'wp_';\nrequire_once 'wp-settings.php';\n"),
            (DB_FILE, LIVE_DB),
            ("wp-content/plugins/akismet/akismet.php", "<?php // akismet"),
            ("wp-content/themes/twentytwenty/style.css", "/* live theme */"),
            ("wp-content/uploads/2024/photo.jpg", "jpeg-bytes"),
            ("wp-content/object-cache.php", "<?php // live redis"),
        ],
    );
}

/// Entries of a Duplicator package whose site uses prefix `old_`.
pub fn duplicator_entries() -> Vec<(&'static str, &'static str)> {
    vec![
        ("installer.php", "<?php"),
        ("dup-installer/dup-database__a1b2.sql", IMPORTED_DB),
        ("wp-content/plugins/hello/hello.php", "<?php // hello"),
        ("wp-content/themes/oldtheme/style.css", "/* old theme */"),
        ("wp-content/uploads/2023/old.jpg", "old-jpeg"),
        ("wp-content/object-cache.php", "<?php // archived memcached"),
    ]
}

pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (name, content) in files {
        let path = root.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
    }
}

pub fn write_zip(path: &Path, files: &[(&str, &str)]) {
    let file = fs::File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    for (name, content) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap();
}

fn tar_bytes(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, name, content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap()
}

pub fn write_tar(path: &Path, files: &[(&str, &str)]) {
    fs::write(path, tar_bytes(files)).unwrap();
}

pub fn write_tar_gz(path: &Path, files: &[(&str, &str)]) {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes(files)).unwrap();
    fs::write(path, encoder.finish().unwrap()).unwrap();
}

/// Every file under `root` with its content, skipping `skip` prefixes.
pub fn tree_snapshot(root: &Path, skip: &[&str]) -> BTreeMap<String, Vec<u8>> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let rel = e.path().strip_prefix(root).ok()?.to_string_lossy().into_owned();
            if skip.iter().any(|s| rel.starts_with(s)) {
                return None;
            }
            Some((rel, fs::read(e.path()).ok()?))
        })
        .collect()
}

pub fn import_settings(archive: &Path, site: &Path) -> Settings {
    Settings {
        mode: Mode::ArchiveImport {
            archive: archive.to_path_buf(),
            format: None,
            site: site.to_path_buf(),
        },
        dry_run: false,
        assume_yes: true,
        interactive: false,
        gzip: true,
        preserve_dest_plugins: false,
        dest_url: None,
        search_replace: Vec::new(),
        rsync_opts: Vec::new(),
        ssh_opts: Vec::new(),
        wp_bin: "wp".to_string(),
    }
}
