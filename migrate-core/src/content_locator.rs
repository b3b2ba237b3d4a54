use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const CONTENT_DIR_NAME: &str = "wp-content";
pub const EXPECTED_CHILDREN: [&str; 3] = ["plugins", "themes", "uploads"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentCapabilities {
    pub has_plugins: bool,
    pub has_themes: bool,
    pub has_uploads: bool,
}

impl ContentCapabilities {
    pub fn of(content_dir: &Path) -> Self {
        Self {
            has_plugins: content_dir.join("plugins").is_dir(),
            has_themes: content_dir.join("themes").is_dir(),
            has_uploads: content_dir.join("uploads").is_dir(),
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.has_plugins || self.has_themes || self.has_uploads)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub score: u8,
    pub depth: usize,
}

/// Number of expected child directories present, 0 to 3.
pub fn score(dir: &Path) -> u8 {
    EXPECTED_CHILDREN
        .iter()
        .filter(|child| dir.join(child).is_dir())
        .count() as u8
}

/// Every directory named like a content root anywhere under `root`, in a
/// deterministic (name-sorted) walk order.
pub fn find_candidates(root: &Path) -> Vec<Candidate> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir() && e.file_name() == CONTENT_DIR_NAME)
        .map(|e| Candidate {
            score: score(e.path()),
            depth: e.depth(),
            path: e.into_path(),
        })
        .collect()
}

fn pick_best(candidates: &[Candidate]) -> Option<&Candidate> {
    // First-found wins among equals: only a strictly better candidate replaces.
    let mut best: Option<&Candidate> = None;
    for candidate in candidates {
        best = match best {
            None => Some(candidate),
            Some(current)
                if candidate.score > current.score
                    || (candidate.score == current.score && candidate.depth < current.depth) =>
            {
                Some(candidate)
            }
            keep => keep,
        };
    }
    best
}

/// Highest-scoring candidate, shallowest first on ties. When every candidate
/// scores zero the first one found is returned as a low-confidence match.
pub fn locate_best(root: &Path) -> Option<PathBuf> {
    locate_best_candidate(root).map(|c| c.path)
}

fn locate_best_candidate(root: &Path) -> Option<Candidate> {
    let candidates = find_candidates(root);
    debug!(
        "Content candidates under {}: {:?}",
        root.display(),
        candidates
            .iter()
            .map(|c| (c.path.display().to_string(), c.score))
            .collect::<Vec<_>>()
    );

    let best = pick_best(&candidates)?.clone();
    if best.score == 0 {
        warn!(
            "Low-confidence content location: {} has none of {:?}",
            best.path.display(),
            EXPECTED_CHILDREN
        );
    } else {
        info!(
            "Located content directory {} (score {}/3)",
            best.path.display(),
            best.score
        );
    }
    Some(best)
}

/// Best-of-best across a second level of directories, for layouts that group
/// several sites side by side (`<group>/<site>/{plugins,themes,uploads}`).
/// Second-level directories are scored whatever their name; only candidates
/// with at least one expected child are considered.
pub fn locate_best_nested(root: &Path) -> Option<PathBuf> {
    let mut per_group = Vec::new();
    for group in sorted_subdirs(root) {
        let candidates: Vec<Candidate> = sorted_subdirs(&group)
            .into_iter()
            .map(|dir| Candidate {
                score: score(&dir),
                depth: 2,
                path: dir,
            })
            .filter(|c| c.score > 0)
            .collect();
        if let Some(best) = pick_best(&candidates) {
            debug!("Best site candidate in {}: {}", group.display(), best.path.display());
            per_group.push(best.clone());
        }
    }
    let best = pick_best(&per_group)?;
    info!(
        "Located grouped content directory {} (score {}/3)",
        best.path.display(),
        best.score
    );
    Some(best.path.clone())
}

fn sorted_subdirs(dir: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect(),
        Err(_) => Vec::new(),
    };
    dirs.sort();
    dirs
}
