//! Deterministic, sanitized output filenames for downloaded citations.
//!
//! Names follow `ref_<id>_<title>_<hash>.pdf`:
//! - `id` and `title` are sanitized to filesystem-safe characters
//! - `title` is cut to 60 characters, and further (down to 10) when the whole
//!   name would exceed `max_filename_length`
//! - `hash` is the first 8 hex digits of SHA-256 over `id|title|doi|arxiv_id`,
//!   so two citations never map to the same name even when their titles agree
//!
//! Names derive from the citation alone, so distinct citations never contend
//! for a path. Repeated ids can, and are settled when the file is published.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::citation::Citation;

const PREFIX: &str = "ref";
const EXTENSION: &str = ".pdf";
const PART_SUFFIX: &str = ".part";
const MAX_TITLE_CHARS: usize = 60;
const MIN_TITLE_CHARS: usize = 10;
const HASH_HEX_CHARS: usize = 8;
const MAX_COLLISIONS: usize = 1000;

/// Where a download for a citation should land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPath {
    /// A free path to write to.
    Fresh(PathBuf),
    /// The deterministic name already exists and `skip_existing` is set.
    Existing(PathBuf),
}

/// Builds the deterministic filename for a citation.
///
/// # Examples
///
/// ```
/// use bibp_core::Citation;
/// use bibp_core::download::citation_filename;
///
/// let citation = Citation::new("12", "").with_title("Attention Is All You Need");
/// let name = citation_filename(&citation, 150);
/// assert!(name.starts_with("ref_12_Attention_Is_All_You_Need_"));
/// assert!(name.ends_with(".pdf"));
/// ```
#[must_use]
pub fn citation_filename(citation: &Citation, max_len: usize) -> String {
    build_filename(citation, max_len, 0)
}

/// Builds the name for the `n`th collision of a citation's filename.
///
/// `n == 1` gives `<stem>_<id>.pdf`, larger `n` give `<stem>_<id>_<n>.pdf`.
/// The title is shortened so the result still fits `max_len`.
#[must_use]
pub fn collision_filename(citation: &Citation, max_len: usize, n: usize) -> String {
    build_filename(citation, max_len, n.max(1))
}

/// Picks the target path for a citation in `dir`.
///
/// When the deterministic name is taken, `skip_existing` reports it as
/// [`TargetPath::Existing`]; otherwise the collision is resolved as
/// `<stem>_<id>.pdf`, then `<stem>_<id>_2.pdf`, `<stem>_<id>_3.pdf`, ...
///
/// The answer can go stale before the download finishes; publishing never
/// replaces a file and falls back to [`collision_paths`] instead.
#[must_use]
pub fn resolve_target_path(
    dir: &Path,
    citation: &Citation,
    max_len: usize,
    skip_existing: bool,
) -> TargetPath {
    let base_path = dir.join(citation_filename(citation, max_len));
    if !base_path.exists() {
        return TargetPath::Fresh(base_path);
    }
    if skip_existing {
        return TargetPath::Existing(base_path);
    }
    if let Some(free) = collision_paths(dir, citation, max_len).find(|path| !path.exists()) {
        return TargetPath::Fresh(free);
    }
    // Fallback (extremely unlikely)
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let n = usize::try_from(timestamp).unwrap_or(usize::MAX);
    TargetPath::Fresh(dir.join(collision_filename(citation, max_len, n)))
}

/// Collision names for a citation in `dir`, in the order they are tried.
pub fn collision_paths<'a>(
    dir: &'a Path,
    citation: &'a Citation,
    max_len: usize,
) -> impl Iterator<Item = PathBuf> + Send + 'a {
    (1..MAX_COLLISIONS).map(move |n| dir.join(collision_filename(citation, max_len, n)))
}

/// Staging path used while a body is streamed and validated.
#[must_use]
pub fn part_path(final_path: &Path) -> PathBuf {
    staging_path(final_path, 0)
}

/// The `n`th staging path for `final_path`: `<final>.part`, then
/// `<final>.<n>.part` for concurrent downloads aimed at the same name.
#[must_use]
pub fn staging_path(final_path: &Path, n: usize) -> PathBuf {
    let mut staged = final_path.as_os_str().to_owned();
    if n > 0 {
        staged.push(format!(".{n}"));
    }
    staged.push(PART_SUFFIX);
    PathBuf::from(staged)
}

/// `ref_<id>[_<title>]_<hash>[_<id>[_<n>]].pdf`, capped at `max_len`.
fn build_filename(citation: &Citation, max_len: usize, collision: usize) -> String {
    let id = non_empty_or(sanitize_filename_component(&citation.id), "unknown");
    let hash = citation_hash(citation);
    let full_title: String = citation
        .title
        .as_deref()
        .map(sanitize_filename_component)
        .unwrap_or_default()
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect();

    let assemble = |id: &str, title: &str| {
        let mut name = format!("{PREFIX}_{id}_");
        if !title.is_empty() {
            name.push_str(title);
            name.push('_');
        }
        name.push_str(&hash);
        match collision {
            0 => {}
            1 => name.push_str(&format!("_{id}")),
            n => name.push_str(&format!("_{id}_{n}")),
        }
        name.push_str(EXTENSION);
        name
    };

    let title = if full_title.is_empty() {
        full_title
    } else {
        let fixed = assemble(&id, "").chars().count();
        let budget = max_len.saturating_sub(fixed + 1).max(MIN_TITLE_CHARS);
        let cut: String = full_title.chars().take(budget).collect();
        cut.trim_end_matches(['_', '.', '-']).to_string()
    };
    let name = assemble(&id, &title);

    // Oversized ids are the only way left to exceed the cap; the hash keeps
    // the shortened name unique.
    let overflow = name.chars().count().saturating_sub(max_len);
    if overflow == 0 {
        return name;
    }
    let occurrences = if collision == 0 { 1 } else { 2 };
    let keep = id
        .chars()
        .count()
        .saturating_sub(overflow.div_ceil(occurrences))
        .max(1);
    let short_id: String = id.chars().take(keep).collect();
    assemble(&short_id, &title)
}

fn citation_hash(citation: &Citation) -> String {
    let mut hasher = Sha256::new();
    hasher.update(citation.id.as_bytes());
    hasher.update(b"|");
    hasher.update(citation.title.as_deref().unwrap_or_default().as_bytes());
    hasher.update(b"|");
    hasher.update(citation.clean_doi().unwrap_or_default().as_bytes());
    hasher.update(b"|");
    hasher.update(citation.arxiv_id().unwrap_or_default().as_bytes());
    let digest = hasher.finalize();
    digest
        .iter()
        .take(HASH_HEX_CHARS / 2)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Maps a free-form value to `[A-Za-z0-9._-]`, collapsing separators to one `_`.
pub(crate) fn sanitize_filename_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep = false;
    for ch in value.chars() {
        if ch.is_alphanumeric() || matches!(ch, '-' | '.') {
            out.push(ch);
            prev_sep = false;
        } else if !prev_sep {
            out.push('_');
            prev_sep = true;
        }
    }
    let trimmed = out.trim_matches(['_', '.']);
    if is_safe_filename_segment(trimmed) {
        trimmed.to_string()
    } else {
        trimmed.replace('.', "_")
    }
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}
