use chrono::{DateTime, Datelike, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Plans destination paths for downloaded attachments under a base directory.
///
/// Layout: `<base>/<account>/<YYYY>/<MMDD>_<message-id>_<filename>`, with a
/// numeric suffix inserted before the extension when the name is already
/// taken on disk or by an earlier placement in the same run. An existing file
/// is never overwritten.
pub struct PathPlanner {
    base: PathBuf,
    placed: HashSet<PathBuf>,
}

/// Replace path separators and NULs so an attachment name stays a single
/// path component. An empty name gets a placeholder.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned
    }
}

fn with_counter(filename: &str, counter: u32) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            format!("{}_{:02}.{}", stem, counter, ext)
        }
        _ => format!("{}_{:02}", filename, counter),
    }
}

impl PathPlanner {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        PathPlanner {
            base: base.as_ref().to_path_buf(),
            placed: HashSet::new(),
        }
    }

    fn taken(&self, path: &Path) -> bool {
        self.placed.contains(path) || path.exists()
    }

    /// Reserve a destination path for one attachment. The directory chain is
    /// created; the file itself is left for the caller to write.
    pub fn plan(
        &mut self,
        account: &str,
        date: DateTime<Utc>,
        message_id: &str,
        filename: &str,
    ) -> std::io::Result<PathBuf> {
        let dir = self
            .base
            .join(account)
            .join(format!("{:04}", date.year()));
        std::fs::create_dir_all(&dir)?;

        let name = format!(
            "{:02}{:02}_{}_{}",
            date.month(),
            date.day(),
            message_id,
            sanitize_filename(filename)
        );

        let mut candidate = dir.join(&name);
        let mut counter = 0u32;
        while self.taken(&candidate) {
            counter += 1;
            candidate = dir.join(with_counter(&name, counter));
        }

        self.placed.insert(candidate.clone());
        Ok(candidate)
    }
}
