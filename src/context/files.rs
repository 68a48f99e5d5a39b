use crate::models::{FileMap, file_size};

pub const FILE_TRUNCATION_MARKER: &str = "\n\n/* ... file truncated ... */";

const ESSENTIAL_BONUS: i64 = 1_000_000;
const ENTRY_POINT_BONUS: i64 = 100_000;
/// One point of penalty per this many characters.
const SIZE_PENALTY_DIVISOR: i64 = 100;

const ESSENTIAL_NAMES: &[&str] = &[
    "package.json",
    "cargo.toml",
    "pyproject.toml",
    "requirements.txt",
    "go.mod",
    "manifest.json",
    "tsconfig.json",
];

const ENTRY_POINT_MARKERS: &[&str] = &["index", "main", "app"];

fn file_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_ascii_lowercase()
}

/// Manifest, spec, or readme.
pub fn is_essential(path: &str) -> bool {
    let name = file_name(path);
    let stem = name.split('.').next().unwrap_or(&name);
    ESSENTIAL_NAMES.contains(&name.as_str()) || stem == "readme" || stem == "spec"
}

pub fn is_entry_point(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    ENTRY_POINT_MARKERS.iter().any(|m| lower.contains(m))
}

pub fn score(path: &str, content: &str) -> i64 {
    let mut score = 0;
    if is_essential(path) {
        score += ESSENTIAL_BONUS;
    }
    if is_entry_point(path) {
        score += ENTRY_POINT_BONUS;
    }
    let size = i64::try_from(file_size(path, content)).unwrap_or(i64::MAX);
    score - size / SIZE_PENALTY_DIVISOR
}

/// Files by descending score, ties broken by path.
pub fn rank_files(files: &FileMap) -> Vec<(&str, &str)> {
    let mut ranked: Vec<(i64, &str, &str)> = files
        .iter()
        .map(|(p, c)| (score(p, c), p.as_str(), c.as_str()))
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    ranked.into_iter().map(|(_, p, c)| (p, c)).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileSelection {
    pub files: FileMap,
    pub used_chars: usize,
    pub truncated: bool,
    /// Paths left out entirely, in rank order.
    pub omitted: Vec<String>,
}

/// Greedy include by rank. The first file that doesn't fit is cut to the
/// remaining room (with [`FILE_TRUNCATION_MARKER`]); everything after it is
/// omitted.
pub fn select_files(files: &FileMap, budget: usize) -> FileSelection {
    let mut selected = FileMap::new();
    let mut used = 0usize;
    let mut truncated = false;
    let mut omitted = Vec::new();

    for (path, content) in rank_files(files) {
        if truncated {
            omitted.push(path.to_string());
            continue;
        }
        let size = file_size(path, content);
        if used + size <= budget {
            used += size;
            selected.insert(path.to_string(), content.to_string());
            continue;
        }

        truncated = true;
        let remaining = budget - used;
        let overhead = path.chars().count() + FILE_TRUNCATION_MARKER.chars().count();
        match remaining.checked_sub(overhead) {
            Some(room) if room > 0 => {
                let mut cut: String = content.chars().take(room).collect();
                cut.push_str(FILE_TRUNCATION_MARKER);
                used += file_size(path, &cut);
                selected.insert(path.to_string(), cut);
            }
            _ => omitted.push(path.to_string()),
        }
    }

    FileSelection {
        files: selected,
        used_chars: used,
        truncated,
        omitted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(entries: &[(&str, usize)]) -> FileMap {
        entries
            .iter()
            .map(|(p, n)| (p.to_string(), "x".repeat(*n)))
            .collect()
    }

    #[test]
    fn test_essential_detection() {
        assert!(is_essential("package.json"));
        assert!(is_essential("web/Cargo.toml"));
        assert!(is_essential("README.md"));
        assert!(is_essential("docs/spec.md"));
        assert!(!is_essential("src/utils.ts"));
    }

    #[test]
    fn test_rank_order() {
        let fs = files(&[
            ("src/utils.ts", 10),
            ("src/index.ts", 10),
            ("package.json", 10),
            ("src/b.ts", 10),
            ("src/a.ts", 10),
        ]);
        let order: Vec<_> = rank_files(&fs).into_iter().map(|(p, _)| p).collect();
        assert_eq!(
            order,
            vec!["package.json", "src/index.ts", "src/a.ts", "src/b.ts", "src/utils.ts"]
        );
    }

    #[test]
    fn test_smaller_files_rank_higher() {
        let fs = files(&[("src/big.ts", 10_000), ("src/small.ts", 100)]);
        let order: Vec<_> = rank_files(&fs).into_iter().map(|(p, _)| p).collect();
        assert_eq!(order, vec!["src/small.ts", "src/big.ts"]);
    }

    #[test]
    fn test_all_fit() {
        let fs = files(&[("a.ts", 10), ("b.ts", 10)]);
        let sel = select_files(&fs, 1000);
        assert!(!sel.truncated);
        assert_eq!(sel.files, fs);
        assert!(sel.omitted.is_empty());
    }

    #[test]
    fn test_first_non_fitting_file_is_cut_and_rest_omitted() {
        let fs = files(&[("package.json", 50), ("src/index.ts", 500), ("src/z.ts", 5)]);
        let sel = select_files(&fs, 200);
        assert!(sel.truncated);
        assert_eq!(sel.files["package.json"].len(), 50);
        assert!(sel.files["src/index.ts"].ends_with(FILE_TRUNCATION_MARKER));
        assert!(!sel.files.contains_key("src/z.ts"));
        assert_eq!(sel.omitted, vec!["src/z.ts"]);
        assert_eq!(sel.used_chars, 200);
    }

    #[test]
    fn test_essential_included_when_individually_within_budget() {
        let fs = files(&[
            ("src/huge_component.tsx", 900),
            ("README.md", 100),
            ("src/App.tsx", 300),
        ]);
        let sel = select_files(&fs, 150);
        assert_eq!(sel.files["README.md"].len(), 100);
        assert!(!sel.files.contains_key("src/huge_component.tsx"));
    }

    #[test]
    fn test_no_room_for_cut_file_omits_it() {
        let fs = files(&[("a.ts", 20), ("b.ts", 20)]);
        // a.ts takes 24; 6 left is less than path + marker
        let sel = select_files(&fs, 30);
        assert!(sel.truncated);
        assert_eq!(sel.files.len(), 1);
        assert_eq!(sel.omitted, vec!["b.ts"]);
    }
}
