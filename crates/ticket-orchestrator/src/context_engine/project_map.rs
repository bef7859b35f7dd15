//! Cached project structure summaries
//!
//! A map is regenerated when the stored one expires or when the directory
//! listing's fingerprint changes. A short-lived in-process cache keeps
//! back-to-back prompt builds from rescanning the tree.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use chrono::Utc;
use moka::sync::Cache;
use tracing::{debug, info};

use crate::store::{KnowledgeStore, Project, ProjectMap};

const MAX_DEPTH: usize = 3;
const MAX_ENTRIES: usize = 2_000;
const IN_PROCESS_TTL: Duration = Duration::from_secs(60);

const IGNORED_DIRS: &[&str] = &[
    ".git", ".svn", ".hg", ".idea", ".vscode", "node_modules", "vendor", "target", "build",
    "dist", "__pycache__", ".venv", "venv", ".gradle", "bin", "obj", ".next", ".cache",
];

const ENTRY_POINTS: &[&str] = &[
    "src/main.rs", "src/lib.rs", "main.go", "cmd/main.go", "index.php", "public/index.php",
    "artisan", "index.js", "index.ts", "src/index.js", "src/index.ts", "src/main.ts",
    "src/App.tsx", "src/App.jsx", "server.js", "app.js", "app.py", "main.py", "manage.py",
    "Program.cs", "lib/main.dart", "app/src/main/AndroidManifest.xml",
];

const TECH_MARKERS: &[(&str, &str)] = &[
    ("Cargo.toml", "Rust/Cargo"),
    ("package.json", "Node.js"),
    ("composer.json", "PHP/Composer"),
    ("artisan", "Laravel"),
    ("requirements.txt", "Python"),
    ("pyproject.toml", "Python"),
    ("manage.py", "Django"),
    ("go.mod", "Go"),
    ("pom.xml", "Maven"),
    ("build.gradle", "Gradle"),
    ("build.gradle.kts", "Gradle"),
    ("pubspec.yaml", "Flutter"),
    ("Dockerfile", "Docker"),
    ("docker-compose.yml", "Docker Compose"),
];

const PACKAGE_FRAMEWORKS: &[(&str, &str)] = &[
    ("react", "React"),
    ("vue", "Vue"),
    ("next", "Next.js"),
    ("express", "Express"),
    ("svelte", "Svelte"),
    ("@angular/core", "Angular"),
];

#[derive(Debug, Clone)]
struct ScanEntry {
    rel_path: String,
    depth: usize,
    is_dir: bool,
    size: u64,
    modified: u64,
}

pub struct ProjectMapper {
    cache: Cache<i64, Arc<ProjectMap>>,
    expiry_days: i64,
}

impl ProjectMapper {
    pub fn new(expiry_days: i64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(256)
                .time_to_live(IN_PROCESS_TTL)
                .build(),
            expiry_days,
        }
    }

    /// Current map for a project, regenerating it when stale.
    ///
    /// Returns `None` when the project has no work directory on disk.
    pub fn map_for(&self, store: &KnowledgeStore, project: &Project) -> anyhow::Result<Option<Arc<ProjectMap>>> {
        let Some(root) = project.work_path().map(Path::new) else {
            return Ok(None);
        };
        if !root.is_dir() {
            return Ok(None);
        }
        if let Some(cached) = self.cache.get(&project.id) {
            return Ok(Some(cached));
        }

        let entries = scan(root);
        let fingerprint = fingerprint(&entries);
        let now = Utc::now();

        let map = match store.project_map(project.id)? {
            Some(stored) if stored.expires_at > now && stored.fingerprint == fingerprint => {
                debug!(project_id = project.id, "project map still fresh");
                stored
            }
            _ => {
                let map = build_map(project.id, root, &entries, fingerprint, self.expiry_days);
                store.save_project_map(&map)?;
                info!(project_id = project.id, entries = entries.len(), "regenerated project map");
                map
            }
        };

        let map = Arc::new(map);
        self.cache.insert(project.id, Arc::clone(&map));
        Ok(Some(map))
    }

    /// Forget the in-process copy, e.g. after the agent changed the tree.
    pub fn invalidate(&self, project_id: i64) {
        self.cache.invalidate(&project_id);
    }
}

fn scan(root: &Path) -> Vec<ScanEntry> {
    let mut entries = Vec::new();
    scan_dir(root, root, 1, &mut entries);
    entries
}

fn scan_dir(root: &Path, dir: &Path, depth: usize, out: &mut Vec<ScanEntry>) {
    if depth > MAX_DEPTH + 1 || out.len() >= MAX_ENTRIES {
        return;
    }
    let Ok(read) = fs::read_dir(dir) else { return };
    let mut children: Vec<_> = read.flatten().collect();
    children.sort_by_key(|e| e.file_name());

    for child in children {
        if out.len() >= MAX_ENTRIES {
            return;
        }
        let name = child.file_name().to_string_lossy().into_owned();
        let Ok(meta) = child.metadata() else { continue };
        let is_dir = meta.is_dir();
        if is_dir && IGNORED_DIRS.contains(&name.as_str()) {
            continue;
        }
        let path = child.path();
        let rel_path = path
            .strip_prefix(root)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|_| name.clone());
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        out.push(ScanEntry {
            rel_path,
            depth,
            is_dir,
            size: if is_dir { 0 } else { meta.len() },
            modified,
        });
        if is_dir {
            scan_dir(root, &path, depth + 1, out);
        }
    }
}

fn fingerprint(entries: &[ScanEntry]) -> String {
    let mut hasher = blake3::Hasher::new();
    for entry in entries {
        hasher.update(entry.rel_path.as_bytes());
        hasher.update(&entry.size.to_le_bytes());
        hasher.update(&entry.modified.to_le_bytes());
        hasher.update(&[entry.is_dir as u8]);
    }
    hasher.finalize().to_hex().to_string()
}

fn build_map(project_id: i64, root: &Path, entries: &[ScanEntry], fingerprint: String, expiry_days: i64) -> ProjectMap {
    let now = Utc::now();
    ProjectMap {
        project_id,
        structure_summary: render_tree(entries),
        entry_points: ENTRY_POINTS
            .iter()
            .filter(|candidate| entries.iter().any(|e| !e.is_dir && e.rel_path == **candidate))
            .map(|s| s.to_string())
            .collect(),
        tech_stack: detect_tech_stack(root, entries),
        primary_language: primary_language(entries),
        fingerprint,
        generated_at: now,
        expires_at: now + chrono::Duration::days(expiry_days),
    }
}

fn render_tree(entries: &[ScanEntry]) -> String {
    let mut out = String::new();
    for entry in entries.iter().filter(|e| e.depth <= MAX_DEPTH) {
        let name = entry.rel_path.rsplit('/').next().unwrap_or(&entry.rel_path);
        out.push_str(&"  ".repeat(entry.depth - 1));
        out.push_str(name);
        if entry.is_dir {
            out.push('/');
        }
        out.push('\n');
    }
    out
}

fn detect_tech_stack(root: &Path, entries: &[ScanEntry]) -> Vec<String> {
    let top_level = |name: &str| entries.iter().any(|e| e.depth == 1 && e.rel_path == name);
    let mut stack: Vec<String> = Vec::new();
    for (marker, tech) in TECH_MARKERS {
        if top_level(*marker) && !stack.iter().any(|s| s == tech) {
            stack.push(tech.to_string());
        }
    }
    if entries.iter().any(|e| e.depth == 1 && e.rel_path.ends_with(".csproj")) {
        stack.push(".NET".to_string());
    }

    if top_level("package.json") {
        if let Ok(raw) = fs::read_to_string(root.join("package.json")) {
            if let Ok(manifest) = serde_json::from_str::<serde_json::Value>(&raw) {
                for section in ["dependencies", "devDependencies"] {
                    let Some(deps) = manifest.get(section).and_then(|d| d.as_object()) else { continue };
                    for (package, framework) in PACKAGE_FRAMEWORKS {
                        if deps.contains_key(*package) && !stack.iter().any(|s| s == framework) {
                            stack.push(framework.to_string());
                        }
                    }
                }
            }
        }
    }
    stack
}

fn primary_language(entries: &[ScanEntry]) -> Option<String> {
    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    for entry in entries.iter().filter(|e| !e.is_dir) {
        let Some(ext) = entry.rel_path.rsplit_once('.').map(|(_, ext)| ext) else { continue };
        let language = match ext {
            "rs" => "Rust",
            "py" => "Python",
            "js" | "jsx" | "mjs" => "JavaScript",
            "ts" | "tsx" => "TypeScript",
            "php" => "PHP",
            "go" => "Go",
            "java" => "Java",
            "kt" | "kts" => "Kotlin",
            "cs" => "C#",
            "rb" => "Ruby",
            "swift" => "Swift",
            "dart" => "Dart",
            "c" | "h" => "C",
            "cpp" | "cc" | "hpp" => "C++",
            _ => continue,
        };
        *counts.entry(language).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(language, _)| language.to_string())
}
