//! ER-013: Recipe files, validation and the (MF, MT) catalogue.
//!
//! A recipe file lists section recipes keyed by MF and optionally MT:
//!
//! ```yaml
//! recipes:
//!   - mf: 3
//!     description: reaction cross sections
//!     body:
//!       - head: {fields: [ZA, AWR, 0, 0, 0, 0]}
//!       - tab1: {fields: [QM, QI, 0, LR, NR, NP], table: xstable, x: E, y: xs}
//!       - send
//! ```
//!
//! Compiled files are cached process-wide by the blake3 hash of their
//! source and shared through `Arc`.

use super::types::{parse_yaml, Expr, ListItem, Node};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};
use tracing::debug;

/// One section recipe.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecipeEntry {
    pub mf: i64,
    /// `None` applies to every MT of the file without its own recipe.
    #[serde(default)]
    pub mt: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
    pub body: Vec<Node>,
}

impl RecipeEntry {
    pub fn key(&self) -> String {
        match self.mt {
            Some(mt) => format!("MF{}/MT{}", self.mf, mt),
            None => format!("MF{}", self.mf),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecipeFile {
    pub recipes: Vec<RecipeEntry>,
}

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

// ============================================================================
// Compilation and cache
// ============================================================================

type Cache = RwLock<FxHashMap<String, Arc<RecipeFile>>>;

fn cache() -> &'static Cache {
    static CACHE: OnceLock<Cache> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(FxHashMap::default()))
}

/// Hash recipe source. Returns `"blake3:{hex}"`.
pub fn hash_source(source: &str) -> String {
    format!("blake3:{}", blake3::hash(source.as_bytes()).to_hex())
}

/// Parse recipe YAML, reusing an earlier compilation of identical source.
/// Returns the content hash and the shared recipe file.
pub fn compile(source: &str) -> Result<(String, Arc<RecipeFile>), String> {
    let hash = hash_source(source);
    {
        let guard = cache().read().unwrap_or_else(|p| p.into_inner());
        if let Some(hit) = guard.get(&hash) {
            debug!(%hash, "recipe cache hit");
            return Ok((hash, Arc::clone(hit)));
        }
    }
    let parsed: RecipeFile =
        parse_yaml(source).map_err(|e| format!("recipe parse error: {}", e))?;
    let errors = validate(&parsed);
    if !errors.is_empty() {
        let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(format!("invalid recipe: {}", msgs.join("; ")));
    }
    let mut guard = cache().write().unwrap_or_else(|p| p.into_inner());
    let entry = guard
        .entry(hash.clone())
        .or_insert_with(|| Arc::new(parsed));
    Ok((hash, Arc::clone(entry)))
}

/// Load and compile a recipe file from disk.
pub fn load_recipe(path: &Path) -> Result<(String, Arc<RecipeFile>), String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read recipe {}: {}", path.display(), e))?;
    compile(&content).map_err(|e| format!("{}: {}", path.display(), e))
}

// ============================================================================
// Validation
// ============================================================================

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

struct Walker<'a> {
    key: String,
    loop_vars: Vec<&'a str>,
    in_lookahead: bool,
    errors: Vec<ValidationError>,
}

impl<'a> Walker<'a> {
    fn error(&mut self, msg: String) {
        self.errors.push(ValidationError {
            message: format!("{}: {}", self.key, msg),
        });
    }

    fn ctrl(&mut self, what: &str, ctrl: &[Expr]) {
        if ctrl.len() != 3 {
            self.error(format!("{} needs a MAT/MF/MT triple, got {} values", what, ctrl.len()));
        }
    }

    fn fields(&mut self, what: &str, ctrl: &[Expr], n: usize, got: usize) {
        self.ctrl(what, ctrl);
        if got != n {
            self.error(format!("{} takes {} fields, got {}", what, n, got));
        }
    }

    fn loop_var(&mut self, var: &'a str) {
        if !is_identifier(var) {
            self.error(format!("invalid loop variable name '{}'", var));
        }
        if self.loop_vars.contains(&var) {
            self.error(format!("loop variable '{}' reused by an inner loop", var));
        }
    }

    fn list_items(&mut self, items: &'a [ListItem]) {
        for item in items {
            if let ListItem::Loop(l) = item {
                self.loop_var(&l.var);
                self.loop_vars.push(&l.var);
                self.list_items(&l.body);
                self.loop_vars.pop();
            }
        }
    }

    fn body(&mut self, nodes: &'a [Node]) {
        for node in nodes {
            self.node(node);
        }
    }

    fn node(&mut self, node: &'a Node) {
        match node {
            Node::Head(r) => self.fields("HEAD", &r.ctrl, 6, r.fields.len()),
            Node::Cont(r) => self.fields("CONT", &r.ctrl, 6, r.fields.len()),
            Node::Dir(r) => self.fields("DIR", &r.ctrl, 4, r.fields.len()),
            Node::Tab1(r) => self.fields("TAB1", &r.ctrl, 6, r.fields.len()),
            Node::Tab2(r) => self.fields("TAB2", &r.ctrl, 6, r.fields.len()),
            Node::Intg(r) => {
                self.fields("INTG", &r.ctrl, 3, r.fields.len());
                if !matches!(r.fields.get(2), Some(Expr::Var(_))) {
                    self.error("INTG vector slot must be a variable".to_string());
                }
            }
            Node::List(r) => {
                self.fields("LIST", &r.ctrl, 6, r.fields.len());
                self.list_items(&r.body);
            }
            Node::Text(r) => {
                self.ctrl("TEXT", &r.ctrl);
                let last = r.fields.len().saturating_sub(1);
                for (i, f) in r.fields.iter().enumerate() {
                    match (&f.name, f.width) {
                        (None, None) => self.error("TEXT field without name or width".into()),
                        (Some(n), None) if i != last => {
                            self.error(format!("open-ended TEXT field {} must come last", n))
                        }
                        _ => {}
                    }
                }
            }
            Node::Section(s) => {
                if !is_identifier(&s.name.name) {
                    self.error(format!("invalid section name '{}'", s.name.name));
                }
                self.body(&s.body);
            }
            Node::ForLoop(l) => {
                self.loop_var(&l.var);
                self.loop_vars.push(&l.var);
                self.body(&l.body);
                self.loop_vars.pop();
            }
            Node::RepeatLoop(l) => match &l.var {
                Some(var) => {
                    self.loop_var(var);
                    self.loop_vars.push(var);
                    self.body(&l.body);
                    self.loop_vars.pop();
                }
                None => self.body(&l.body),
            },
            Node::IfClause(c) => {
                if c.branches.is_empty() {
                    self.error("if without branches".into());
                }
                for b in &c.branches {
                    match &b.lookahead {
                        Some(steps) => {
                            if let Expr::Number(n) = steps {
                                if n.as_exact_int().map_or(true, |v| v < 0) {
                                    self.error(format!("lookahead step count {} is not a count", n));
                                }
                            }
                            if self.in_lookahead {
                                self.error("lookahead directives cannot be nested".into());
                            }
                            let outer = std::mem::replace(&mut self.in_lookahead, true);
                            self.body(&b.body);
                            self.in_lookahead = outer;
                        }
                        None => self.body(&b.body),
                    }
                }
                if let Some(body) = &c.otherwise {
                    self.body(body);
                }
            }
            Node::Abbreviation(a) => {
                if !is_identifier(&a.name) {
                    self.error(format!("invalid abbreviation name '{}'", a.name));
                }
            }
            Node::Send | Node::Stop(_) | Node::Comment(_) => {}
        }
    }
}

/// Validate a parsed recipe file. Returns a list of errors (empty = valid).
pub fn validate(file: &RecipeFile) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for entry in &file.recipes {
        if !seen.insert((entry.mf, entry.mt)) {
            errors.push(ValidationError {
                message: format!("duplicate recipe for {}", entry.key()),
            });
        }
        let mut walker = Walker {
            key: entry.key(),
            loop_vars: Vec::new(),
            in_lookahead: false,
            errors: Vec::new(),
        };
        walker.body(&entry.body);
        errors.extend(walker.errors);
    }
    errors
}

// ============================================================================
// Catalogue
// ============================================================================

/// Recipes by (MF, MT); MF-wide recipes are stored with `None`.
#[derive(Debug, Clone, Default)]
pub struct Catalogue {
    entries: IndexMap<(i64, Option<i64>), Arc<RecipeEntry>>,
    sources: Vec<(PathBuf, String)>,
}

impl Catalogue {
    pub fn new() -> Catalogue {
        Catalogue::default()
    }

    /// Load every file matching the glob patterns.
    pub fn load(patterns: &[String]) -> Result<Catalogue, String> {
        let mut cat = Catalogue::new();
        for pattern in patterns {
            let paths = glob::glob(pattern).map_err(|e| format!("bad pattern {}: {}", pattern, e))?;
            let mut matched = false;
            for path in paths {
                let path = path.map_err(|e| format!("cannot access {}: {}", pattern, e))?;
                let (hash, file) = load_recipe(&path)?;
                cat.add(&file).map_err(|e| format!("{}: {}", path.display(), e))?;
                cat.sources.push((path, hash));
                matched = true;
            }
            if !matched {
                return Err(format!("no recipe files match {}", pattern));
            }
        }
        Ok(cat)
    }

    /// Register all recipes of a compiled file.
    pub fn add(&mut self, file: &RecipeFile) -> Result<(), String> {
        for entry in &file.recipes {
            let key = (entry.mf, entry.mt);
            if self.entries.contains_key(&key) {
                return Err(format!("duplicate recipe for {}", entry.key()));
            }
            self.entries.insert(key, Arc::new(entry.clone()));
        }
        Ok(())
    }

    /// Exact MT recipe first, then the MF-wide recipe.
    pub fn lookup(&self, mf: i64, mt: i64) -> Option<&Arc<RecipeEntry>> {
        self.entries
            .get(&(mf, Some(mt)))
            .or_else(|| self.entries.get(&(mf, None)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<RecipeEntry>> {
        self.entries.values()
    }

    /// Files loaded, with their content hashes.
    pub fn sources(&self) -> &[(PathBuf, String)] {
        &self.sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MF0: &str = include_str!("../../recipes/mf0.yaml");
    const MF3: &str = include_str!("../../recipes/mf3.yaml");
    const MF1: &str = include_str!("../../recipes/mf1.yaml");
    const MF4: &str = include_str!("../../recipes/mf4.yaml");

    #[test]
    fn test_er013_bundled_recipes_compile() {
        for src in [MF0, MF1, MF3, MF4] {
            let (hash, file) = compile(src).unwrap();
            assert!(hash.starts_with("blake3:"));
            assert!(!file.recipes.is_empty());
        }
    }

    #[test]
    fn test_er013_cache_shares_compilation() {
        let (h1, a) = compile(MF3).unwrap();
        let (h2, b) = compile(MF3).unwrap();
        assert_eq!(h1, h2);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(hash_source(MF3), h1);
    }

    #[test]
    fn test_er013_lookup_prefers_exact_mt() {
        let mut cat = Catalogue::new();
        cat.add(&compile(MF1).unwrap().1).unwrap();
        cat.add(&compile(MF3).unwrap().1).unwrap();
        assert_eq!(cat.lookup(1, 451).unwrap().mt, Some(451));
        assert_eq!(cat.lookup(1, 452).unwrap().mt, Some(452));
        assert_eq!(cat.lookup(3, 102).unwrap().mt, None);
        assert!(cat.lookup(1, 455).is_none());
        assert!(cat.lookup(5, 18).is_none());
    }

    #[test]
    fn test_er013_duplicate_keys() {
        let src = r#"
recipes:
  - {mf: 3, body: [send]}
  - {mf: 3, body: [send]}
"#;
        let err = compile(src).unwrap_err();
        assert!(err.contains("duplicate recipe for MF3"), "{}", err);
        let mut cat = Catalogue::new();
        cat.add(&compile(MF3).unwrap().1).unwrap();
        assert!(cat.add(&compile(MF3).unwrap().1).is_err());
    }

    #[test]
    fn test_er013_field_count_checked() {
        let src = r#"
recipes:
  - mf: 3
    body:
      - head: {fields: [ZA, AWR, 0, 0, 0]}
      - cont: {ctrl: [MAT, MF], fields: [0, 0, 0, 0, 0, 0]}
"#;
        let err = compile(src).unwrap_err();
        assert!(err.contains("HEAD takes 6 fields"), "{}", err);
        assert!(err.contains("MAT/MF/MT triple"), "{}", err);
    }

    #[test]
    fn test_er013_nested_lookahead_and_loop_reuse() {
        let src = r#"
recipes:
  - mf: 9
    body:
      - for:
          var: i
          from: 1
          to: 2
          body:
            - for: {var: i, from: 1, to: 2, body: []}
      - if:
          branches:
            - when: "A==1"
              lookahead: 1
              body:
                - if:
                    branches:
                      - {when: "B==1", lookahead: 1, body: []}
"#;
        let err = compile(src).unwrap_err();
        assert!(err.contains("reused by an inner loop"), "{}", err);
        assert!(err.contains("cannot be nested"), "{}", err);
    }

    #[test]
    fn test_er013_text_field_layout() {
        let src = r#"
recipes:
  - mf: 1
    mt: 451
    body:
      - text: {fields: ["DESC", "TAIL{3}"]}
"#;
        let err = compile(src).unwrap_err();
        assert!(err.contains("must come last"), "{}", err);
    }

    #[test]
    fn test_er013_parse_error_reported() {
        let err = compile("recipes: [{mf: 3, body: [{head: {fields: [\"ZA+\"]}}]}]").unwrap_err();
        assert!(err.starts_with("recipe parse error"), "{}", err);
    }

    #[test]
    fn test_er013_catalogue_from_glob() {
        let dir = tempfile::tempdir().unwrap();
        for (name, src) in [("mf1.yaml", MF1), ("mf3.yaml", MF3)] {
            let mut f = std::fs::File::create(dir.path().join(name)).unwrap();
            f.write_all(src.as_bytes()).unwrap();
        }
        let pattern = format!("{}/*.yaml", dir.path().display());
        let cat = Catalogue::load(&[pattern]).unwrap();
        assert_eq!(cat.sources().len(), 2);
        assert!(cat.lookup(3, 1).is_some());

        let missing = format!("{}/*.yml", dir.path().display());
        assert!(Catalogue::load(&[missing]).is_err());
    }

    #[test]
    fn test_er013_load_bundled_recipe_files() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("recipes");
        for name in ["mf0.yaml", "mf1.yaml", "mf3.yaml", "mf4.yaml"] {
            let (hash, file) = load_recipe(&dir.join(name)).unwrap();
            assert!(hash.starts_with("blake3:"));
            assert!(file.recipes.iter().all(|r| !r.body.is_empty()), "{}", name);
        }
        let cat = Catalogue::load(&[format!("{}/*.yaml", dir.display())]).unwrap();
        assert!(cat.lookup(0, 0).is_some());
        assert!(cat.lookup(3, 102).is_some());
    }

    #[test]
    fn test_er013_catalogue_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Catalogue>();
        assert_send_sync::<Arc<RecipeFile>>();
    }
}
