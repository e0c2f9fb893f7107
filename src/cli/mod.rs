//! ER-015: CLI subcommands: decode, encode, check, explain, compare,
//! update-directory.

use crate::core::document::{self, SectionData, SectionKey, Selection, Tape};
use crate::core::plumbing::{self, CompareTolerance};
use crate::core::recipe::Catalogue;
use crate::core::types::Options;
use crate::core::value::ArrayMode;
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Decode an ENDF-6 tape into JSON
    Decode {
        /// ENDF-6 file
        file: PathBuf,

        /// Recipe files (glob patterns)
        #[arg(short, long, required = true, num_args = 1..)]
        recipes: Vec<String>,

        /// Options file (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Keep sections that fail to decode as raw lines
        #[arg(long)]
        best_effort: bool,

        /// Only decode these sections (MF or MF/MT)
        #[arg(long, value_delimiter = ',')]
        include: Vec<SectionKey>,

        /// Keep these sections raw (MF or MF/MT)
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<SectionKey>,

        /// Array layout: sparse or dense
        #[arg(long, value_parser = parse_array_mode)]
        array_mode: Option<ArrayMode>,
    },

    /// Encode JSON back into an ENDF-6 tape
    Encode {
        /// JSON file produced by `decode`
        file: PathBuf,

        /// Recipe files (glob patterns)
        #[arg(short, long, required = true, num_args = 1..)]
        recipes: Vec<String>,

        /// Options file (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write ENDF-6 here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Only write these sections (MF or MF/MT)
        #[arg(long, value_delimiter = ',')]
        include: Vec<SectionKey>,

        /// Leave these sections out (MF or MF/MT)
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<SectionKey>,

        /// Do not append line numbers
        #[arg(long)]
        no_linenum: bool,
    },

    /// Validate recipe files and print their content hashes
    Check {
        /// Recipe files (glob patterns)
        #[arg(short, long, required = true, num_args = 1..)]
        recipes: Vec<String>,
    },

    /// Print variable descriptions of one decoded section
    Explain {
        /// ENDF-6 file
        file: PathBuf,

        mf: i64,

        mt: i64,

        /// Recipe files (glob patterns)
        #[arg(short, long, required = true, num_args = 1..)]
        recipes: Vec<String>,

        /// Options file (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Only explain this variable (path such as `xstable/E`)
        #[arg(long)]
        var: Option<String>,
    },

    /// Decode two ENDF-6 tapes and report where they differ
    Compare {
        first: PathBuf,

        second: PathBuf,

        /// Recipe files (glob patterns)
        #[arg(short, long, required = true, num_args = 1..)]
        recipes: Vec<String>,

        /// Options file (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Absolute tolerance for numbers
        #[arg(long, default_value_t = 1e-8)]
        atol: f64,

        /// Relative tolerance for numbers
        #[arg(long, default_value_t = 1e-6)]
        rtol: f64,
    },

    /// Recompute the MF1/MT451 directory of an ENDF-6 tape
    UpdateDirectory {
        /// ENDF-6 file (rewritten in place unless --output is given)
        file: PathBuf,

        /// Recipe files (glob patterns)
        #[arg(short, long, required = true, num_args = 1..)]
        recipes: Vec<String>,

        /// Options file (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write the updated tape here
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Do not keep a `.bak` copy when rewriting in place
        #[arg(short, long)]
        no_backup: bool,
    },
}

fn parse_array_mode(s: &str) -> Result<ArrayMode, String> {
    match s {
        "sparse" => Ok(ArrayMode::Sparse),
        "dense" => Ok(ArrayMode::Dense),
        other => Err(format!("unknown array mode {:?} (expected sparse or dense)", other)),
    }
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Decode {
            file,
            recipes,
            config,
            output,
            best_effort,
            include,
            exclude,
            array_mode,
        } => {
            let mut opts = load_options(config.as_deref())?;
            opts.best_effort |= best_effort;
            if let Some(mode) = array_mode {
                opts.array_mode = mode;
            }
            let selection = Selection { include, exclude };
            cmd_decode(&file, &recipes, &opts, &selection, output.as_deref())
        }
        Commands::Encode {
            file,
            recipes,
            config,
            output,
            include,
            exclude,
            no_linenum,
        } => {
            let mut opts = load_options(config.as_deref())?;
            if no_linenum {
                opts.include_linenum = false;
            }
            let selection = Selection { include, exclude };
            cmd_encode(&file, &recipes, &opts, &selection, output.as_deref())
        }
        Commands::Check { recipes } => cmd_check(&recipes),
        Commands::Explain {
            file,
            mf,
            mt,
            recipes,
            config,
            var,
        } => {
            let opts = load_options(config.as_deref())?;
            cmd_explain(&file, mf, mt, &recipes, &opts, var.as_deref())
        }
        Commands::Compare {
            first,
            second,
            recipes,
            config,
            atol,
            rtol,
        } => {
            let opts = load_options(config.as_deref())?;
            cmd_compare(&first, &second, &recipes, &opts, CompareTolerance { atol, rtol })
        }
        Commands::UpdateDirectory {
            file,
            recipes,
            config,
            output,
            no_backup,
        } => {
            let opts = load_options(config.as_deref())?;
            cmd_update_directory(&file, &recipes, &opts, output.as_deref(), !no_backup)
        }
    }
}

fn load_options(config: Option<&Path>) -> Result<Options, String> {
    match config {
        Some(path) => Options::load(path),
        None => Ok(Options::default()),
    }
}

fn read_tape(file: &Path) -> Result<Vec<String>, String> {
    let text = std::fs::read_to_string(file)
        .map_err(|e| format!("cannot read {}: {}", file.display(), e))?;
    Ok(document::read_lines(&text))
}

fn write_output(output: Option<&Path>, content: &str) -> Result<(), String> {
    match output {
        Some(path) => std::fs::write(path, content)
            .map_err(|e| format!("cannot write {}: {}", path.display(), e)),
        None => {
            print!("{}", content);
            Ok(())
        }
    }
}

fn cmd_decode(
    file: &Path,
    recipes: &[String],
    opts: &Options,
    selection: &Selection,
    output: Option<&Path>,
) -> Result<(), String> {
    let catalogue = Catalogue::load(recipes)?;
    let lines = read_tape(file)?;
    let decoded = document::decode(&lines, &catalogue, opts, selection)
        .map_err(|e| format!("{}: {}", file.display(), e))?;
    let json = document::tape_to_json(&decoded.tape).map_err(|e| e.to_string())?;
    let mut text = serde_json::to_string_pretty(&json).map_err(|e| format!("JSON error: {}", e))?;
    text.push('\n');
    write_output(output, &text)?;

    if let Some(path) = output {
        let total: usize = decoded.tape.values().map(|m| m.len()).sum();
        let raw = decoded
            .tape
            .values()
            .flat_map(|m| m.values())
            .filter(|s| matches!(s, SectionData::Raw(_)))
            .count();
        println!(
            "Decoded {} -> {}: {} sections ({} parsed, {} raw), {} warning(s)",
            file.display(),
            path.display(),
            total,
            total - raw,
            raw,
            decoded.warnings.len()
        );
        for (mf, mt) in &decoded.fallbacks {
            println!("  FALLBACK: MF={}/MT={} kept raw", mf, mt);
        }
    }
    Ok(())
}

fn cmd_encode(
    file: &Path,
    recipes: &[String],
    opts: &Options,
    selection: &Selection,
    output: Option<&Path>,
) -> Result<(), String> {
    let catalogue = Catalogue::load(recipes)?;
    let text = std::fs::read_to_string(file)
        .map_err(|e| format!("cannot read {}: {}", file.display(), e))?;
    let json: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| format!("{}: JSON parse error: {}", file.display(), e))?;
    let tape = document::tape_from_json(json).map_err(|e| format!("{}: {}", file.display(), e))?;
    let lines = document::encode(&tape, &catalogue, opts, selection)
        .map_err(|e| format!("{}: {}", file.display(), e))?;
    let mut out = lines.join("\n");
    out.push('\n');
    write_output(output, &out)?;
    if let Some(path) = output {
        println!("Encoded {} -> {}: {} lines", file.display(), path.display(), lines.len());
    }
    Ok(())
}

fn cmd_check(recipes: &[String]) -> Result<(), String> {
    let catalogue = Catalogue::load(recipes)?;
    for (path, hash) in catalogue.sources() {
        println!("OK: {} {}", path.display(), hash);
    }
    for entry in catalogue.entries() {
        match &entry.description {
            Some(desc) => println!("  {:<12} {}", entry.key(), desc),
            None => println!("  {}", entry.key()),
        }
    }
    println!("{} recipe(s) in {} file(s)", catalogue.len(), catalogue.sources().len());
    Ok(())
}

fn cmd_explain(
    file: &Path,
    mf: i64,
    mt: i64,
    recipes: &[String],
    opts: &Options,
    var: Option<&str>,
) -> Result<(), String> {
    let catalogue = Catalogue::load(recipes)?;
    if catalogue.lookup(mf, mt).is_none() {
        return Err(format!("no recipe for MF={}/MT={}", mf, mt));
    }
    let lines = read_tape(file)?;
    let selection = Selection {
        include: vec![SectionKey::Section(mf, mt)],
        exclude: Vec::new(),
    };
    let decoded = document::decode(&lines, &catalogue, opts, &selection)
        .map_err(|e| format!("{}: {}", file.display(), e))?;
    if !decoded.tape.get(&mf).is_some_and(|m| m.contains_key(&mt)) {
        return Err(format!("{} has no section MF={}/MT={}", file.display(), mf, mt));
    }
    let Some(descriptions) = decoded.descriptions.get(&(mf, mt)) else {
        println!("MF={}/MT={}: no variable descriptions", mf, mt);
        return Ok(());
    };
    let mut shown = 0;
    for (name, text) in descriptions {
        if var.is_some_and(|v| v != name.as_str()) {
            continue;
        }
        let mut parts = text.lines();
        println!("{}: {}", name, parts.next().unwrap_or(""));
        for rest in parts {
            println!("    {}", rest);
        }
        shown += 1;
    }
    if shown == 0 {
        if let Some(v) = var {
            return Err(format!("no description for {} in MF={}/MT={}", v, mf, mt));
        }
    }
    Ok(())
}

fn decode_tape(file: &Path, catalogue: &Catalogue, opts: &Options, selection: &Selection) -> Result<Tape, String> {
    let lines = read_tape(file)?;
    let decoded = document::decode(&lines, catalogue, opts, selection)
        .map_err(|e| format!("{}: {}", file.display(), e))?;
    Ok(decoded.tape)
}

fn cmd_compare(
    first: &Path,
    second: &Path,
    recipes: &[String],
    opts: &Options,
    tol: CompareTolerance,
) -> Result<(), String> {
    let catalogue = Catalogue::load(recipes)?;
    let a = decode_tape(first, &catalogue, opts, &Selection::all())?;
    let b = decode_tape(second, &catalogue, opts, &Selection::all())?;
    let diffs = plumbing::compare_tapes(&a, &b, tol, opts);
    if diffs.is_empty() {
        println!("{} and {} agree", first.display(), second.display());
        return Ok(());
    }
    for d in &diffs {
        println!("  DIFF: {}", d);
    }
    Err(format!(
        "{} and {} differ in {} place(s)",
        first.display(),
        second.display(),
        diffs.len()
    ))
}

fn cmd_update_directory(
    file: &Path,
    recipes: &[String],
    opts: &Options,
    output: Option<&Path>,
    backup: bool,
) -> Result<(), String> {
    let catalogue = Catalogue::load(recipes)?;
    if catalogue.lookup(1, 451).is_none() {
        return Err("no recipe for MF=1/MT=451".into());
    }
    let selection = Selection {
        include: vec![SectionKey::Section(1, 451)],
        exclude: Vec::new(),
    };
    let mut tape = decode_tape(file, &catalogue, opts, &selection)?;
    let entries = plumbing::update_directory(&mut tape, &catalogue, opts)
        .map_err(|e| format!("{}: {}", file.display(), e))?;
    let lines = document::encode(&tape, &catalogue, opts, &Selection::all())
        .map_err(|e| format!("{}: {}", file.display(), e))?;
    let mut text = lines.join("\n");
    text.push('\n');

    let target = output.unwrap_or(file);
    if output.is_none() && backup {
        let mut bak = file.as_os_str().to_owned();
        bak.push(".bak");
        std::fs::copy(file, &bak)
            .map_err(|e| format!("cannot back up {}: {}", file.display(), e))?;
    }
    std::fs::write(target, text).map_err(|e| format!("cannot write {}: {}", target.display(), e))?;
    println!(
        "Updated directory of {}: {} section(s) listed",
        target.display(),
        entries.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipes() -> Vec<String> {
        vec![concat!(env!("CARGO_MANIFEST_DIR"), "/recipes/*.yaml").to_string()]
    }

    fn tape_json() -> serde_json::Value {
        let tpid = format!("{:<66}{:>4}{:>2}{:>3}{:>5}", " demo tape", 1, 0, 0, 0);
        serde_json::json!({
            "0": {"0": [tpid]},
            "3": {"1": {
                "MAT": 125, "MF": 3, "MT": 1,
                "ZA": 1001.0, "AWR": 0.9991673, "QM": 0.0, "QI": 0.0, "LR": 0,
                "xstable": {
                    "NBT": [5], "INT": [2],
                    "E": [0.0, 5.0, 10.0, 15.0, 20.0],
                    "xs": [14.0, 19.0, 22.0, 31.0, 12.0]
                }
            }}
        })
    }

    /// Tape with an MF1/MT451 whose directory lists only MF3/MT1 with a
    /// wrong line count.
    fn tape_with_directory() -> serde_json::Value {
        let mut tape = tape_json();
        let pad = |s: &str, w: usize| format!("{:<w$}", s, w = w);
        let mut desc = serde_json::json!({"MAT": 125, "MF": 1, "MT": 451, "ZA": 1001.0, "AWR": 0.9991673});
        for (k, v) in [("ELIS", 0.0), ("STA", 0.0), ("AWI", 1.0), ("EMAX", 2.0e7), ("TEMP", 0.0)] {
            desc[k] = serde_json::json!(v);
        }
        for (k, v) in [
            ("LRP", 0),
            ("LFI", 0),
            ("NLIB", 0),
            ("NMOD", 1),
            ("LIS", 0),
            ("LISO", 0),
            ("NFOR", 6),
            ("LREL", 0),
            ("NSUB", 10),
            ("NVER", 8),
            ("LDRV", 0),
            ("NWD", 6),
            ("NXC", 1),
        ] {
            desc[k] = serde_json::json!(v);
        }
        for (k, v, w) in [
            ("ZSYMAM", "  1-H -  1", 11),
            ("ALAB", "LANL", 11),
            ("EDATE", "EVAL-JUL16", 10),
            ("AUTH", "G.HALE", 33),
            ("REF", "", 21),
            ("DDATE", "DIST-FEB18", 10),
            ("RDATE", "", 10),
            ("ENDATE", "20171009", 8),
        ] {
            desc[k] = serde_json::json!(pad(v, w));
        }
        let hsub = ["----ENDF/B-VIII.0", "-----INCIDENT NEUTRON DATA", "------ENDF-6 FORMAT"];
        desc["HSUB"] = serde_json::json!(hsub.iter().map(|h| pad(h, 66)).collect::<Vec<_>>());
        desc["DESCRIPTION"] = serde_json::json!([pad(" demo material", 66)]);
        for (k, v) in [("MFx", 3), ("MTx", 1), ("NCx", 99), ("MOD", 4)] {
            desc[k] = serde_json::json!([v]);
        }
        tape["1"] = serde_json::json!({ "451": desc });
        tape
    }

    fn directory(tape: &Tape) -> Vec<(i64, i64, i64, i64)> {
        let Some(SectionData::Parsed(desc)) = tape.get(&1).and_then(|m| m.get(&451)) else {
            panic!("MF1/MT451 not decoded");
        };
        let column = |name: &str| -> Vec<i64> {
            match &desc[name] {
                crate::core::value::Value::Array(a) => a
                    .entries()
                    .map(|(_, v)| v.as_number().unwrap().as_exact_int().unwrap())
                    .collect(),
                other => panic!("{} is not an array: {:?}", name, other),
            }
        };
        let (mf, mt, nc, modn) = (column("MFx"), column("MTx"), column("NCx"), column("MOD"));
        (0..mf.len()).map(|i| (mf[i], mt[i], nc[i], modn[i])).collect()
    }

    fn write_json(dir: &Path) -> PathBuf {
        let path = dir.join("tape.json");
        std::fs::write(&path, tape_json().to_string()).unwrap();
        path
    }

    #[test]
    fn test_er015_encode_decode_files() {
        let dir = tempfile::tempdir().unwrap();
        let json = write_json(dir.path());
        let endf = dir.path().join("tape.endf");
        let opts = Options::default();
        cmd_encode(&json, &recipes(), &opts, &Selection::all(), Some(&endf)).unwrap();
        let text = std::fs::read_to_string(&endf).unwrap();
        assert_eq!(text.lines().count(), 10);

        let decoded = dir.path().join("decoded.json");
        cmd_decode(&endf, &recipes(), &opts, &Selection::all(), Some(&decoded)).unwrap();
        let back: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&decoded).unwrap()).unwrap();
        assert_eq!(back["3"]["1"]["xstable"]["xs"], tape_json()["3"]["1"]["xstable"]["xs"]);
        assert!(back["0"]["0"]["TAPEDESCR"].is_string());

        let again = dir.path().join("again.endf");
        cmd_encode(&decoded, &recipes(), &opts, &Selection::all(), Some(&again)).unwrap();
        assert_eq!(std::fs::read_to_string(&again).unwrap(), text);
    }

    #[test]
    fn test_er015_decode_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let res = cmd_decode(
            &dir.path().join("nope.endf"),
            &recipes(),
            &Options::default(),
            &Selection::all(),
            None,
        );
        assert!(res.unwrap_err().contains("cannot read"));
    }

    #[test]
    fn test_er015_check_bundled_recipes() {
        cmd_check(&recipes()).unwrap();
    }

    #[test]
    fn test_er015_check_rejects_bad_recipe() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("bad.yaml"),
            "recipes:\n  - mf: 3\n    body:\n      - head: {fields: [ZA, AWR]}\n",
        )
        .unwrap();
        let pattern = format!("{}/*.yaml", dir.path().display());
        let err = cmd_check(&[pattern]).unwrap_err();
        assert!(err.contains("invalid recipe"));
    }

    #[test]
    fn test_er015_explain() {
        let dir = tempfile::tempdir().unwrap();
        let json = write_json(dir.path());
        let endf = dir.path().join("tape.endf");
        let opts = Options::default();
        cmd_encode(&json, &recipes(), &opts, &Selection::all(), Some(&endf)).unwrap();
        cmd_explain(&endf, 3, 1, &recipes(), &opts, None).unwrap();
        cmd_explain(&endf, 3, 1, &recipes(), &opts, Some("xstable/E")).unwrap();
        assert!(cmd_explain(&endf, 3, 1, &recipes(), &opts, Some("NOPE")).is_err());
        assert!(cmd_explain(&endf, 3, 2, &recipes(), &opts, None).is_err());
        assert!(cmd_explain(&endf, 9, 1, &recipes(), &opts, None).is_err());
    }

    #[test]
    fn test_er015_options_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opts.yaml");
        std::fs::write(&path, "best_effort: true\nformat:\n  width: 11\n").unwrap();
        let opts = load_options(Some(&path)).unwrap();
        assert!(opts.best_effort);
        std::fs::write(&path, "no_such_key: 1\n").unwrap();
        assert!(load_options(Some(&path)).is_err());
    }

    #[test]
    fn test_er015_array_mode_parser() {
        assert_eq!(parse_array_mode("dense").unwrap(), ArrayMode::Dense);
        assert!(parse_array_mode("list").is_err());
    }

    #[test]
    fn test_er015_compare_tapes() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::default();
        let json = write_json(dir.path());
        let first = dir.path().join("first.endf");
        cmd_encode(&json, &recipes(), &opts, &Selection::all(), Some(&first)).unwrap();

        let mut changed = tape_json();
        changed["3"]["1"]["xstable"]["xs"][2] = serde_json::json!(22.5);
        let changed_json = dir.path().join("changed.json");
        std::fs::write(&changed_json, changed.to_string()).unwrap();
        let second = dir.path().join("second.endf");
        cmd_encode(&changed_json, &recipes(), &opts, &Selection::all(), Some(&second)).unwrap();

        cmd_compare(&first, &first, &recipes(), &opts, CompareTolerance::default()).unwrap();
        let err = cmd_compare(&first, &second, &recipes(), &opts, CompareTolerance::default()).unwrap_err();
        assert!(err.contains("differ in 1 place(s)"), "{}", err);
        let loose = CompareTolerance { atol: 1.0, rtol: 0.0 };
        cmd_compare(&first, &second, &recipes(), &opts, loose).unwrap();
    }

    #[test]
    fn test_er015_update_directory_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::default();
        let json = dir.path().join("tape.json");
        std::fs::write(&json, tape_with_directory().to_string()).unwrap();
        let endf = dir.path().join("tape.endf");
        cmd_encode(&json, &recipes(), &opts, &Selection::all(), Some(&endf)).unwrap();
        let before = std::fs::read_to_string(&endf).unwrap();

        cmd_update_directory(&endf, &recipes(), &opts, None, true).unwrap();
        let backup = dir.path().join("tape.endf.bak");
        assert_eq!(std::fs::read_to_string(&backup).unwrap(), before);

        let catalogue = Catalogue::load(&recipes()).unwrap();
        let tape = decode_tape(&endf, &catalogue, &opts, &Selection::all()).unwrap();
        // MF1/MT451: 4 control lines, NWD=6 text lines, 2 directory lines
        assert_eq!(directory(&tape), vec![(1, 451, 12, 0), (3, 1, 5, 4)]);
        let lines = read_tape(&endf).unwrap();
        let sections = document::split_sections(&lines, &opts).unwrap();
        assert_eq!(sections[&1][&451].len(), 12);
        assert_eq!(sections[&3][&1].len(), 5);
    }

    #[test]
    fn test_er015_update_directory_to_output() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::default();
        let json = dir.path().join("tape.json");
        std::fs::write(&json, tape_with_directory().to_string()).unwrap();
        let endf = dir.path().join("tape.endf");
        cmd_encode(&json, &recipes(), &opts, &Selection::all(), Some(&endf)).unwrap();
        let before = std::fs::read_to_string(&endf).unwrap();

        let out = dir.path().join("updated.endf");
        cmd_update_directory(&endf, &recipes(), &opts, Some(&out), true).unwrap();
        assert_eq!(std::fs::read_to_string(&endf).unwrap(), before);
        assert!(!dir.path().join("tape.endf.bak").exists());
        let err = cmd_compare(&endf, &out, &recipes(), &opts, CompareTolerance::default()).unwrap_err();
        assert!(err.contains("differ"), "{}", err);

        // a tape without MF1/MT451 has no directory to update
        let plain = dir.path().join("plain.endf");
        cmd_encode(&write_json(dir.path()), &recipes(), &opts, &Selection::all(), Some(&plain)).unwrap();
        let err = cmd_update_directory(&plain, &recipes(), &opts, None, false).unwrap_err();
        assert!(err.contains("MF=1/MT=451"), "{}", err);
    }
}
