use serde::Deserialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::{env, fs};

#[derive(Deserialize)]
struct DictionaryFile {
    name: String,
    marker_size: usize,
    max_correction_bits: u8,
    codes: Vec<u64>,
}

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));
    let data_dir = manifest_dir.join("data");
    println!("cargo:rerun-if-changed={}", data_dir.display());

    let mut files: Vec<PathBuf> = fs::read_dir(&data_dir)
        .expect("read data dir")
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with("_CODES.json"))
        })
        .collect();
    files.sort();

    let mut out = String::new();
    let mut names = Vec::new();
    for path in &files {
        println!("cargo:rerun-if-changed={}", path.display());
        let dict = load(path);
        let bits = dict.marker_size * dict.marker_size;
        assert!(bits <= 64, "{}: {} bits do not fit u64", dict.name, bits);
        let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
        for &c in &dict.codes {
            assert!(c & !mask == 0, "{}: code {c:#x} exceeds {bits} bits", dict.name);
        }

        let codes = dict
            .codes
            .iter()
            .map(|c| format!("{c:#x}"))
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(
            out,
            "pub const {name}: Dictionary = Dictionary::from_static(\"{name}\", {size}, {corr}, &[{codes}]);",
            name = dict.name,
            size = dict.marker_size,
            corr = dict.max_correction_bits,
        )
        .expect("write");
        names.push(dict.name);
    }

    writeln!(
        out,
        "\n/// Names of all embedded dictionaries.\npub const BUILTIN_NAMES: &[&str] = &[{}];",
        names
            .iter()
            .map(|n| format!("\"{n}\""))
            .collect::<Vec<_>>()
            .join(", ")
    )
    .expect("write");

    out.push_str("\n/// Look up an embedded dictionary by name.\n");
    out.push_str("pub fn builtin_dictionary(name: &str) -> Option<Dictionary> {\n    match name {\n");
    for n in &names {
        writeln!(out, "        \"{n}\" => Some({n}),").expect("write");
    }
    out.push_str("        _ => None,\n    }\n}\n");

    let out_path = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR")).join("builtins.rs");
    fs::write(out_path, out).expect("write builtins.rs");
}

fn load(path: &Path) -> DictionaryFile {
    let raw = fs::read_to_string(path).expect("read dictionary json");
    serde_json::from_str(&raw).expect("parse dictionary json")
}
