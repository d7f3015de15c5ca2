// build.rs

use glob::glob;
use std::env;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// A test case discovered in `data/cases/`.
#[derive(Debug)]
struct CaseFile {
    pub name: String,
    pub path: PathBuf,
}

/// Discovers all case files by scanning the `data/cases/` directory.
fn get_all_cases() -> Vec<CaseFile> {
    glob("data/cases/*.case")
        .expect("Failed to read glob pattern")
        .filter_map(|entry| {
            let path = entry.ok()?;
            let name = path
                .file_stem()?
                .to_string_lossy()
                .to_string()
                .replace(['-', '.'], "_");
            Some(CaseFile { name, path })
        })
        .collect()
}

fn main() {
    println!("cargo:rerun-if-changed=data/cases");

    // Get the Cargo output directory where we will place the generated code.
    let out_dir = env::var("OUT_DIR").unwrap();
    let dest_path = Path::new(&out_dir).join("case_tests.rs");
    let mut file = BufWriter::new(File::create(&dest_path).unwrap());

    // Generate a separate `#[test]` function for each case, on both drivers.
    for case in get_all_cases() {
        println!("cargo:rerun-if-changed={}", case.path.display());
        let path = std::fs::canonicalize(&case.path).unwrap_or(case.path.clone());
        for driver in ["host", "device"] {
            writeln!(
                file,
                r#"
#[test]
fn case_{name}_{driver}() -> anyhow::Result<()> {{
    let case = Case::load("{path}")?;
    run_case(&case, Driver::{variant})
}}
"#,
                name = case.name,
                driver = driver,
                path = path.to_str().unwrap().escape_default(),
                variant = if driver == "host" { "Host" } else { "Device" },
            )
            .unwrap();
        }
    }
}
