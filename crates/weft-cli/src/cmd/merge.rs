use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tracing::info;
use weft_core::TreeOptions;

use crate::cmd::{load_tree, save_tree};
use crate::output::{OutputMode, pretty_kv, render_mode};

#[derive(Args, Debug)]
pub struct MergeArgs {
    /// Replica to merge into; its site id is kept.
    pub left: PathBuf,

    /// Replica whose atoms are imported.
    pub right: PathBuf,

    /// Write the merged tree here instead of printing it.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct MergeOutput {
    path: String,
    imported: usize,
    atoms: usize,
    time: u64,
    hash: String,
}

pub fn run_merge(args: &MergeArgs, options: TreeOptions, output: OutputMode) -> Result<()> {
    let mut left = load_tree(&args.left, options)?;
    let right = load_tree(&args.right, options)?;

    for site in right.known_sites() {
        left.register_site(*site);
    }
    let imported = left.import(right.weave().atoms().to_vec());
    info!(
        imported = imported.len(),
        atoms = left.weave().len(),
        "merged trees"
    );

    let Some(path) = &args.output else {
        println!("{}", left.export().to_json()?);
        return Ok(());
    };

    save_tree(&left, path)?;
    let out = MergeOutput {
        path: path.display().to_string(),
        imported: imported.len(),
        atoms: left.weave().len(),
        time: left.time(),
        hash: left.version().hash,
    };
    render_mode(
        output,
        &out,
        |o, w| {
            writeln!(
                w,
                "merge path={} imported={} atoms={} time={} hash={}",
                o.path, o.imported, o.atoms, o.time, o.hash
            )
        },
        |o, w| {
            pretty_kv(w, "Merged into", &o.path)?;
            pretty_kv(w, "Imported", o.imported.to_string())?;
            pretty_kv(w, "Atoms", o.atoms.to_string())?;
            pretty_kv(w, "Clock", o.time.to_string())?;
            pretty_kv(w, "Version", &o.hash)
        },
    )
}
