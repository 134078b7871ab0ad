use std::io::Write;
use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;
use serde::Serialize;
use tracing::info;
use weft_core::{AuxCausalTree, SiteInfo, TreeOptions};

use crate::cmd::save_tree;
use crate::output::{OutputMode, pretty_kv, render_mode};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Where to write the new tree.
    pub path: PathBuf,

    /// Site id of this replica. Must be unique among collaborating replicas.
    #[arg(long)]
    pub site: u32,

    /// Create the root atom. Only one replica of a document should.
    #[arg(long)]
    pub root: bool,

    /// Overwrite an existing file.
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
struct InitOutput {
    path: String,
    site: u32,
    atoms: usize,
}

pub fn run_init(args: &InitArgs, options: TreeOptions, output: OutputMode) -> Result<()> {
    if args.path.exists() && !args.force {
        bail!(
            "{} already exists (use --force to overwrite)",
            args.path.display()
        );
    }

    let mut tree = AuxCausalTree::new(SiteInfo::new(args.site), options);
    if args.root {
        tree.root();
    }
    save_tree(&tree, &args.path)?;
    info!(site = args.site, path = %args.path.display(), "initialized tree");

    let out = InitOutput {
        path: args.path.display().to_string(),
        site: args.site,
        atoms: tree.weave().len(),
    };
    render_mode(
        output,
        &out,
        |o, w| writeln!(w, "init path={} site={} atoms={}", o.path, o.site, o.atoms),
        |o, w| {
            pretty_kv(w, "Created", &o.path)?;
            pretty_kv(w, "Site", o.site.to_string())?;
            pretty_kv(w, "Atoms", o.atoms.to_string())
        },
    )
}
