use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tracing::{info, warn};
use weft_core::{EntityEvent, TreeOptions};

use crate::cmd::{load_tree, save_tree};
use crate::output::{OutputMode, pretty_kv, render_mode};

#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Tree to edit in place.
    pub tree: PathBuf,

    /// JSON array of entity events, e.g.
    /// `[{"event":"add","id":"a","tags":{"title":"hi"}}]`.
    pub events: PathBuf,
}

#[derive(Debug, Serialize)]
struct ApplyOutput {
    events: usize,
    atoms_created: usize,
    time: u64,
}

pub fn run_apply(args: &ApplyArgs, options: TreeOptions, output: OutputMode) -> Result<()> {
    let raw = fs::read_to_string(&args.events)
        .with_context(|| format!("Failed to read events file {}", args.events.display()))?;
    let events: Vec<EntityEvent> = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid events in {}", args.events.display()))?;

    let mut tree = load_tree(&args.tree, options)?;
    if tree.weave().root().is_none() {
        warn!(path = %args.tree.display(), "tree has no root; additions will be skipped");
    }
    let count = events.len();
    let created = tree.add_events(events);
    save_tree(&tree, &args.tree)?;
    info!(events = count, atoms = created.len(), "applied events");

    let out = ApplyOutput {
        events: count,
        atoms_created: created.len(),
        time: tree.time(),
    };
    render_mode(
        output,
        &out,
        |o, w| {
            writeln!(
                w,
                "apply events={} atoms_created={} time={}",
                o.events, o.atoms_created, o.time
            )
        },
        |o, w| {
            pretty_kv(w, "Events", o.events.to_string())?;
            pretty_kv(w, "Atoms created", o.atoms_created.to_string())?;
            pretty_kv(w, "Clock", o.time.to_string())
        },
    )
}
