use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use serde_json::Value;
use weft_core::{TreeOptions, WeaveVersion};

use crate::cmd::load_tree;
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Stored tree to inspect.
    pub path: PathBuf,

    /// Also list every atom in weave order.
    #[arg(long)]
    pub atoms: bool,
}

#[derive(Debug, Serialize)]
struct AtomRow {
    id: String,
    cause: Option<String>,
    kind: String,
    op: Value,
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    site: u32,
    known_sites: Vec<u32>,
    time: u64,
    atoms: usize,
    /// Atoms in the file whose cause is missing from it.
    pending: usize,
    version: WeaveVersion,
    entities: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    weave: Option<Vec<AtomRow>>,
}

pub fn run_inspect(args: &InspectArgs, options: TreeOptions, output: OutputMode) -> Result<()> {
    let mut tree = load_tree(&args.path, options)?;

    let entities = tree
        .state()
        .entities
        .iter()
        .map(|(id, entity)| (id.clone(), entity.tags.clone()))
        .collect();
    let weave = if args.atoms {
        let rows = tree
            .weave()
            .atoms()
            .iter()
            .map(|atom| {
                Ok(AtomRow {
                    id: atom.id.to_string(),
                    cause: atom.cause.map(|c| c.to_string()),
                    kind: atom.value.kind().to_string(),
                    op: serde_json::to_value(&atom.value)?,
                })
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;
        Some(rows)
    } else {
        None
    };

    let out = InspectOutput {
        site: tree.site().id,
        known_sites: tree.known_sites().iter().map(|s| s.id).collect(),
        time: tree.time(),
        atoms: tree.weave().len(),
        pending: tree.weave().pending_len(),
        version: tree.version(),
        entities,
        weave,
    };

    render_mode(output, &out, render_text, render_pretty)
}

fn render_text(o: &InspectOutput, w: &mut dyn Write) -> std::io::Result<()> {
    writeln!(
        w,
        "tree site={} time={} atoms={} entities={} hash={}",
        o.site,
        o.time,
        o.atoms,
        o.entities.len(),
        o.version.hash
    )?;
    for (id, tags) in &o.entities {
        for (name, value) in tags {
            writeln!(w, "tag entity={id} name={name} value={value}")?;
        }
        if tags.is_empty() {
            writeln!(w, "entity id={id}")?;
        }
    }
    for row in o.weave.iter().flatten() {
        writeln!(
            w,
            "atom id={} cause={} kind={} op={}",
            row.id,
            row.cause.as_deref().unwrap_or("-"),
            row.kind,
            row.op
        )?;
    }
    Ok(())
}

fn render_pretty(o: &InspectOutput, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, "Causal Tree")?;
    pretty_kv(w, "Site", o.site.to_string())?;
    let sites: Vec<String> = o.known_sites.iter().map(u32::to_string).collect();
    pretty_kv(w, "Known sites", sites.join(", "))?;
    pretty_kv(w, "Clock", o.time.to_string())?;
    pretty_kv(w, "Atoms", o.atoms.to_string())?;
    if o.pending > 0 {
        pretty_kv(w, "Waiting for cause", o.pending.to_string())?;
    }
    pretty_kv(w, "Version", &o.version.hash)?;

    writeln!(w)?;
    pretty_section(w, "Entities")?;
    if o.entities.is_empty() {
        writeln!(w, "(none)")?;
    }
    for (id, tags) in &o.entities {
        writeln!(w, "{id}")?;
        for (name, value) in tags {
            writeln!(w, "  {name:<12} {value}")?;
        }
    }

    if let Some(rows) = &o.weave {
        writeln!(w)?;
        pretty_section(w, "Weave")?;
        for row in rows {
            let depth_marker = if row.cause.is_some() { "  " } else { "" };
            writeln!(w, "{depth_marker}{:<12} {:<7} {}", row.id, row.kind, row.op)?;
        }
    }
    Ok(())
}
