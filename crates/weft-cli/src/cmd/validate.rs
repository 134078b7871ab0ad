use std::io::Write;
use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;
use serde::Serialize;
use weft_core::{AuxCausalTree, TreeError, TreeOptions, Weave};

use crate::cmd::load_stored;
use crate::output::{OutputMode, pretty_kv, render_mode};

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Stored trees to check.
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
struct FileReport {
    path: String,
    ok: bool,
    atoms: usize,
    pending: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'static str>,
}

/// Strictly validate each tree; fails if any one is invalid.
///
/// Loading re-places every atom, so the loaded weave is checked first and
/// the weave as stored in the file second.
pub fn run_validate(args: &ValidateArgs, options: TreeOptions, output: OutputMode) -> Result<()> {
    let mut reports = Vec::with_capacity(args.paths.len());
    for path in &args.paths {
        let stored = load_stored(path)?;
        let in_file = Weave::check_order(stored.weave.as_deref().unwrap_or_default());
        let tree = AuxCausalTree::from_stored(stored, options);
        let pending = tree.weave().pending_len();
        let mut report = FileReport {
            path: path.display().to_string(),
            ok: true,
            atoms: tree.weave().len(),
            pending,
            code: None,
            error: None,
            hint: None,
        };
        if let Err(err) = tree.validate() {
            report.ok = false;
            report.code = Some(err.code().code());
            report.error = Some(err.to_string());
            report.hint = err.code().hint();
        } else if pending > 0 {
            report.ok = false;
            report.error = Some(format!("{pending} atoms reference causes missing from the file"));
        } else if let Err(err) = in_file {
            let err = TreeError::from(err);
            report.ok = false;
            report.code = Some(err.code().code());
            report.error = Some(format!("stored order: {err}"));
            report.hint = err.code().hint();
        }
        reports.push(report);
    }

    render_mode(
        output,
        &reports,
        |reports, w| {
            for r in reports {
                match &r.error {
                    Some(error) => {
                        let code = r.code.unwrap_or("-");
                        writeln!(w, "FAIL {} {code} {error}", r.path)?;
                    }
                    None => writeln!(w, "OK   {} atoms={}", r.path, r.atoms)?,
                }
            }
            Ok(())
        },
        |reports, w| {
            for r in reports {
                pretty_kv(w, if r.ok { "OK" } else { "FAIL" }, &r.path)?;
                if let Some(error) = &r.error {
                    match r.code {
                        Some(code) => writeln!(w, "  {code}: {error}")?,
                        None => writeln!(w, "  {error}")?,
                    }
                }
                if let Some(hint) = r.hint {
                    writeln!(w, "  hint: {hint}")?;
                }
            }
            Ok(())
        },
    )?;

    let failed = reports.iter().filter(|r| !r.ok).count();
    if failed > 0 {
        bail!("validate: {failed} of {} trees invalid", reports.len());
    }
    Ok(())
}
