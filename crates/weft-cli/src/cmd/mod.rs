pub mod apply;
pub mod init;
pub mod inspect;
pub mod merge;
pub mod sim;
pub mod validate;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use weft_core::{AuxCausalTree, AuxOp, StoredCausalTree, TreeOptions};

/// Read a stored tree from `path`.
pub fn load_tree(path: &Path, options: TreeOptions) -> Result<AuxCausalTree> {
    Ok(AuxCausalTree::from_stored(load_stored(path)?, options))
}

/// Read and decode a stored tree without placing its atoms.
pub fn load_stored(path: &Path) -> Result<StoredCausalTree<AuxOp>> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("Failed to read tree file {}", path.display()))?;
    StoredCausalTree::from_json(&json).map_err(|err| {
        let code = err.code();
        anyhow::Error::new(err).context(format!(
            "{code}: {} in {}",
            code.message(),
            path.display()
        ))
    })
}

/// Write `tree` to `path` as pretty JSON.
pub fn save_tree(tree: &AuxCausalTree, path: &Path) -> Result<()> {
    let json = tree.export().to_json()?;
    fs::write(path, json + "\n")
        .with_context(|| format!("Failed to write tree file {}", path.display()))
}
