#![no_main]

use libfuzzer_sys::fuzz_target;
use weft_core::{Atom, AuxCausalTree, AuxOp, SiteInfo, TreeOptions};

// Importing any batch of well-formed atoms must not panic, and importing the
// same batch again must change nothing.
fuzz_target!(|data: &[u8]| {
    let Ok(atoms) = serde_json::from_slice::<Vec<Atom<AuxOp>>>(data) else {
        return;
    };

    let mut tree = AuxCausalTree::new(SiteInfo::new(u32::MAX), TreeOptions::default());
    tree.import(atoms.clone());
    let _ = tree.state();
    let time = tree.time();
    let version = tree.version();

    let again = tree.import(atoms);
    assert!(again.is_empty(), "re-import added atoms");
    assert_eq!(tree.time(), time);
    assert_eq!(tree.version(), version);
});
