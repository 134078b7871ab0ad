#![no_main]

use libfuzzer_sys::fuzz_target;
use weft_core::{AuxCausalTree, TreeOptions};

// Decoding arbitrary input must never panic, and a decoded tree must survive
// an export/decode cycle without losing atoms.
fuzz_target!(|data: &[u8]| {
    let Ok(json) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(mut tree) = AuxCausalTree::from_json(json, TreeOptions::default()) else {
        return;
    };
    let _ = tree.validate();
    let _ = tree.state();

    let Ok(encoded) = tree.export().to_json() else {
        return;
    };
    let reloaded = AuxCausalTree::from_json(&encoded, TreeOptions::default())
        .expect("exported tree must decode");
    assert_eq!(reloaded.weave().len(), tree.weave().len());
});
