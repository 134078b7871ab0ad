#![forbid(unsafe_code)]

use anyhow::Result;
use weft_sim::{SimulationConfig, Simulator};

fn main() -> Result<()> {
    let result = Simulator::new(SimulationConfig::default())?.run()?;
    let converged = weft_sim::ConvergenceOracle::check_convergence(&result.snapshots).passed;

    println!(
        "simulation complete: trace_events={} atoms={} converged={converged} interesting={}",
        result.trace.len(),
        result.authored.len(),
        result.interesting_state_reached
    );

    Ok(())
}
