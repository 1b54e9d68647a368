use crate::link::{IfaceId, NodeId};
use crate::report::SimulationReport;
use crate::scheduler::SimTime;
use crate::sim::Simulation;
use crate::trace::TraceStream;
use anyhow::{Context, anyhow};
use ether_lab_abstract::{MacAddr, SimConfig, TestAction, TestAssertion, TestScenario};
use std::fs;
use tracing::info;

pub fn run_scenario_file(path: &str, until: Option<SimTime>) -> anyhow::Result<SimulationReport> {
    let content = fs::read_to_string(path).context("Failed to read scenario file")?;
    let scenario: TestScenario = toml::from_str(&content).context("Failed to parse scenario")?;
    run_scenario(&scenario, until)
}

/// Build the bus, apply the scenario's actions, run, check assertions.
/// `until` caps the run when given; otherwise the scenario's `max_duration`
/// assertion does, with a 10 second fallback.
pub fn run_scenario(
    scenario: &TestScenario,
    until: Option<SimTime>,
) -> anyhow::Result<SimulationReport> {
    info!("Running scenario: {}", scenario.name);
    info!("Description: {}", scenario.description);

    let mut config = SimConfig::default();
    scenario.config.apply_to(&mut config);

    let (mut trace, sink) = TraceStream::to_memory();
    trace.set_default_enabled(true);
    let mut sim = Simulation::with_trace(config, trace);

    let link = sim.add_link(scenario.bus.bandwidth_bps, scenario.bus.detail);
    let mut ifaces = Vec::new();
    for i in 0..scenario.bus.nodes {
        let location = scenario.bus.spacing_m.map(|s| (0.0, s * i as f64));
        let node = sim.add_node(location);
        ifaces.push(sim.attach(node, link)?);
    }

    let iface_for = |n: u32| -> anyhow::Result<IfaceId> {
        ifaces
            .get(n as usize)
            .copied()
            .ok_or_else(|| anyhow!("scenario references unknown node {n}"))
    };

    for action in &scenario.actions {
        match action {
            TestAction::Send { time, from, to, size } => {
                let from = iface_for(*from)?;
                let dst = sim.interface(iface_for(*to)?).mac();
                sim.schedule_send(*time, from, dst, *size);
            }
            TestAction::Broadcast { time, from, size } => {
                let from = iface_for(*from)?;
                sim.schedule_send(*time, from, MacAddr::BROADCAST, *size);
            }
            TestAction::NodeDown { node } => {
                sim.set_node_up(NodeId(*node as usize), false);
            }
        }
    }

    let max_duration = until
        .or_else(|| {
            scenario.assertions.iter().find_map(|a| match a {
                TestAssertion::MaxDuration { secs } => Some(*secs),
                _ => None,
            })
        })
        .unwrap_or(10.0);

    sim.run(Some(max_duration));
    if sim.pending_events() > 0 {
        return Err(anyhow!("scenario timed out after {max_duration} seconds"));
    }
    sim.trace_mut().flush_line();
    let trace_text = sink.contents();

    for assertion in &scenario.assertions {
        match assertion {
            TestAssertion::Delivered { node, count } => {
                let got = sim.deliveries().iter().filter(|d| d.node == *node).count() as u32;
                if got != *count {
                    return Err(anyhow!(
                        "assertion failed: node {node} received {got} frames, expected {count}"
                    ));
                }
            }
            TestAssertion::TraceCount { code, min, max } => {
                let got = trace_text.matches(code.as_str()).count() as u32;
                if got < *min || max.is_some_and(|m| got > m) {
                    return Err(anyhow!(
                        "assertion failed: {got} `{code}` trace records, expected between {min} and {max:?}"
                    ));
                }
            }
            TestAssertion::MaxDuration { .. } => {} // enforced during the run
        }
    }

    info!(
        "Scenario passed: {} deliveries in {:.6} s",
        sim.deliveries().len(),
        sim.now()
    );
    Ok(sim.export_report(&scenario.name, trace_text))
}
