use anyhow::{anyhow, Result};
use reprompt_runtime::{Config, PipelineComponent};

pub fn run(config: &Config, components: &[String]) -> Result<()> {
    let Some(topology) = &config.topology else {
        println!("No topology configured");
        return Ok(());
    };

    let present = if components.is_empty() {
        PipelineComponent::ALL.to_vec()
    } else {
        components
            .iter()
            .map(|name| parse_component(name))
            .collect::<Result<Vec<_>>>()?
    };

    let placements = topology.resolve(&present);
    if placements.is_empty() {
        println!("No components placed");
    }
    for placement in placements {
        println!("{:<16} {}", placement.component, placement.device);
    }
    Ok(())
}

fn parse_component(name: &str) -> Result<PipelineComponent> {
    PipelineComponent::ALL
        .into_iter()
        .find(|component| component.as_str() == name.trim())
        .ok_or_else(|| anyhow!("unknown pipeline component '{}'", name))
}
