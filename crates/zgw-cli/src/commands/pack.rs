//! Pack command - build a firmware container from local firmware images

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use zgw_package::{ContainerBuilder, DependencyEdge, TargetSpec, Version};

pub fn pack(out: &Path, id: u32, name: &str, targets: &[String]) -> Result<()> {
    let mut builder = ContainerBuilder::new(id, name).created_at(unix_now());
    for (index, target) in targets.iter().enumerate() {
        let spec = parse_target(target).with_context(|| format!("target {}", index + 1))?;
        println!(
            "  target {:#06X} v{}: {} bytes, {} dependencies",
            spec.target_id,
            spec.version_string,
            spec.firmware.len(),
            spec.dependencies.len()
        );
        builder = builder.add_target(spec);
    }
    let container = builder.build()?;
    fs::write(out, &container).with_context(|| format!("writing {}", out.display()))?;
    println!("wrote {} ({} bytes)", out.display(), container.len());
    Ok(())
}

/// Parses `<id>:<version>:<firmware file>[:<dep id>@<min version>,...]`.
fn parse_target(spec: &str) -> Result<TargetSpec> {
    let mut parts = spec.splitn(4, ':');
    let id = parts.next().context("missing target id")?;
    let target_id = parse_u16(id).with_context(|| format!("bad target id {id:?}"))?;
    let version_text = parts.next().context("missing version")?;
    let version: Version = version_text
        .parse()
        .with_context(|| format!("bad version {version_text:?}"))?;
    let path = parts.next().context("missing firmware file")?;
    let firmware = fs::read(path).with_context(|| format!("reading {path}"))?;

    let mut dependencies = Vec::new();
    if let Some(deps) = parts.next() {
        for dep in deps.split(',').filter(|d| !d.is_empty()) {
            let (dep_id, min) = dep
                .split_once('@')
                .with_context(|| format!("dependency {dep:?} is not <id>@<min version>"))?;
            dependencies.push(DependencyEdge {
                target_id: parse_u16(dep_id)
                    .with_context(|| format!("bad dependency id {dep_id:?}"))?,
                min_version: min
                    .parse()
                    .with_context(|| format!("bad minimum version {min:?}"))?,
            });
        }
    }

    Ok(TargetSpec {
        target_id,
        hw_revision: 0,
        version,
        version_string: version_text.to_string(),
        priority: 0,
        build_time: unix_now(),
        dependencies,
        firmware,
    })
}

fn parse_u16(text: &str) -> Result<u16> {
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        text.parse()
    };
    match parsed {
        Ok(value) => Ok(value),
        Err(_) => bail!("{text:?} is not a 16-bit value"),
    }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
