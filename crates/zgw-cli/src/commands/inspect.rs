//! Inspect command - dump a container's header, targets and dependencies

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::json;
use zgw_package::container::{CONTAINER_CRC, CRC_COVERAGE_OFFSET, METADATA_LEN};
use zgw_package::{ContainerHeader, TargetEntry, TargetMetadata};

pub fn inspect(file: &Path, json_output: bool) -> Result<()> {
    let bytes = fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let header = ContainerHeader::parse(&bytes)
        .with_context(|| format!("{} is not a valid container file", file.display()))?;

    let total = header.total_size as usize;
    let checksum_ok = bytes.len() >= total
        && CONTAINER_CRC.checksum(&bytes[CRC_COVERAGE_OFFSET..total]) == header.crc32;

    if json_output {
        let targets: Vec<_> = header
            .targets
            .iter()
            .map(|entry| {
                let dependencies = read_metadata(&bytes, entry)
                    .map(|meta| {
                        meta.dependencies
                            .iter()
                            .map(|dep| {
                                json!({
                                    "target_id": format!("{:#06X}", dep.target_id),
                                    "min_version": dep.min_version.to_string(),
                                })
                            })
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                json!({
                    "target_id": format!("{:#06X}", entry.target_id),
                    "version": entry.version.to_string(),
                    "offset": entry.offset,
                    "total_size": entry.total_size,
                    "firmware_size": entry.firmware_size(),
                    "priority": entry.priority,
                    "crc32": format!("{:#010X}", entry.crc32),
                    "dependencies": dependencies,
                })
            })
            .collect();
        let report = json!({
            "name": header.name,
            "container_id": header.container_id,
            "total_size": header.total_size,
            "created_at": header.created_at,
            "crc32": format!("{:#010X}", header.crc32),
            "checksum_ok": checksum_ok,
            "routing_target": format!("{:#06X}", header.routing_target().target_id),
            "targets": targets,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("container:  {:?} (id {})", header.name, header.container_id);
    println!(
        "size:       {} bytes, created at {}",
        header.total_size, header.created_at
    );
    println!(
        "checksum:   {:#010X} ({})",
        header.crc32,
        if checksum_ok { "ok" } else { "MISMATCH" }
    );
    println!(
        "routing to: {:#06X}",
        header.routing_target().target_id
    );
    println!("targets:");
    for entry in &header.targets {
        println!(
            "  {:#06X} v{}  offset {}, {} bytes ({} firmware), priority {}, crc {:#010X}",
            entry.target_id,
            entry.version,
            entry.offset,
            entry.total_size,
            entry.firmware_size(),
            entry.priority,
            entry.crc32
        );
        if let Some(meta) = read_metadata(&bytes, entry) {
            for dep in &meta.dependencies {
                println!("          requires {:#06X} >= {}", dep.target_id, dep.min_version);
            }
        }
    }
    Ok(())
}

/// Metadata for one target, or `None` when the slice is truncated or the
/// block does not decode.
fn read_metadata(bytes: &[u8], entry: &TargetEntry) -> Option<TargetMetadata> {
    let start = entry.offset as usize;
    let end = start.checked_add(METADATA_LEN)?;
    TargetMetadata::parse(bytes.get(start..end)?, entry).ok()
}
