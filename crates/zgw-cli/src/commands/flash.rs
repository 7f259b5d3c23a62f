//! Flash command - stream a firmware container to the gateway
//!
//! Runs the full update sequence a tester would: request-download with the
//! declared container size, transfer-data in blocks sized to the gateway's
//! advertised maximum, then request-transfer-exit, which triggers the
//! gateway's verification of the staged container.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use zgw_package::ContainerHeader;
use zgw_uds::{service_id, ServiceResponse};

use crate::client::TesterLink;

pub async fn flash(link: &mut TesterLink, file: &Path) -> Result<()> {
    let mut container = fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let header = ContainerHeader::parse(&container)
        .with_context(|| format!("{} is not a valid container file", file.display()))?;
    if !covers_declared_size(container.len() as u64, header.total_size) {
        bail!(
            "{} is shorter than the declared container size ({} < {})",
            file.display(),
            container.len(),
            header.total_size
        );
    }
    container.truncate(header.total_size as usize);

    println!(
        "container {:?}: {} bytes, routing target {:#06X}",
        header.name,
        header.total_size,
        header.routing_target().target_id
    );

    let mut request = vec![service_id::REQUEST_DOWNLOAD, 0x00, 0x44];
    request.extend_from_slice(&0u32.to_be_bytes());
    request.extend_from_slice(&(container.len() as u32).to_be_bytes());
    let accepted = expect_positive("download request", link.request(request).await?)?;
    let block_length = parse_max_block_length(&accepted)?;
    let chunk_size = block_length.saturating_sub(2);
    if chunk_size == 0 {
        bail!("gateway advertised an unusable block length ({block_length})");
    }
    println!("download accepted, block length {block_length}");

    let total = container.len();
    let mut sent = 0usize;
    let mut last_percent = 0usize;
    let mut block: u8 = 1;
    for chunk in container.chunks(chunk_size) {
        let mut transfer = vec![service_id::TRANSFER_DATA, block];
        transfer.extend_from_slice(chunk);
        let echo = expect_positive("transfer", link.request(transfer).await?)?;
        if echo.first() != Some(&block) {
            bail!(
                "gateway acknowledged block {:?}, expected {block}",
                echo.first()
            );
        }
        sent += chunk.len();
        let percent = sent * 100 / total;
        if percent >= last_percent + 10 || sent == total {
            println!("  {percent:>3}% ({sent}/{total} bytes)");
            last_percent = percent;
        }
        // Block counters wrap to 1, never back to 0.
        block = match block.wrapping_add(1) {
            0 => 1,
            next => next,
        };
    }

    expect_positive(
        "transfer exit",
        link.request(vec![service_id::REQUEST_TRANSFER_EXIT]).await?,
    )?;
    println!("container verified and accepted");
    Ok(())
}

/// Whether a file of `file_len` bytes holds the whole declared container.
/// Compared as u64 so file sizes past 4 GiB do not wrap.
fn covers_declared_size(file_len: u64, total_size: u32) -> bool {
    file_len >= u64::from(total_size)
}

fn expect_positive(step: &str, response: ServiceResponse) -> Result<Vec<u8>> {
    match response {
        ServiceResponse::Positive { data, .. } => Ok(data),
        ServiceResponse::Negative { nrc, .. } => bail!("{step} rejected: {nrc}"),
    }
}

/// Decodes the length-format byte and the max-block-length field that
/// follows it in a request-download positive response.
fn parse_max_block_length(data: &[u8]) -> Result<usize> {
    let format = *data.first().context("empty download response")?;
    let count = (format >> 4) as usize;
    if count == 0 || count > 4 || data.len() < 1 + count {
        bail!("malformed max block length in download response");
    }
    let mut length = 0usize;
    for byte in &data[1..1 + count] {
        length = (length << 8) | *byte as usize;
    }
    Ok(length)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_length_decodes_single_byte_count() {
        assert_eq!(parse_max_block_length(&[0x10, 0x80]).unwrap(), 0x80);
    }

    #[test]
    fn block_length_decodes_two_byte_count() {
        assert_eq!(parse_max_block_length(&[0x20, 0x01, 0x00]).unwrap(), 256);
    }

    #[test]
    fn size_guard_does_not_wrap_past_4_gib() {
        assert!(!covers_declared_size(100, 200));
        assert!(covers_declared_size(200, 200));
        // A file just past 4 GiB must not truncate down to a small length.
        assert!(covers_declared_size((1 << 32) + 16, 192));
    }

    #[test]
    fn block_length_rejects_truncated_field() {
        assert!(parse_max_block_length(&[0x20, 0x01]).is_err());
        assert!(parse_max_block_length(&[0x00]).is_err());
        assert!(parse_max_block_length(&[]).is_err());
    }
}
