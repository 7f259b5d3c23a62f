//! Read-did command - read one data identifier

use anyhow::{bail, Result};
use zgw_uds::{service_id, ServiceResponse};

use crate::client::TesterLink;

/// Read a DID and print its value: the bank status decoded, text where it
/// is printable, raw hex otherwise.
pub async fn read_did(link: &mut TesterLink, did: u16) -> Result<()> {
    let request = vec![service_id::READ_DATA_BY_ID, (did >> 8) as u8, did as u8];
    let value = match link.request(request).await? {
        ServiceResponse::Positive { data, .. } => {
            if data.len() < 2 || data[0..2] != [(did >> 8) as u8, did as u8] {
                bail!(
                    "response does not echo the identifier: {}",
                    hex::encode(&data)
                );
            }
            data[2..].to_vec()
        }
        ServiceResponse::Negative { nrc, .. } => bail!("read rejected: {nrc}"),
    };

    if did == zgw_uds::did::FLASH_BANK_STATUS && value.len() == 4 {
        let bank = if value[0] == 0 { "A" } else { "B" };
        println!(
            "{did:#06X} = active bank {bank}, A healthy: {}, B healthy: {}, switch pending: {}",
            value[1] != 0,
            value[2] != 0,
            value[3] != 0
        );
        return Ok(());
    }

    let printable = !value.is_empty() && value.iter().all(|b| b.is_ascii_graphic() || *b == b' ');
    if printable {
        println!("{did:#06X} = {}", String::from_utf8_lossy(&value));
    } else {
        println!("{did:#06X} = {}", hex::encode(&value));
    }
    Ok(())
}
