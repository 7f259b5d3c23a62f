//! Routine command - start one routine and report its status byte

use anyhow::{bail, Context, Result};
use zgw_uds::{routine_sub_function, service_id, ServiceResponse};

use crate::client::TesterLink;

pub async fn routine(link: &mut TesterLink, id: u16) -> Result<()> {
    let request = vec![
        service_id::ROUTINE_CONTROL,
        routine_sub_function::START_ROUTINE,
        (id >> 8) as u8,
        id as u8,
    ];
    match link.request(request).await? {
        ServiceResponse::Positive { data, .. } => {
            let status = *data
                .get(3)
                .context("routine response carries no status byte")?;
            if status == 0 {
                println!("routine {id:#06X}: ok");
                Ok(())
            } else {
                bail!("routine {id:#06X} reported failure (status {status:#04X})")
            }
        }
        ServiceResponse::Negative { nrc, .. } => bail!("routine rejected: {nrc}"),
    }
}
