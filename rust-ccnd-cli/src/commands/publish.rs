//! Content publishing command.

use anyhow::{Context, Result};
use log::info;
use rust_ccnd_common::content::ContentObjectBuilder;
use rust_ccnd_common::name::Name;
use std::io::Write;

use crate::utils::connect;

/// Encodes a ContentObject and hands it to the daemon's store.
pub fn publish(name_str: &str, content: &str, freshness: Option<u64>) -> Result<()> {
    let name = Name::from_uri(name_str).context("invalid name")?;
    let mut builder = ContentObjectBuilder::new(name.clone(), content.as_bytes().to_vec());
    if let Some(fresh) = freshness {
        builder = builder.freshness_seconds(fresh);
    }
    let wire = builder.build();

    let mut stream = connect()?;
    stream.write_all(&wire).context("send failed")?;
    info!("published {} ({} bytes on the wire)", name, wire.len());
    println!("published {} ({} bytes)", name, content.len());
    Ok(())
}
