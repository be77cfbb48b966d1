//! Interest sending command.

use anyhow::{Context, Result};
use log::{debug, info};
use rand::RngCore;
use rust_ccnd_common::content::{content_value, parse_content_object};
use rust_ccnd_common::interest::{InterestBuilder, AOK_DEFAULT, AOK_STALE};
use rust_ccnd_common::name::Name;
use std::io::Write;
use std::time::{Duration, Instant};

use crate::utils::{connect, read_message};

/// Sends one Interest over the IPC socket and prints the answer.
pub fn send_interest(name_str: &str, timeout_ms: u64, scope: Option<u64>, stale: bool) -> Result<()> {
    info!(
        "sending Interest: name={}, timeout={}ms",
        name_str, timeout_ms
    );
    let name = Name::from_uri(name_str).context("invalid name")?;

    let mut nonce = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut nonce);
    let mut builder = InterestBuilder::new(name)
        .nonce(nonce.to_vec())
        .lifetime(Duration::from_millis(timeout_ms));
    if stale {
        builder = builder.answer_origin(AOK_DEFAULT | AOK_STALE);
    }
    if let Some(scope) = scope {
        builder = builder.scope(scope);
    }
    let wire = builder.build();

    let mut stream = connect()?;
    stream.write_all(&wire).context("send failed")?;
    debug!("interest of {} bytes sent", wire.len());

    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        match read_message(&mut stream, deadline)? {
            None => {
                println!("Timeout after {}ms", timeout_ms);
                return Ok(());
            }
            Some(msg) => {
                let pco = match parse_content_object(&msg) {
                    Ok(p) => p,
                    Err(e) => {
                        // not for us (piggybacked interest or such); keep reading
                        debug!("skipping non-content message: {}", e);
                        continue;
                    }
                };
                let mut display = Name::new();
                for i in 0..pco.ncomps() {
                    let range = pco.comp_range(i);
                    let value =
                        rust_ccnd_common::coding::component_value(&msg, range)?;
                    display.push(rust_ccnd_common::name::Component::new(value.to_vec()));
                }
                println!("Name: {}", display);
                let payload = content_value(&msg, &pco)?;
                match std::str::from_utf8(payload) {
                    Ok(text) => println!("Content: {}", text),
                    Err(_) => println!("Content: {} bytes (binary)", payload.len()),
                }
                if let Some(fresh) = pco.freshness_seconds {
                    println!("FreshnessSeconds: {}", fresh);
                }
                return Ok(());
            }
        }
    }
}
