//! # Sluice Demos
//!
//! This crate contains runnable servers demonstrating how to use the sluice workspace.
//!
//! ## Running Demos
//!
//! Run a demo with:
//!
//! ```bash
//! cargo run -p demos --example echo_server -- --debug --workers 8 --ordered
//! cargo run -p demos --example chat_server -- --port 8080
//! ```
//!
//! then connect with `nc 127.0.0.1 8080`.

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

use std::io::Write;
use std::str::FromStr;

use crossbeam_channel::{Receiver, bounded};

/// Installs the demo log format when `debug` is set.
pub fn init_logging(debug: bool, log_level: &str) -> anyhow::Result<()> {
    let log_level = log::LevelFilter::from_str(log_level)?;
    if debug {
        env_logger::Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{}:{} [{}] {} - {}",
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0),
                    record.level(),
                    chrono::Local::now().format("%H:%M:%S.%6f"),
                    record.args()
                )
            })
            .filter(None, log_level)
            .init();
    }
    Ok(())
}

/// Returns a channel that receives once Ctrl-C is pressed.
pub fn stop_signal() -> anyhow::Result<Receiver<()>> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })?;
    Ok(stop_rx)
}
