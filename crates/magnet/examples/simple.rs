//! Serve the same script several times and watch the cache work.
//!
//! Run with: `cargo run --example simple -- path/to/script.lua`

use std::io::{self, Write};

use magnet::{HostConfig, ScriptHost};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(1)
        .ok_or("usage: simple <script.lua>")?;

    let mut host = ScriptHost::new(HostConfig::default())?;
    let mut stdout = io::stdout().lock();

    for request in 1..=3 {
        writeln!(stdout, "--- request {request} ---")?;
        let outcome = host.serve(Some(&path), &mut stdout)?;
        writeln!(stdout)?;
        writeln!(stdout, "--- {outcome:?} ---")?;
    }

    if let Some(entry) = host.cache().entry(&path) {
        println!(
            "compiled from mtime {}, reused {} times, executed {} times",
            entry.mtime, entry.hit_count, entry.executions
        );
    }
    println!("served: {}", host.counters().total_served);

    Ok(())
}
