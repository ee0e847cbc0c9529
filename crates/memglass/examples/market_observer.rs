// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Trading-engine style observer.
//!
//! Attaches to the session published by `market_producer` and prints the
//! live quotes once a second. The producer is never interrupted.

use memglass::Observer;
use std::time::Duration;

fn main() {
    let mut observer = Observer::new("trading_engine");
    if let Err(e) = observer.connect() {
        eprintln!("cannot attach to trading_engine: {e}");
        eprintln!("is market_producer running?");
        std::process::exit(1);
    }

    println!(
        "attached to trading_engine (producer pid {})",
        observer.producer_pid()
    );

    loop {
        observer.refresh();

        let objects = observer.objects();
        if objects.is_empty() {
            println!("no live securities");
        }
        for info in &objects {
            let Some(view) = observer.get(info) else {
                continue;
            };
            let bid = view.field("quote.bid_price").read::<i64>().unwrap_or(0);
            let ask = view.field("quote.ask_price").read::<i64>().unwrap_or(0);
            let ts = view
                .field("quote")
                .field("timestamp_ns")
                .read::<u64>()
                .unwrap_or(0);
            println!("{:<6} bid={bid:<8} ask={ask:<8} tick={ts}", info.label);
        }
        println!();

        std::thread::sleep(Duration::from_secs(1));
    }
}
