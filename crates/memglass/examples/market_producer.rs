// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Trading-engine style producer.
//!
//! Publishes a handful of securities and updates their quotes and positions
//! in a loop. Run `market_observer` (or `memglass-shm-viewer`) from another
//! terminal to watch the values live.

use memglass::{Atomicity, Config, Primitive, Session, TypeDescriptor};
use std::mem::offset_of;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Default)]
#[repr(C)]
struct Quote {
    bid_price: i64,
    ask_price: i64,
    bid_size: u32,
    ask_size: u32,
    timestamp_ns: u64,
}

#[derive(Clone, Copy, Default)]
#[repr(C)]
struct Security {
    quote: Quote,
    symbol_id: u32,
    _pad: u32,
}

fn register_types(session: &Session) -> Option<u32> {
    let quote_id = session.register_type(
        TypeDescriptor::builder::<Quote>("Quote")
            .field("bid_price", offset_of!(Quote, bid_price), Primitive::Int64, Atomicity::None)
            .field("ask_price", offset_of!(Quote, ask_price), Primitive::Int64, Atomicity::None)
            .field("bid_size", offset_of!(Quote, bid_size), Primitive::UInt32, Atomicity::None)
            .field("ask_size", offset_of!(Quote, ask_size), Primitive::UInt32, Atomicity::None)
            .field(
                "timestamp_ns",
                offset_of!(Quote, timestamp_ns),
                Primitive::UInt64,
                Atomicity::None,
            )
            .build(),
    )?;

    session.register::<Security>(
        TypeDescriptor::builder::<Security>("Security")
            .nested_field(
                "quote",
                offset_of!(Security, quote),
                std::mem::size_of::<Quote>(),
                quote_id,
                Atomicity::None,
            )
            .field(
                "symbol_id",
                offset_of!(Security, symbol_id),
                Primitive::UInt32,
                Atomicity::None,
            )
            .read_only()
            // Pre-flattened aliases for the hot fields.
            .field(
                "quote.bid_price",
                offset_of!(Security, quote) + offset_of!(Quote, bid_price),
                Primitive::Int64,
                Atomicity::None,
            )
            .field(
                "quote.ask_price",
                offset_of!(Security, quote) + offset_of!(Quote, ask_price),
                Primitive::Int64,
                Atomicity::None,
            )
            .build(),
    )
}

fn main() {
    let session = match Session::init("trading_engine", Config::default()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to initialize session: {e}");
            std::process::exit(1);
        }
    };

    if register_types(&session).is_none() {
        eprintln!("type registration failed");
        std::process::exit(1);
    }

    println!("trading engine started (pid {})", std::process::id());
    println!("observe with: memglass-shm-viewer trading_engine");

    let symbols = ["AAPL", "MSFT", "GOOG", "AMZN", "META"];
    let mut securities = Vec::new();
    for (i, symbol) in symbols.iter().enumerate() {
        let Some(mut sec) = session.create::<Security>(symbol) else {
            eprintln!("failed to create {symbol}");
            continue;
        };
        sec.symbol_id = i as u32;
        sec.quote.bid_price = 15_000 + i as i64 * 1_000;
        sec.quote.ask_price = sec.quote.bid_price + 5;
        sec.quote.bid_size = 100;
        sec.quote.ask_size = 100;
        securities.push(sec);
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc_handler(move || running.store(false, Ordering::Relaxed));
    }

    let mut tick: u64 = 0;
    while running.load(Ordering::Relaxed) {
        tick += 1;
        for sec in &mut securities {
            let drift = ((tick as i64).wrapping_mul(31 + sec.symbol_id as i64) % 7) - 3;
            sec.quote.bid_price += drift;
            sec.quote.ask_price = sec.quote.bid_price + 5;
            sec.quote.timestamp_ns = tick;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    println!("shutting down");
    drop(securities);
    session.shutdown();
}

fn ctrlc_handler(f: impl Fn() + Send + Sync + 'static) {
    static HANDLER: std::sync::OnceLock<Box<dyn Fn() + Send + Sync>> = std::sync::OnceLock::new();
    let _ = HANDLER.set(Box::new(f));

    extern "C" fn on_signal(_: libc::c_int) {
        if let Some(f) = HANDLER.get() {
            f();
        }
    }

    // SAFETY: installs an async-signal handler that only flips a relaxed
    // atomic through the leaked closure.
    unsafe {
        let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}
