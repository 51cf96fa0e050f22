//! Common test utilities and helpers
//!
//! - Console fixtures wired to the in-memory adapters
//! - Payload and image builders
//! - Polling helper for background work

#![allow(dead_code)]

use bytes::Bytes;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use stockpile::console::local_db::LocalDatabase;
use stockpile::console::offline::RetryPolicy;
use stockpile::console::remote::{MemoryRemoteStore, MemoryResourceHost};
use stockpile::console::sync::{ConnectivityMonitor, MonitorConfig};
use stockpile::console::{Adapters, Console};
use stockpile::shared::config::ResourceSettings;
use stockpile::shared::{Fields, SchemaRegistry};

/// A console plus handles on its in-memory adapters
pub struct TestConsole {
    pub console: Console,
    pub remote: Arc<MemoryRemoteStore>,
    pub host: Arc<MemoryResourceHost>,
}

/// Console over `db` with an undebounced monitor that starts offline
pub async fn console_on(
    db: LocalDatabase,
    remote: Arc<MemoryRemoteStore>,
    host: Arc<MemoryResourceHost>,
) -> TestConsole {
    let adapters = Adapters {
        remote: remote.clone(),
        resources: host.clone(),
        probe: None,
    };
    let monitor = ConnectivityMonitor::new(MonitorConfig {
        debounce: Duration::ZERO,
        ..MonitorConfig::default()
    });
    let console = Console::assemble(
        db,
        adapters,
        SchemaRegistry::builtin(),
        monitor,
        RetryPolicy::immediate(3),
        ResourceSettings::default(),
        Duration::from_millis(100),
    )
    .await
    .expect("console should assemble");

    TestConsole {
        console,
        remote,
        host,
    }
}

/// Console over a fresh in-memory database and fresh adapters
pub async fn memory_console() -> TestConsole {
    let db = LocalDatabase::in_memory()
        .await
        .expect("in-memory database should open");
    console_on(
        db,
        Arc::new(MemoryRemoteStore::new()),
        Arc::new(MemoryResourceHost::new()),
    )
    .await
}

/// Object payload from a `json!` literal
pub fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

/// A solid PNG of the given size
pub fn png(width: u32, height: u32) -> Bytes {
    let pixels = vec![180u8; (width * height * 3) as usize];
    let mut out = Vec::new();
    PngEncoder::new(&mut out)
        .write_image(&pixels, width, height, ExtendedColorType::Rgb8)
        .expect("png should encode");
    Bytes::from(out)
}

/// Poll `condition` until it holds or five seconds pass
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
