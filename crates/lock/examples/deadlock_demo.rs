// Copyright 2024 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Two transactions lock `orders` and `stock` in opposite order; the lighter
//! one is rejected and the heavier one completes.
//!
//! Run with `RUST_LOG=txlock=debug` for the full arbitration trace.

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, util::SubscriberInitExt};
use txlock::{DeadlockDetector, Identity, LockConfig, LockType, NamespaceLock};

fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(std::io::stdout().is_terminal())
                .with_thread_names(true),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logger();

    let config = LockConfig::from_env()?;
    let detector = Arc::new(DeadlockDetector::new(&config.detector)?);
    let lock = NamespaceLock::local(detector.clone());
    let timeout = Duration::from_secs(5);

    let (light, heavy) = (Identity::new(1), Identity::new(2));
    assert!(lock.apply_table(light, "orders", LockType::Exclusive, 5, timeout).await);

    let heavy_lock = lock.clone();
    let heavy_tx = tokio::spawn(async move {
        let guard = heavy_lock.guard(heavy);
        let orders = heavy_lock.apply_table(heavy, "orders", LockType::Exclusive, 9, timeout).await;
        tracing::info!("Transaction {} got orders: {}", heavy, orders);
        guard.release().await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(lock.apply_table(heavy, "stock", LockType::Exclusive, 9, timeout).await);

    let stock = lock.apply_table(light, "stock", LockType::Exclusive, 5, timeout).await;
    tracing::info!("Transaction {} got stock: {}", light, stock);
    if !stock {
        tracing::info!("Transaction {} rolls back", light);
        lock.release(light).await;
    }

    heavy_tx.await?;
    tracing::info!("Detector stats: {}", serde_json::to_string(&detector.stats())?);
    Ok(())
}
