//! Worker-id derivation.
//!
//! The only contract is a string stable for the worker's lifetime. On
//! cloud hosts the instance id from the metadata endpoint is used; the
//! probe times out quickly so machines outside the cloud don't stall on it.

use std::time::Duration;

const EC2_INSTANCE_ID_URL: &str = "http://169.254.169.254/latest/meta-data/instance-id";

pub async fn derive_worker_id() -> String {
    if let Some(instance_id) = probe_instance_metadata().await {
        return instance_id;
    }

    if let Ok(hostname) = std::env::var("HOSTNAME") {
        if !hostname.is_empty() {
            return hostname;
        }
    }

    format!("worker-{}", std::process::id())
}

async fn probe_instance_metadata() -> Option<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(100))
        .build()
        .ok()?;

    let response = client.get(EC2_INSTANCE_ID_URL).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }

    let instance_id = response.text().await.ok()?;
    (!instance_id.is_empty()).then_some(instance_id)
}
