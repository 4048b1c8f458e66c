//! In-memory tenant admin service for integration tests.
//!
//! Holds a set of site titles. Sessions create sites against it and can be
//! told to answer the next N calls with a throttling error, like a real
//! admin endpoint under load.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use msp_core::pool::{AuthMethod, ConnectionKey, Connector};

#[derive(Debug, Default)]
pub struct SiteAdmin {
    sites: Mutex<BTreeSet<String>>,
    throttled_calls: Mutex<u32>,
    connects: AtomicU32,
    create_calls: AtomicU32,
}

impl SiteAdmin {
    pub fn with_existing(titles: &[&str]) -> Arc<Self> {
        let admin = Self::default();
        admin
            .sites
            .lock()
            .unwrap()
            .extend(titles.iter().map(|t| t.to_string()));
        Arc::new(admin)
    }

    /// Answer the next `n` create calls with HTTP 429.
    pub fn throttle_next(&self, n: u32) {
        *self.throttled_calls.lock().unwrap() = n;
    }

    pub fn sites(&self) -> Vec<String> {
        self.sites.lock().unwrap().iter().cloned().collect()
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct AdminSession {
    pub tenant: String,
    admin: Arc<SiteAdmin>,
}

impl AdminSession {
    /// Create a site and return its relative URL.
    pub async fn create_site(&self, title: &str) -> anyhow::Result<String> {
        self.admin.create_calls.fetch_add(1, Ordering::SeqCst);
        let throttled = {
            let mut left = self.admin.throttled_calls.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                true
            } else {
                false
            }
        };
        if throttled {
            anyhow::bail!("HTTP 429 Too Many Requests: the request has been throttled");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let url = format!("/sites/{}", title.to_lowercase());
        if !self.admin.sites.lock().unwrap().insert(title.to_string()) {
            anyhow::bail!("A site already exists at url {url}");
        }
        Ok(url)
    }
}

#[derive(Debug)]
pub struct AdminConnector {
    pub admin: Arc<SiteAdmin>,
}

#[async_trait]
impl Connector for AdminConnector {
    type Session = AdminSession;

    async fn connect(&self, key: &ConnectionKey, _auth: AuthMethod) -> anyhow::Result<AdminSession> {
        self.admin.connects.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(AdminSession {
            tenant: key.tenant.clone(),
            admin: Arc::clone(&self.admin),
        })
    }

    async fn probe(&self, _session: &AdminSession) -> anyhow::Result<()> {
        Ok(())
    }
}
