// Shared helpers for the server's unit tests.
//
// Env-mutating tests must also be `#[serial]`; the guard only restores state.
// HTTP helpers keep tests from hanging: short client timeouts, no proxy
// lookups, readiness polling instead of sleeps.
use anyhow::{Context, Result};
use reqwest::{Client, redirect::Policy};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub struct EnvGuard {
    key: &'static str,
    prev: Option<String>,
}

impl EnvGuard {
    pub fn set(key: &'static str, value: &str) -> Self {
        let prev = std::env::var(key).ok();
        unsafe {
            std::env::set_var(key, value);
        }
        Self { key, prev }
    }

    pub fn unset(key: &'static str) -> Self {
        let prev = std::env::var(key).ok();
        unsafe {
            std::env::remove_var(key);
        }
        Self { key, prev }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(value) => unsafe {
                std::env::set_var(self.key, value);
            },
            None => unsafe {
                std::env::remove_var(self.key);
            },
        }
    }
}

pub fn build_test_client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(1))
        .no_proxy()
        .redirect(Policy::none())
        .build()
        .context("build test http client")
}

pub async fn wait_for_listen(addr: SocketAddr) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(1);
    loop {
        match tokio::net::TcpStream::connect(addr).await {
            Ok(_) => return Ok(()),
            Err(err) => {
                if Instant::now() >= deadline {
                    return Err(anyhow::anyhow!("server not ready at {addr}: {err}"));
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}
