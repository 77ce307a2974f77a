//! Fixed-window per-IP limiter guarding `/auth`.

use crate::error::AppError;
use crate::server::config::SecurityConfig;
use crate::utils::client_ip::client_ip;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded, retry after {retry_after}s")]
    Exceeded { retry_after: u64 },
}

impl From<RateLimitError> for AppError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Exceeded { retry_after } => AppError::RateLimited { retry_after },
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

pub struct RateLimitService {
    buckets: DashMap<IpAddr, Window>,
    max_requests: u32,
    window: Duration,
    trust_forwarded_headers: bool,
}

impl RateLimitService {
    pub fn new(max_requests: u32, window: Duration, trust_forwarded_headers: bool) -> Self {
        Self {
            buckets: DashMap::new(),
            max_requests,
            window,
            trust_forwarded_headers,
        }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(
            config.rate_limit_requests,
            config.rate_limit_window(),
            config.trust_forwarded_headers,
        )
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn check(&self, ip: IpAddr) -> Result<(), RateLimitError> {
        self.check_at(ip, Instant::now())
    }

    /// Counts one request from `ip` at `now`.
    pub fn check_at(&self, ip: IpAddr, now: Instant) -> Result<(), RateLimitError> {
        let mut entry = self.buckets.entry(ip).or_insert(Window {
            started: now,
            count: 0,
        });

        let elapsed = now.saturating_duration_since(entry.started);
        if elapsed >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count >= self.max_requests {
            let remaining = self.window.saturating_sub(elapsed);
            return Err(RateLimitError::Exceeded {
                retry_after: remaining.as_secs().max(1),
            });
        }

        entry.count += 1;
        Ok(())
    }

    /// Drops buckets whose window has elapsed; returns how many were removed.
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    pub fn prune_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, window| now.saturating_duration_since(window.started) < self.window);
        before.saturating_sub(self.buckets.len())
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }

    pub fn client_ip(&self, request: &Request) -> IpAddr {
        client_ip(
            request.headers(),
            request.extensions(),
            self.trust_forwarded_headers,
        )
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimitService>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let ip = limiter.client_ip(&request);
    if let Err(err) = limiter.check(ip) {
        crate::metrics::track_rate_limit_exceeded();
        crate::metrics::track_auth_attempt("rate_limited");
        info!(ip = %ip, "Rate limit exceeded");
        return Err(err.into());
    }
    Ok(next.run(request).await)
}
