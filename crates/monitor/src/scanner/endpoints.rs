use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use coffer_chains::ChainError;
use coffer_storage::models::ScannerEndpoint;

use super::ScannerContext;
use crate::error::{InitFailure, QueryFailure};
use crate::rate_limiter::RateLimitHandle;

/// One configured endpoint: its client and the limiter bucket it draws from.
pub struct Endpoint<C> {
    pub url: String,
    pub client: C,
    pub limiter: RateLimitHandle,
}

impl<C> Endpoint<C> {
    /// Run one client call under this endpoint's limiter key.
    pub async fn call<'a, T, F, Fut>(&'a self, op: F) -> Result<T, QueryFailure>
    where
        F: FnOnce(&'a C) -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        Ok(self.limiter.execute(|| op(&self.client)).await??)
    }
}

/// Enabled endpoints of a scanner, handed out round-robin.
pub struct EndpointPool<C> {
    endpoints: Vec<Endpoint<C>>,
    cursor: AtomicUsize,
}

impl<C> EndpointPool<C> {
    pub fn new(endpoints: Vec<Endpoint<C>>) -> Result<Self, InitFailure> {
        if endpoints.is_empty() {
            return Err(InitFailure::NoEndpoint);
        }
        Ok(Self {
            endpoints,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Build a client per enabled endpoint of the scanner's configuration.
    pub fn connect<F>(ctx: &ScannerContext, mut connect: F) -> Result<Self, InitFailure>
    where
        F: FnMut(&ScannerEndpoint) -> Result<C, ChainError>,
    {
        let endpoints = ctx
            .config
            .endpoints
            .iter()
            .filter(|e| e.is_enabled)
            .map(|e| {
                Ok(Endpoint {
                    url: e.endpoint.clone(),
                    client: connect(e)?,
                    limiter: ctx.limiter.handle(e.limiter_key()),
                })
            })
            .collect::<Result<Vec<_>, ChainError>>()?;
        Self::new(endpoints)
    }

    pub fn next(&self) -> &Endpoint<C> {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        &self.endpoints[i]
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
