//! Retransmission of congested sends.
//!
//! A send that the transport only partially accepted is retried after
//! `base_delay`, then after `base * factor^(n-1)` for the n-th retry, until
//! it is accepted in full, the destination becomes unreachable, or the
//! messenger stops. Retries never give up on their own.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};

use crate::lifecycle::Shutdown;
use crate::net::Transport;
use crate::observability::metrics;
use crate::resilience::RetransmitPolicy;

pub struct Retransmitter {
    runtime: Option<Runtime>,
    policy: RetransmitPolicy,
    shutdown: Shutdown,
    in_flight: Arc<AtomicUsize>,
}

impl Retransmitter {
    pub fn new(policy: RetransmitPolicy, shutdown: Shutdown) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ns-retransmit")
            .enable_time()
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
            policy,
            shutdown,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Messages currently waiting for a retry.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Keep retrying `payload` to `addr` on `transport`.
    pub fn schedule(&self, transport: Transport, addr: SocketAddr, payload: Arc<Vec<u8>>) {
        let Some(runtime) = &self.runtime else {
            return;
        };
        let policy = self.policy.clone();
        let shutdown = self.shutdown.clone();
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::SeqCst);

        runtime.spawn(async move {
            let mut stop = shutdown.subscribe();
            let mut attempt = 1;
            while !shutdown.is_triggered() {
                let delay = policy.delay_for(attempt);
                tracing::debug!(peer = %addr, attempt, delay_ms = delay.as_millis() as u64, "Scheduling retransmission");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.recv() => break,
                }

                metrics::record_retransmission();
                match transport.send(addr, &payload) {
                    Ok(sent) if sent == payload.len() => {
                        tracing::debug!(peer = %addr, attempt, "Retransmission accepted");
                        break;
                    }
                    Ok(sent) => {
                        tracing::debug!(peer = %addr, attempt, sent, len = payload.len(), "Still congested");
                        attempt = attempt.saturating_add(1);
                    }
                    Err(e) => {
                        tracing::warn!(peer = %addr, attempt, error = %e, "Retransmission failed, dropping message");
                        break;
                    }
                }
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

impl Drop for Retransmitter {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for Retransmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retransmitter")
            .field("policy", &self.policy)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
